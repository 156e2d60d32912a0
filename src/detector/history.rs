//! Rolling per-pair price history backing the volatility gate.

use dashmap::DashMap;
use std::collections::VecDeque;

use crate::venue::Pair;

pub struct PriceHistory {
    window_secs: f64,
    series: DashMap<Pair, VecDeque<(f64, f64)>>,
}

impl PriceHistory {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs as f64,
            series: DashMap::new(),
        }
    }

    /// Push a (ts, mid) sample, drop samples older than the window and
    /// return the observed swing `(max - min) / min` over what remains.
    /// Fewer than two samples reads as zero volatility.
    pub fn record(&self, pair: &Pair, ts: f64, mid: f64) -> f64 {
        let mut entry = self.series.entry(pair.clone()).or_default();
        entry.push_back((ts, mid));
        let cutoff = ts - self.window_secs;
        while entry.front().map_or(false, |&(t, _)| t < cutoff) {
            entry.pop_front();
        }

        if entry.len() < 2 {
            return 0.0;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &(_, p) in entry.iter() {
            min = min.min(p);
            max = max.max(p);
        }
        if min <= 0.0 {
            return f64::INFINITY;
        }
        (max - min) / min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_reads_as_calm() {
        let history = PriceHistory::new(300);
        let pair = Pair::new("BTC", "USDT");
        assert_eq!(history.record(&pair, 1000.0, 30_000.0), 0.0);
    }

    #[test]
    fn swing_is_max_over_min() {
        let history = PriceHistory::new(300);
        let pair = Pair::new("BTC", "USDT");
        history.record(&pair, 1000.0, 30_000.0);
        let vol = history.record(&pair, 1001.0, 31_500.0);
        assert!((vol - 0.05).abs() < 1e-9);
    }

    #[test]
    fn samples_age_out_of_the_window() {
        let history = PriceHistory::new(300);
        let pair = Pair::new("BTC", "USDT");
        history.record(&pair, 1000.0, 30_000.0);
        // 400s later the spike is outside the window; only the two fresh
        // samples remain.
        history.record(&pair, 1400.0, 30_010.0);
        let vol = history.record(&pair, 1401.0, 30_020.0);
        assert!(vol < 0.001);
    }
}
