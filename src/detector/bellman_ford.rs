//! Negative-cycle detection over the rate graph.
//!
//! Edge weights are negative log gains, so a cycle whose product of gains
//! exceeds 1 sums to a strictly negative total. Bellman-Ford runs from every
//! vertex; the graph is tens of vertices, so full coverage is cheaper than
//! reasoning about disconnected components.

use std::collections::HashSet;

use crate::graph::RateGraph;

/// Strictness margin for float relaxation; keeps round-off from inventing
/// cycles whose product is exactly 1.
const EPS: f64 = 1e-12;

/// All distinct negative cycles, each as a vertex sequence in trade order
/// rotated so the smallest vertex leads. Cycles identical modulo rotation
/// are reported once.
pub fn find_negative_cycles(graph: &RateGraph) -> Vec<Vec<usize>> {
    let n = graph.vertex_count();
    if n == 0 || graph.edge_count() == 0 {
        return Vec::new();
    }

    let weights: Vec<f64> = graph.edges.iter().map(|e| e.weight()).collect();
    let mut cycles = Vec::new();
    let mut seen: HashSet<Vec<usize>> = HashSet::new();

    for source in 0..n {
        let mut dist = vec![f64::INFINITY; n];
        let mut pred: Vec<Option<usize>> = vec![None; n];
        dist[source] = 0.0;

        for _ in 1..n {
            let mut changed = false;
            for (edge, &w) in graph.edges.iter().zip(&weights) {
                if dist[edge.from].is_finite() && dist[edge.from] + w < dist[edge.to] - EPS {
                    dist[edge.to] = dist[edge.from] + w;
                    pred[edge.to] = Some(edge.from);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Any edge still relaxing reaches a negative cycle.
        for (edge, &w) in graph.edges.iter().zip(&weights) {
            if dist[edge.from].is_finite() && dist[edge.from] + w < dist[edge.to] - EPS {
                if let Some(cycle) = extract_cycle(&pred, edge.to, n) {
                    let canonical = canonicalize(&cycle);
                    if seen.insert(canonical.clone()) {
                        cycles.push(canonical);
                    }
                }
            }
        }
    }

    cycles
}

/// Walk predecessors `n` steps from a relaxing vertex (guaranteeing entry
/// into the cycle), then follow until a vertex repeats; the contained
/// segment is the cycle, returned in edge direction.
fn extract_cycle(pred: &[Option<usize>], start: usize, n: usize) -> Option<Vec<usize>> {
    let mut inside = start;
    for _ in 0..n {
        inside = pred[inside]?;
    }

    let mut cycle = vec![inside];
    let mut current = pred[inside]?;
    while current != inside {
        if cycle.len() > n {
            return None;
        }
        cycle.push(current);
        current = pred[current]?;
    }
    // Predecessor order is reverse trade order.
    cycle.reverse();
    Some(cycle)
}

/// Rotation-invariant form: the cycle rotated so its smallest vertex leads.
fn canonicalize(cycle: &[usize]) -> Vec<usize> {
    let pivot = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, &v)| v)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut out = Vec::with_capacity(cycle.len());
    out.extend_from_slice(&cycle[pivot..]);
    out.extend_from_slice(&cycle[..pivot]);
    out
}
