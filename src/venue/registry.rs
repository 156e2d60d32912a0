//! Shared venue adapter handles.
//!
//! Whichever component asks first triggers construction; everyone else gets
//! the same `Arc`. `get_or_init` is idempotent under concurrent callers, so
//! the fanout, the coordinator and the router can all race on it safely.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::VenueSettings;

use super::{PaperVenue, VenueAdapter, VenueError};

pub struct VenueRegistry {
    settings: BTreeMap<String, VenueSettings>,
    handles: RwLock<HashMap<String, Arc<dyn VenueAdapter>>>,
}

impl VenueRegistry {
    pub fn new(settings: BTreeMap<String, VenueSettings>) -> Self {
        Self {
            settings,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Existing handle, or build one from config. Concurrent callers all
    /// receive the same handle; the loser of a construction race drops its
    /// candidate and adopts the winner's.
    pub async fn get_or_init(&self, venue: &str) -> Result<Arc<dyn VenueAdapter>, VenueError> {
        if let Some(handle) = self.handles.read().await.get(venue) {
            return Ok(handle.clone());
        }

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(venue) {
            return Ok(handle.clone());
        }
        let settings = self.settings.get(venue).ok_or_else(|| {
            VenueError::InvalidArgument(format!("venue {venue} is not configured"))
        })?;
        let handle = build_adapter(venue, settings)?;
        info!("initialized {} connection ({})", venue, settings.driver);
        handles.insert(venue.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle if already initialized; never constructs.
    pub async fn get(&self, venue: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.handles.read().await.get(venue).cloned()
    }

    /// Place a pre-built adapter (paper seeding, tests).
    pub async fn insert(&self, adapter: Arc<dyn VenueAdapter>) {
        self.handles
            .write()
            .await
            .insert(adapter.name().to_string(), adapter);
    }

    /// Tear a venue down; the next `get_or_init` reconnects it.
    pub async fn remove(&self, venue: &str) -> bool {
        let removed = self.handles.write().await.remove(venue);
        match removed {
            Some(handle) => {
                handle.close().await;
                info!("closed {} connection", venue);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let mut handles = self.handles.write().await;
        for (venue, handle) in handles.drain() {
            handle.close().await;
            info!("closed {} connection", venue);
        }
    }
}

fn build_adapter(
    name: &str,
    settings: &VenueSettings,
) -> Result<Arc<dyn VenueAdapter>, VenueError> {
    match settings.driver.as_str() {
        "paper" => Ok(Arc::new(
            PaperVenue::new(name, settings.taker_fee, settings.maker_fee)
                .with_request_interval(Duration::from_millis(settings.rate_limit_ms)),
        )),
        other => Err(VenueError::InvalidArgument(format!(
            "unknown venue driver {other:?} for {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry() -> VenueRegistry {
        VenueRegistry::new(Config::default().venues)
    }

    #[tokio::test]
    async fn get_or_init_is_idempotent_under_races() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(
                async move { registry.get_or_init("okx").await },
            ));
        }
        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle));
        }
    }

    #[tokio::test]
    async fn remove_then_reinit_builds_a_fresh_handle() {
        let registry = registry();
        let first = registry.get_or_init("bybit").await.unwrap();
        assert!(registry.remove("bybit").await);
        assert!(!registry.remove("bybit").await);
        let second = registry.get_or_init("bybit").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unconfigured_venue_is_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.get_or_init("mtgox").await,
            Err(VenueError::InvalidArgument(_))
        ));
    }
}
