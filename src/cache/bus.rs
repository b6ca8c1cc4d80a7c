//! Broadcast channel for cache invalidations published outside the coordinator

use super::QueryCache;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What to drop from attached caches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every key mentioning this id
    Entity(String),
    /// Every key with this prefix
    Category(String),
    All,
}

#[derive(Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<Invalidation>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(128)
    }
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of listeners reached
    pub fn publish(&self, invalidation: Invalidation) -> usize {
        self.sender.send(invalidation).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.sender.subscribe()
    }

    /// Apply every published invalidation to `cache` until the cache is dropped.
    ///
    /// A listener that falls behind clears the cache, since it cannot tell
    /// which entries the missed messages covered.
    pub fn attach<V>(&self, cache: &Arc<QueryCache<V>>) -> JoinHandle<()>
    where
        V: Clone + Send + Sync + 'static,
    {
        let cache: Weak<QueryCache<V>> = Arc::downgrade(cache);
        let mut receiver = self.subscribe();

        tokio::spawn(async move {
            loop {
                let message = receiver.recv().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match message {
                    Ok(invalidation) => {
                        let removed = cache.apply(&invalidation);
                        debug!("Applied {:?}, {} entries removed", invalidation, removed);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Cache listener missed {} invalidations, clearing", missed);
                        cache.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_attached_cache_follows_bus() {
        let bus = InvalidationBus::default();
        let cache = Arc::new(QueryCache::new(10, Duration::from_secs(60)));
        cache.set("folders:file:f1:5", 1);
        cache.set("files:similar:abc:5", 2);
        cache.set("folders:all", 3);

        let listener = bus.attach(&cache);

        assert_eq!(bus.publish(Invalidation::Entity("f1".into())), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cache.has("folders:file:f1:5"));

        bus.publish(Invalidation::Category("files:".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.len(), 1);

        bus.publish(Invalidation::All);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_empty());

        listener.abort();
    }

    #[tokio::test]
    async fn test_listener_ends_with_bus() {
        let bus = InvalidationBus::default();
        let cache: Arc<QueryCache<u32>> = Arc::new(QueryCache::new(10, Duration::from_secs(60)));
        let listener = bus.attach(&cache);

        drop(bus);
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
