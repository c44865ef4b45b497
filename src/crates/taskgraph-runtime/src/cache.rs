//! Content-addressed output cache with single-flight execution.
//!
//! Maps `fingerprint = hash(canonical(taskType, input))` to a task's output.
//! The interesting property isn't the map itself — it's that at most one
//! `runFn` is ever in flight per fingerprint across all workers of a queue.
//! A second worker arriving for the same fingerprint while the first is
//! still running awaits that first run's result instead of repeating it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// A fingerprint is a stable hash of `(taskType, canonical(input))`,
/// computed by the caller (the graph runner knows how to canonicalise a
/// task's input; the cache only ever sees the resulting string).
pub type Fingerprint = String;

enum Slot {
    /// A run is in flight; latecomers subscribe to this channel instead of
    /// starting their own.
    InFlight(broadcast::Sender<Result<Value, String>>),
    Done(Value),
}

/// What a caller should do after calling [`OutputCache::begin`].
pub enum CacheLease {
    /// Caller owns the execution and must call [`OutputCache::complete`] or
    /// [`OutputCache::fail`] when done.
    Owner,
    /// Another worker owns the in-flight execution; wait on this receiver
    /// for its result.
    Follow(broadcast::Receiver<Result<Value, String>>),
    /// Already computed; use this value directly (`SKIPPED` at the queue layer).
    Cached(Value),
}

/// A change notification emitted by [`OutputCache::subscribe_events`],
/// mirroring `queue.rs`'s `JobChange`/`subscribe_to_changes` for the cache's
/// own two observable events.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// `output_saved`: a fingerprint's value was just persisted.
    Saved(Fingerprint),
    /// `output_cleared`: the whole cache was wiped.
    Cleared,
}

pub struct OutputCache {
    entries: AsyncMutex<HashMap<Fingerprint, Slot>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for OutputCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputCache {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(64);
        Self {
            entries: AsyncMutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to `output_saved`/`output_cleared` events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Look up a fingerprint without affecting single-flight bookkeeping.
    pub async fn get(&self, fingerprint: &str) -> Option<Value> {
        match self.entries.lock().await.get(fingerprint) {
            Some(Slot::Done(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Register intent to execute `fingerprint`. Exactly one caller per
    /// fingerprint gets back [`CacheLease::Owner`]; everyone else either
    /// gets the cached value or a receiver that resolves when the owner
    /// finishes.
    pub async fn begin(&self, fingerprint: &str) -> CacheLease {
        let mut entries = self.entries.lock().await;
        match entries.get(fingerprint) {
            Some(Slot::Done(v)) => CacheLease::Cached(v.clone()),
            Some(Slot::InFlight(tx)) => CacheLease::Follow(tx.subscribe()),
            None => {
                let (tx, _rx) = broadcast::channel(1);
                entries.insert(fingerprint.to_string(), Slot::InFlight(tx));
                CacheLease::Owner
            }
        }
    }

    /// The owner's run succeeded: persist the value and wake followers.
    pub async fn complete(&self, fingerprint: &str, output: Value) {
        let mut entries = self.entries.lock().await;
        if let Some(Slot::InFlight(tx)) = entries.get(fingerprint) {
            let _ = tx.send(Ok(output.clone()));
        }
        entries.insert(fingerprint.to_string(), Slot::Done(output));
        drop(entries);
        let _ = self.events.send(CacheEvent::Saved(fingerprint.to_string()));
    }

    /// The owner's run failed: wake followers with the error, but do not
    /// cache anything — the next caller becomes the new owner and retries.
    pub async fn fail(&self, fingerprint: &str, message: String) {
        let mut entries = self.entries.lock().await;
        if let Some(Slot::InFlight(tx)) = entries.remove(fingerprint) {
            let _ = tx.send(Err(message));
        }
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
        let _ = self.events.send(CacheEvent::Cleared);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

pub type SharedOutputCache = Arc<OutputCache>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn owner_then_cached() {
        let cache = OutputCache::new();
        match cache.begin("fp1").await {
            CacheLease::Owner => {}
            _ => panic!("expected Owner"),
        }
        cache.complete("fp1", json!({"x": 1})).await;

        match cache.begin("fp1").await {
            CacheLease::Cached(v) => assert_eq!(v, json!({"x": 1})),
            _ => panic!("expected Cached"),
        }
    }

    #[tokio::test]
    async fn second_requester_follows_in_flight_owner() {
        let cache = Arc::new(OutputCache::new());
        let owner_lease = cache.begin("fp2").await;
        assert!(matches!(owner_lease, CacheLease::Owner));

        let follower_cache = cache.clone();
        let follower = tokio::spawn(async move {
            match follower_cache.begin("fp2").await {
                CacheLease::Follow(mut rx) => rx.recv().await.unwrap(),
                _ => panic!("expected Follow"),
            }
        });

        // Give the follower a chance to subscribe before the owner completes.
        tokio::task::yield_now().await;
        cache.complete("fp2", json!({"ok": true})).await;

        let result = follower.await.unwrap().unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn failed_owner_does_not_poison_the_cache() {
        let cache = OutputCache::new();
        assert!(matches!(cache.begin("fp3").await, CacheLease::Owner));
        cache.fail("fp3", "boom".into()).await;
        // No cached value remains; a new caller becomes the owner again.
        assert!(matches!(cache.begin("fp3").await, CacheLease::Owner));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = OutputCache::new();
        cache.begin("fp4").await;
        cache.complete("fp4", json!(1)).await;
        assert_eq!(cache.len().await, 1);
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn complete_and_clear_emit_events() {
        let cache = OutputCache::new();
        let mut events = cache.subscribe_events();

        cache.begin("fp5").await;
        cache.complete("fp5", json!(1)).await;
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Saved(fp) if fp == "fp5"));

        cache.clear().await;
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Cleared));
    }
}
