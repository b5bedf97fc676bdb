//! Keyed observable cache.
//!
//! Memoizes factories that produce live streams. For every distinct key the
//! factory runs once and its stream is shared: all subscribers of a key are
//! fed by a single upstream subscription, and late subscribers immediately
//! receive the most recent item.
//!
//! # Retention
//!
//! [`RetentionPolicy::KeepAlive`] keeps entries for the lifetime of the cache.
//! [`RetentionPolicy::TeardownWhenIdle`] aborts the upstream when the last
//! subscriber drops and forgets the entry, so the next call runs the factory
//! again.
//!
//! # Locking
//!
//! The registry lock is always taken before an entry lock. Factories run
//! while the registry lock is held and must not call back into the same
//! cache synchronously; stream construction is expected to be lazy.

mod memoize;
mod shared;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::QueryResult;
use crate::metrics::{record_cache_lookup, record_cache_teardown};

use shared::{Entry, Release};

pub use memoize::Memoized;
pub use shared::Subscription;

/// Stream of query results, as produced by memoized factories.
pub type QueryStream<V> = Pin<Box<dyn Stream<Item = QueryResult<V>> + Send>>;

/// What happens to an entry once nobody subscribes to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the entry and its upstream for the cache lifetime.
    #[default]
    KeepAlive,
    /// Tear the upstream down when the last subscriber drops.
    TeardownWhenIdle,
}

/// Configuration shared by every memoized query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub retention: RetentionPolicy,
    /// Items buffered per subscriber before it starts skipping.
    pub channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::KeepAlive,
            channel_capacity: 64,
        }
    }
}

type Registry<K, V> = Mutex<HashMap<K, Arc<Entry<V>>>>;

/// Map from key to shared stream entry, one per memoized factory.
pub struct KeyedObservableCache<K, V> {
    name: &'static str,
    config: CacheConfig,
    entries: Arc<Registry<K, V>>,
}

impl<K, V> KeyedObservableCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        Self {
            name,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Subscribe to the shared stream for `key`, creating it with `factory`
    /// if no entry exists.
    pub fn get_or_create<F>(&self, key: K, factory: F) -> Subscription<V>
    where
        F: FnOnce() -> QueryStream<V>,
    {
        let mut entries = self.entries.lock();

        let entry = match entries.get(&key) {
            Some(entry) => {
                record_cache_lookup(self.name, true);
                trace!(cache = self.name, key = ?key, "Reusing shared stream");
                entry.clone()
            }
            None => {
                record_cache_lookup(self.name, false);
                debug!(cache = self.name, key = ?key, "Creating shared stream");
                let entry = Arc::new(Entry::new(
                    self.name,
                    factory(),
                    self.config.channel_capacity,
                ));
                entries.insert(key.clone(), entry.clone());
                entry
            }
        };

        let stream = entry.attach();
        drop(entries);

        let lease = Lease {
            key,
            entry,
            registry: Arc::downgrade(&self.entries),
            retention: self.config.retention,
        };
        Subscription::new(stream, Box::new(lease))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Active subscribers of the entry for `key`, if it exists.
    pub fn subscriber_count(&self, key: &K) -> Option<usize> {
        self.entries.lock().get(key).map(|entry| entry.subscribers())
    }
}

/// A subscriber slot on one entry.
struct Lease<K, V> {
    key: K,
    entry: Arc<Entry<V>>,
    registry: Weak<Registry<K, V>>,
    retention: RetentionPolicy,
}

impl<K, V> Release for Lease<K, V>
where
    K: Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn release(&self) {
        let registry = self.registry.upgrade();
        let mut entries = registry.as_ref().map(|registry| registry.lock());

        let remaining = self.entry.detach();
        if remaining > 0 || self.retention == RetentionPolicy::KeepAlive {
            return;
        }

        if let Some(entries) = entries.as_mut()
            && entries
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.entry))
        {
            entries.remove(&self.key);
        }
        self.entry.teardown();

        record_cache_teardown(self.entry.cache());
        debug!(cache = self.entry.cache(), key = ?self.key, "Tore down idle shared stream");
    }
}
