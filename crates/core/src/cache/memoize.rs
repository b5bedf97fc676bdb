//! Memoized stream factories.

use std::fmt::Debug;
use std::hash::Hash;

use super::{CacheConfig, KeyedObservableCache, QueryStream, Subscription};

type Projection<A, K> = Box<dyn Fn(&A) -> K + Send + Sync>;
type Factory<A, V> = Box<dyn Fn(&A) -> QueryStream<V> + Send + Sync>;

/// A stream factory wrapped with a [`KeyedObservableCache`].
///
/// Arguments are projected to a cache key; the factory runs only for keys
/// without a live entry. Equal keys share one upstream subscription.
pub struct Memoized<A: ?Sized, K, V> {
    cache: KeyedObservableCache<K, V>,
    projection: Projection<A, K>,
    factory: Factory<A, V>,
}

impl<V> Memoized<(), (), V>
where
    V: Clone + Send + Sync + 'static,
{
    /// A zero-argument query: one shared stream for the whole cache.
    pub fn singleton<F>(name: &'static str, config: CacheConfig, factory: F) -> Self
    where
        F: Fn() -> QueryStream<V> + Send + Sync + 'static,
    {
        Self::keyed(name, config, move |_: &()| factory(), |_: &()| ())
    }
}

impl<A, V> Memoized<A, A, V>
where
    A: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Keyed by the argument itself.
    pub fn by_identity<F>(name: &'static str, config: CacheConfig, factory: F) -> Self
    where
        F: Fn(&A) -> QueryStream<V> + Send + Sync + 'static,
    {
        Self::keyed(name, config, factory, A::clone)
    }
}

impl<A, K, V> Memoized<A, K, V>
where
    A: ?Sized,
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Keyed by `projection(args)`.
    pub fn keyed<F, P>(name: &'static str, config: CacheConfig, factory: F, projection: P) -> Self
    where
        F: Fn(&A) -> QueryStream<V> + Send + Sync + 'static,
        P: Fn(&A) -> K + Send + Sync + 'static,
    {
        Self {
            cache: KeyedObservableCache::new(name, config),
            projection: Box::new(projection),
            factory: Box::new(factory),
        }
    }

    /// Subscribe to the shared stream for `args`.
    pub fn call(&self, args: &A) -> Subscription<V> {
        let key = (self.projection)(args);
        self.cache.get_or_create(key, || (self.factory)(args))
    }

    pub fn cache(&self) -> &KeyedObservableCache<K, V> {
        &self.cache
    }
}
