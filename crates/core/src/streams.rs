//! Stream combinators used to build derived queries.
//!
//! All combinators work on fallible streams and fail whole: the first error
//! of any input is emitted and the output ends.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;

use futures::{Stream, StreamExt, future, stream};
use tokio_stream::StreamMap;
use tracing::trace;

use crate::cache::QueryStream;

/// Next item of `stream`, or never if it already ended.
async fn next_or_pending<S>(stream: &mut S, done: &mut bool) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    if *done {
        return future::pending().await;
    }
    let item = stream.next().await;
    if item.is_none() {
        *done = true;
    }
    item
}

struct Latest2<A, B> {
    left: QueryStream<A>,
    right: QueryStream<B>,
    left_done: bool,
    right_done: bool,
    a: Option<A>,
    b: Option<B>,
    failed: bool,
}

/// Emit `(a, b)` with the latest value of each side once both have produced
/// one, and again on every later emission of either side.
///
/// Ends when both inputs have ended, or right after the first error.
pub fn combine_latest2<A, B>(left: QueryStream<A>, right: QueryStream<B>) -> QueryStream<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    let state = Latest2 {
        left,
        right,
        left_done: false,
        right_done: false,
        a: None,
        b: None,
        failed: false,
    };

    stream::unfold(state, |mut s| async move {
        if s.failed {
            return None;
        }
        loop {
            if s.left_done && s.right_done {
                return None;
            }
            tokio::select! {
                item = next_or_pending(&mut s.left, &mut s.left_done) => match item {
                    Some(Ok(a)) => s.a = Some(a),
                    Some(Err(e)) => {
                        s.failed = true;
                        return Some((Err(e), s));
                    }
                    None => continue,
                },
                item = next_or_pending(&mut s.right, &mut s.right_done) => match item {
                    Some(Ok(b)) => s.b = Some(b),
                    Some(Err(e)) => {
                        s.failed = true;
                        return Some((Err(e), s));
                    }
                    None => continue,
                },
            }
            if let (Some(a), Some(b)) = (&s.a, &s.b) {
                let pair = (a.clone(), b.clone());
                return Some((Ok(pair), s));
            }
        }
    })
    .boxed()
}

/// Drop consecutive `Ok` items equal to the previous one.
///
/// Works for any error type, so chain adapters can use it on raw reads.
pub fn distinct_until_changed<T, E, S>(input: S) -> Pin<Box<dyn Stream<Item = Result<T, E>> + Send>>
where
    T: Clone + PartialEq + Send + 'static,
    E: Send + 'static,
    S: Stream<Item = Result<T, E>> + Send + 'static,
{
    input
        .scan(None::<T>, |last, item| {
            let keep = match &item {
                Ok(value) if last.as_ref() == Some(value) => false,
                Ok(value) => {
                    *last = Some(value.clone());
                    true
                }
                Err(_) => true,
            };
            future::ready(Some((keep, item)))
        })
        .filter_map(|(keep, item)| future::ready(keep.then_some(item)))
        .boxed()
}

struct Join<K, V> {
    keys: QueryStream<Vec<K>>,
    keys_done: bool,
    /// Current key set, in emission order and without duplicates.
    order: Vec<K>,
    members: StreamMap<K, QueryStream<V>>,
    latest: HashMap<K, V>,
    failed: bool,
}

impl<K, V> Join<K, V>
where
    K: Eq + Hash + Clone + Debug + Unpin + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Apply a new key set: unsubscribe removed keys, subscribe added ones.
    fn reconcile<F>(&mut self, keys: Vec<K>, member: &F)
    where
        F: Fn(&K) -> QueryStream<V>,
    {
        let mut seen = HashSet::with_capacity(keys.len());
        let next: Vec<K> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();

        for gone in self.order.iter().filter(|k| !seen.contains(*k)) {
            trace!(key = ?gone, "Leaving join");
            self.members.remove(gone);
            self.latest.remove(gone);
        }
        for added in &next {
            if !self.members.contains_key(added) {
                trace!(key = ?added, "Joining");
                self.members.insert(added.clone(), member(added));
            }
        }
        self.order = next;
    }

    /// Ordered values, once every current key has one.
    fn snapshot(&self) -> Option<Vec<(K, V)>> {
        self.order
            .iter()
            .map(|k| self.latest.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

/// Join a dynamic set of member streams.
///
/// `keys` drives the set of members: every emission is reconciled against the
/// current subscriptions, so members of keys that disappear are dropped and
/// new keys get a fresh `member(key)` stream. The output is the `(key, value)`
/// list in key order, emitted whenever the set changes or any member emits,
/// as long as every current key has produced a value. An empty key set emits
/// an empty list.
///
/// Any error, from the key stream or a member, is emitted once and ends the
/// join. A member that ends keeps its last value.
pub fn dynamic_join<K, V, F>(keys: QueryStream<Vec<K>>, member: F) -> QueryStream<Vec<(K, V)>>
where
    K: Eq + Hash + Clone + Debug + Unpin + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(&K) -> QueryStream<V> + Send + Sync + 'static,
{
    let state = Join {
        keys,
        keys_done: false,
        order: Vec::new(),
        members: StreamMap::new(),
        latest: HashMap::new(),
        failed: false,
    };

    stream::unfold((state, member), |(mut s, member)| async move {
        if s.failed {
            return None;
        }
        loop {
            // Without keys and without members nothing can change any more
            if s.keys_done && s.members.is_empty() {
                return None;
            }
            tokio::select! {
                item = next_or_pending(&mut s.keys, &mut s.keys_done) => match item {
                    Some(Ok(keys)) => s.reconcile(keys, &member),
                    Some(Err(e)) => {
                        s.failed = true;
                        return Some((Err(e), (s, member)));
                    }
                    None => continue,
                },
                Some((key, item)) = s.members.next(), if !s.members.is_empty() => match item {
                    Ok(value) => {
                        s.latest.insert(key, value);
                    }
                    Err(e) => {
                        s.failed = true;
                        return Some((Err(e), (s, member)));
                    }
                },
            }
            if let Some(values) = s.snapshot() {
                return Some((Ok(values), (s, member)));
            }
        }
    })
    .boxed()
}

/// Map every `Ok` item of a stream.
pub fn map_ok<T, U, F>(input: QueryStream<T>, f: F) -> QueryStream<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + 'static,
{
    input.map(move |item| item.map(&f)).boxed()
}
