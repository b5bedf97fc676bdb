//! Multicast-with-replay entries backing the query cache.
//!
//! An entry owns one upstream stream. The first subscriber spawns a pump task
//! that drives the upstream and fans every item out over a broadcast channel.
//! The last item is kept so that late subscribers start from the current
//! value. Snapshotting the last item and subscribing to the channel happen
//! under the same lock as publishing, so no subscriber sees a gap or a
//! duplicate.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt, future, stream};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

use crate::error::QueryResult;
use crate::metrics::record_upstream_error;

use super::QueryStream;

pub(crate) struct Entry<V> {
    cache: &'static str,
    state: Mutex<EntryState<V>>,
}

struct EntryState<V> {
    /// Last item, replayed to new subscribers.
    latest: Option<QueryResult<V>>,
    /// `None` once the upstream completed, failed or was torn down.
    sender: Option<broadcast::Sender<QueryResult<V>>>,
    /// Cold upstream, taken by the first subscriber.
    upstream: Option<QueryStream<V>>,
    pump: Option<AbortHandle>,
    subscribers: usize,
}

impl<V> Entry<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(cache: &'static str, upstream: QueryStream<V>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            cache,
            state: Mutex::new(EntryState {
                latest: None,
                sender: Some(sender),
                upstream: Some(upstream),
                pump: None,
                subscribers: 0,
            }),
        }
    }

    pub(crate) fn cache(&self) -> &'static str {
        self.cache
    }

    /// Register a subscriber and return its replay-then-live stream.
    ///
    /// Must be called from within a tokio runtime: the first call spawns the
    /// upstream pump.
    pub(crate) fn attach(self: &Arc<Self>) -> QueryStream<V> {
        let mut state = self.state.lock();
        state.subscribers += 1;

        if let Some(upstream) = state.upstream.take() {
            trace!(cache = self.cache, "Connecting upstream");
            let handle = tokio::spawn(pump(Arc::downgrade(self), upstream));
            state.pump = Some(handle.abort_handle());
        }

        let replay = state.latest.clone();
        let live = state.sender.as_ref().map(broadcast::Sender::subscribe);
        drop(state);

        replay_then_live(self.cache, replay, live)
    }

    /// Unregister a subscriber. Returns the remaining count.
    pub(crate) fn detach(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        state.subscribers
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.state.lock().subscribers
    }

    /// Abort the upstream and close the channel.
    pub(crate) fn teardown(&self) {
        let mut state = self.state.lock();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.sender = None;
        state.upstream = None;
    }

    fn publish(&self, item: QueryResult<V>) {
        let mut state = self.state.lock();
        if let Some(sender) = &state.sender {
            // No receiver is fine: the item is still kept for replay
            let _ = sender.send(item.clone());
        }
        state.latest = Some(item);
    }

    fn complete(&self) {
        let mut state = self.state.lock();
        state.sender = None;
        state.pump = None;
    }
}

/// Drive the upstream until it ends, fails, or the entry is gone.
async fn pump<V>(entry: Weak<Entry<V>>, mut upstream: QueryStream<V>)
where
    V: Clone + Send + Sync + 'static,
{
    while let Some(item) = upstream.next().await {
        let Some(entry) = entry.upgrade() else {
            return;
        };

        let failed = match &item {
            Ok(_) => false,
            Err(e) => {
                warn!(cache = entry.cache, error = %e, "Shared stream failed");
                record_upstream_error(entry.cache);
                true
            }
        };

        entry.publish(item);

        if failed {
            entry.complete();
            return;
        }
    }

    if let Some(entry) = entry.upgrade() {
        trace!(cache = entry.cache, "Upstream completed");
        entry.complete();
    }
}

/// Replayed item first, then live items; ends right after the first error.
fn replay_then_live<V>(
    cache: &'static str,
    replay: Option<QueryResult<V>>,
    live: Option<broadcast::Receiver<QueryResult<V>>>,
) -> QueryStream<V>
where
    V: Clone + Send + Sync + 'static,
{
    let live = match live {
        Some(receiver) => BroadcastStream::new(receiver)
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(item) => Some(item),
                    Err(lagged) => {
                        warn!(cache, error = %lagged, "Subscriber fell behind shared stream");
                        None
                    }
                })
            })
            .boxed(),
        None => stream::empty().boxed(),
    };

    stream::iter(replay)
        .chain(live)
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

// =============================================================================
// Subscription
// =============================================================================

/// Releases a subscriber slot when a [`Subscription`] is dropped.
pub(crate) trait Release: Send + Sync {
    fn release(&self);
}

/// A consumer's handle on a shared query stream.
///
/// Yields the latest value first, then every later value. Dropping it
/// unsubscribes; depending on the cache's retention policy the last drop
/// tears the upstream down.
pub struct Subscription<V> {
    stream: QueryStream<V>,
    lease: Option<Box<dyn Release>>,
}

impl<V> Subscription<V> {
    pub(crate) fn new(stream: QueryStream<V>, lease: Box<dyn Release>) -> Self {
        Self {
            stream,
            lease: Some(lease),
        }
    }

    /// Wrap a stream that is not backed by a cache entry.
    pub fn detached(stream: QueryStream<V>) -> Self {
        Self {
            stream,
            lease: None,
        }
    }
}

impl<V: 'static> Subscription<V> {
    /// Erase into a plain boxed stream, keeping the lease alive.
    pub fn boxed(self) -> QueryStream<V> {
        Box::pin(self)
    }
}

impl<V> Stream for Subscription<V> {
    type Item = QueryResult<V>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl<V> std::fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cached", &self.lease.is_some())
            .finish()
    }
}
