//! Extrinsic submission queue - tracks the lifecycle of write requests.
//!
//! Every submission is appended as a `Pending` entry and then moved forward
//! by the status events of the chain client. Entries are never reordered or
//! removed.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, broadcast, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{Instrument, Span, debug, info, instrument, warn};

use crate::error::{ExtrinsicError, ExtrinsicResult};
use crate::metrics::{
    AckTimer, record_extrinsic_failed, record_extrinsic_submitted, record_extrinsic_transition,
};
use crate::models::{Account, ExtrinsicId, StakingCall, SubmittedExtrinsic, TxEvent};
use crate::ports::{ChainClient, TxEventStream};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the submission queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Dispatch submissions of one origin account one at a time, each waiting
    /// for the previous acknowledgment, so nonces are assigned in order.
    pub serialize_per_account: bool,
    /// Buffered transitions per `updates()` receiver.
    pub updates_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            serialize_per_account: true,
            updates_capacity: 256,
        }
    }
}

/// Live snapshots of the whole queue.
pub type QueueStream = Pin<Box<dyn Stream<Item = Vec<SubmittedExtrinsic>> + Send>>;

// =============================================================================
// ExtrinsicSubmissionQueue
// =============================================================================

struct QueueInner {
    client: Arc<dyn ChainClient>,
    config: QueueConfig,
    entries: watch::Sender<Vec<SubmittedExtrinsic>>,
    updates: broadcast::Sender<SubmittedExtrinsic>,
    next_id: AtomicU64,
    account_locks: Mutex<HashMap<Account, Arc<tokio::sync::Mutex<()>>>>,
}

/// Submits staking calls and tracks their status.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct ExtrinsicSubmissionQueue {
    inner: Arc<QueueInner>,
}

impl ExtrinsicSubmissionQueue {
    pub fn new(client: Arc<dyn ChainClient>, config: QueueConfig) -> Self {
        let (entries, _) = watch::channel(Vec::new());
        let (updates, _) = broadcast::channel(config.updates_capacity.max(1));
        Self {
            inner: Arc::new(QueueInner {
                client,
                config,
                entries,
                updates,
                next_id: AtomicU64::new(1),
                account_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit `call` signed by `from`.
    ///
    /// Resolves with the entry id once the node acknowledged the transaction;
    /// inclusion and finalization are tracked in the background. Rejections
    /// mark the entry `Failed` and are returned as the same error.
    ///
    /// Dispatch runs on its own task: dropping the returned future stops
    /// waiting for the acknowledgment but not the submission.
    #[instrument(skip_all, fields(from = %from, method = call.method()))]
    pub async fn submit(&self, from: &Account, call: StakingCall) -> ExtrinsicResult<ExtrinsicId> {
        let id = ExtrinsicId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = SubmittedExtrinsic::pending(id, from.clone(), call.method(), call.params());

        self.inner.entries.send_modify(|queue| queue.push(entry.clone()));
        let _ = self.inner.updates.send(entry);
        record_extrinsic_submitted(call.method());
        debug!(%id, "Queued extrinsic");

        let (ack_tx, ack_rx) = oneshot::channel();
        let lifecycle = run(self.inner.clone(), id, from.clone(), call, ack_tx);
        tokio::spawn(lifecycle.instrument(Span::current()));

        match ack_rx.await {
            Ok(acknowledged) => acknowledged.map(|()| id),
            Err(_) => Err(ExtrinsicError::Network("submission task stopped".into())),
        }
    }

    /// Read-only live view of the queue.
    pub fn entries(&self) -> watch::Receiver<Vec<SubmittedExtrinsic>> {
        self.inner.entries.subscribe()
    }

    pub fn snapshot(&self) -> Vec<SubmittedExtrinsic> {
        self.inner.entries.borrow().clone()
    }

    pub fn get(&self, id: ExtrinsicId) -> Option<SubmittedExtrinsic> {
        self.inner
            .entries
            .borrow()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    /// Current queue, then a new snapshot after every change.
    pub fn stream(&self) -> QueueStream {
        WatchStream::new(self.entries()).boxed()
    }

    /// Every appended entry and every applied transition, as it happens.
    pub fn updates(&self) -> broadcast::Receiver<SubmittedExtrinsic> {
        self.inner.updates.subscribe()
    }
}

impl QueueInner {
    /// Wait for the turn of `from`, if submissions are serialized.
    async fn account_turn(&self, from: &Account) -> Option<OwnedMutexGuard<()>> {
        if !self.config.serialize_per_account {
            return None;
        }
        let lock = self
            .account_locks
            .lock()
            .entry(from.clone())
            .or_default()
            .clone();
        Some(lock.lock_owned().await)
    }

    /// Give up the turn of `from`. The lock is forgotten once nobody holds or
    /// waits for it.
    fn release_turn(&self, from: &Account, turn: Option<OwnedMutexGuard<()>>) {
        let Some(turn) = turn else {
            return;
        };
        let lock = OwnedMutexGuard::mutex(&turn).clone();
        drop(turn);

        let mut locks = self.account_locks.lock();
        // The map and `lock` are the only owners left
        if Arc::strong_count(&lock) == 2 {
            locks.remove(from);
        }
    }

    /// Dispatch `call` and wait for the first status event.
    async fn acknowledge(
        &self,
        id: ExtrinsicId,
        from: &Account,
        call: &StakingCall,
    ) -> ExtrinsicResult<TxEventStream> {
        let _timer = AckTimer::new();
        let mut events = match self.client.submit(from, call).await {
            Ok(events) => events,
            Err(e) => return Err(self.fail(id, e)),
        };

        match events.next().await {
            Some(TxEvent::Pending) => {}
            Some(TxEvent::Failed(e)) => return Err(self.fail(id, e)),
            Some(event) => {
                self.transition(id, &event);
            }
            None => {
                let e = ExtrinsicError::Network("status stream closed before acknowledgment".into());
                return Err(self.fail(id, e));
            }
        }
        Ok(events)
    }

    /// Apply `event` to entry `id`. Returns whether it was a forward transition.
    fn transition(&self, id: ExtrinsicId, event: &TxEvent) -> bool {
        let mut updated = None;
        self.entries.send_if_modified(|queue| {
            let Some(entry) = queue.iter_mut().find(|entry| entry.id == id) else {
                return false;
            };
            if !entry.apply(event) {
                return false;
            }
            updated = Some(entry.clone());
            true
        });

        let Some(entry) = updated else {
            warn!(%id, status = event.status().as_str(), "Ignoring out-of-order status event");
            return false;
        };

        record_extrinsic_transition(entry.status.as_str());
        match &entry.error {
            Some(error) => {
                record_extrinsic_failed(&entry.method);
                warn!(%id, method = %entry.method, error = %error, "❌ Extrinsic failed");
            }
            None => debug!(%id, status = entry.status.as_str(), "Extrinsic status changed"),
        }
        let _ = self.updates.send(entry);
        true
    }

    fn fail(&self, id: ExtrinsicId, error: ExtrinsicError) -> ExtrinsicError {
        self.transition(id, &TxEvent::Failed(error.clone()));
        error
    }
}

/// Full lifecycle of one submission: wait for the account's turn, dispatch,
/// report the acknowledgment, then follow the status stream.
async fn run(
    inner: Arc<QueueInner>,
    id: ExtrinsicId,
    from: Account,
    call: StakingCall,
    ack: oneshot::Sender<ExtrinsicResult<()>>,
) {
    // Held until acknowledgment
    let turn = inner.account_turn(&from).await;
    let acknowledged = inner.acknowledge(id, &from, &call).await;
    inner.release_turn(&from, turn);

    match acknowledged {
        Ok(events) => {
            info!(%id, "📤 Extrinsic acknowledged");
            let _ = ack.send(Ok(()));
            track(inner, id, events).await;
        }
        Err(e) => {
            let _ = ack.send(Err(e));
        }
    }
}

/// Follow the status stream of an acknowledged submission.
async fn track(inner: Arc<QueueInner>, id: ExtrinsicId, mut events: TxEventStream) {
    while let Some(event) = events.next().await {
        let terminal = event.status().is_terminal();
        inner.transition(id, &event);
        if terminal {
            return;
        }
    }
    warn!(%id, "Status stream ended before a terminal status");
}
