//! In-memory chain client and signer for service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};

use crate::error::{ChainError, ExtrinsicError, ExtrinsicResult, SignerResult};
use crate::models::{
    Account, Balance, BalanceSnapshot, ChainProperties, DerivedStakingInfo, SessionInfo,
    SignerAccount, SignerProvider, StakingCall, StakingLedger, TxEvent,
};
use crate::ports::{AccountStream, ChainClient, SignerBridge, TxEventStream, ValueStream};

/// How the next `submit` call behaves.
pub(crate) enum Script {
    Reject(ExtrinsicError),
    Events(mpsc::UnboundedReceiver<TxEvent>),
}

/// Chain state held in watch channels; tests mutate it to drive the streams.
pub(crate) struct MockChain {
    pub validators: watch::Sender<Vec<Account>>,
    ledgers: Mutex<HashMap<Account, watch::Sender<Option<StakingLedger>>>>,
    balances: Mutex<HashMap<Account, watch::Sender<BalanceSnapshot>>>,
    infos: Mutex<HashMap<Account, watch::Sender<DerivedStakingInfo>>>,
    /// Fails every read when set.
    pub broken: Mutex<Option<ChainError>>,
    pub ledger_reads: AtomicUsize,
    pub balance_reads: AtomicUsize,
    scripts: Mutex<VecDeque<Script>>,
    pub submitted: Mutex<Vec<(Account, StakingCall)>>,
}

impl MockChain {
    pub fn new() -> Self {
        let (validators, _) = watch::channel(Vec::new());
        Self {
            validators,
            ledgers: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            infos: Mutex::new(HashMap::new()),
            broken: Mutex::new(None),
            ledger_reads: AtomicUsize::new(0),
            balance_reads: AtomicUsize::new(0),
            scripts: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ledger(&self, controller: &str, ledger: Option<StakingLedger>) {
        let account = Account::from(controller);
        self.ledgers
            .lock()
            .entry(account)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(ledger);
    }

    pub fn set_balance(&self, address: &str, available: u64) {
        let snapshot = BalanceSnapshot {
            available: Balance::from(available),
            total: Balance::from(available),
        };
        self.balances
            .lock()
            .entry(Account::from(address))
            .or_insert_with(|| watch::channel(BalanceSnapshot::default()).0)
            .send_replace(snapshot);
    }

    pub fn set_bonded(&self, stash: &str, active: u64) {
        let info = staking_info(stash, Some(ledger(stash, stash, active)));
        self.infos
            .lock()
            .entry(Account::from(stash))
            .or_insert_with(|| watch::channel(staking_info(stash, None)).0)
            .send_replace(info);
    }

    /// Queue a scripted submission; returns the sender driving its events.
    pub fn script_events(&self) -> mpsc::UnboundedSender<TxEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(Script::Events(rx));
        tx
    }

    pub fn script_rejection(&self, error: ExtrinsicError) {
        self.scripts.lock().push_back(Script::Reject(error));
    }

    fn watch<T>(&self, rx: watch::Receiver<T>) -> ValueStream<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(error) = self.broken.lock().clone() {
            return stream::iter([Err(error)]).boxed();
        }
        WatchStream::new(rx).map(Ok).boxed()
    }
}

pub(crate) fn ledger(controller: &str, stash: &str, active: u64) -> StakingLedger {
    StakingLedger {
        controller: Account::from(controller),
        stash: Account::from(stash),
        total: Balance::from(active),
        active: Balance::from(active),
        unlocking: vec![],
    }
}

pub(crate) fn staking_info(stash: &str, ledger: Option<StakingLedger>) -> DerivedStakingInfo {
    DerivedStakingInfo {
        stash: Account::from(stash),
        controller: ledger.as_ref().map(|l| l.controller.clone()),
        nominators: vec![],
        redeemable: Balance::default(),
        staking_ledger: ledger,
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn session_validators(&self) -> ValueStream<Vec<Account>> {
        self.watch(self.validators.subscribe())
    }

    fn staking_ledger(&self, controller: &Account) -> ValueStream<Option<StakingLedger>> {
        self.ledger_reads.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .ledgers
            .lock()
            .entry(controller.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        self.watch(rx)
    }

    fn staking_info(&self, stash: &Account) -> ValueStream<DerivedStakingInfo> {
        let rx = self
            .infos
            .lock()
            .entry(stash.clone())
            .or_insert_with(|| watch::channel(staking_info(stash.as_str(), None)).0)
            .subscribe();
        self.watch(rx)
    }

    fn nominators(&self, stash: &Account) -> ValueStream<Vec<Account>> {
        let (_, rx) = watch::channel(vec![Account::from(format!("{stash}-validator"))]);
        self.watch(rx)
    }

    fn balance_info(&self, address: &Account) -> ValueStream<BalanceSnapshot> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .balances
            .lock()
            .entry(address.clone())
            .or_insert_with(|| watch::channel(BalanceSnapshot::default()).0)
            .subscribe();
        self.watch(rx)
    }

    fn chain_properties(&self) -> ValueStream<ChainProperties> {
        let (_, rx) = watch::channel(ChainProperties {
            ss58_format: Some(42),
            token_decimals: Some(12),
            token_symbol: Some("UNIT".into()),
        });
        self.watch(rx)
    }

    fn session_info(&self) -> ValueStream<SessionInfo> {
        let (_, rx) = watch::channel(SessionInfo::default());
        self.watch(rx)
    }

    async fn submit(&self, from: &Account, call: &StakingCall) -> ExtrinsicResult<TxEventStream> {
        self.submitted.lock().push((from.clone(), call.clone()));
        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Reject(error)) => Err(error),
            Some(Script::Events(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Ok(stream::iter([TxEvent::Pending, TxEvent::InBlock, TxEvent::Finalized])
                .boxed()),
        }
    }
}

/// Signer with one provider and a mutable account list.
pub(crate) struct MockBridge {
    pub accounts: watch::Sender<Vec<SignerAccount>>,
    pub providers: Vec<SignerProvider>,
    /// Authorization requests answered with no provider before `providers`.
    silent_requests: AtomicUsize,
    pub requests: AtomicUsize,
}

impl MockBridge {
    pub fn with_accounts(addresses: &[&str]) -> Self {
        Self::injected_after(addresses, 0)
    }

    /// A signer that only shows up after `silent` authorization requests.
    pub fn injected_after(addresses: &[&str], silent: usize) -> Self {
        let (accounts, _) = watch::channel(signer_accounts(addresses));
        Self {
            accounts,
            providers: vec![SignerProvider {
                name: "polkadot-js".into(),
                version: "0.44.1".into(),
            }],
            silent_requests: AtomicUsize::new(silent),
            requests: AtomicUsize::new(0),
        }
    }

    /// A bridge no provider ever answers.
    pub fn absent() -> Self {
        Self {
            providers: vec![],
            ..Self::with_accounts(&[])
        }
    }
}

pub(crate) fn signer_accounts(addresses: &[&str]) -> Vec<SignerAccount> {
    addresses
        .iter()
        .map(|address| SignerAccount {
            address: Account::from(*address),
            name: None,
            source: "polkadot-js".into(),
        })
        .collect()
}

#[async_trait]
impl SignerBridge for MockBridge {
    async fn request_authorization(&self, _: &str) -> SignerResult<Vec<SignerProvider>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let silent = self
            .silent_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if silent {
            return Ok(vec![]);
        }
        Ok(self.providers.clone())
    }

    async fn subscribe_accounts(&self) -> SignerResult<AccountStream> {
        Ok(WatchStream::new(self.accounts.subscribe()).map(Ok).boxed())
    }
}
