//! Chain query service - the read and command surface of the staking client.
//!
//! Every read is a memoized live query: consumers asking for the same thing
//! share one upstream chain subscription. Derived queries (`validators`,
//! `stake_exists`, `total_balance_info`) are built from other memoized
//! queries, so their inputs are shared too.

use std::sync::{Arc, Weak};

use futures::{StreamExt, future, stream};
use tokio::sync::{broadcast, watch};
use tracing::instrument;

use crate::cache::{Memoized, QueryStream, Subscription};
use crate::config::PortalConfig;
use crate::error::{ExtrinsicResult, QueryError};
use crate::models::{
    Account, AggregateMetrics, Balance, BalanceSnapshot, ChainProperties, DerivedStakingInfo,
    ExtrinsicId, Payee, SessionInfo, SignerAccount, StakingCall, StakingLedger,
    SubmittedExtrinsic,
};
use crate::ports::{ChainClient, SignerBridge, ValueStream};
use crate::streams::{combine_latest2, distinct_until_changed, dynamic_join, map_ok};

use super::extrinsic_queue::ExtrinsicSubmissionQueue;
use super::signer::{DiscoveryState, SignerDiscoveryService};

/// Lift a chain read into a query stream.
fn from_chain<T: Send + 'static>(values: ValueStream<T>) -> QueryStream<T> {
    values.map(|item| item.map_err(QueryError::from)).boxed()
}

type Singleton<V> = Memoized<(), (), V>;
type ByAccount<V> = Memoized<Account, Account, V>;

struct QueryInner {
    signer: SignerDiscoveryService,
    queue: ExtrinsicSubmissionQueue,

    validators: Singleton<Vec<Account>>,
    staking_ledger: ByAccount<Option<StakingLedger>>,
    stake_exists: ByAccount<bool>,
    staking_info: ByAccount<DerivedStakingInfo>,
    stake_nominators: ByAccount<Vec<Account>>,
    balance_info: ByAccount<BalanceSnapshot>,
    chain_properties: Singleton<ChainProperties>,
    session_info: Singleton<SessionInfo>,
    total_balance_info: Singleton<AggregateMetrics>,
}

/// Staking queries and commands over a chain client and a signer.
///
/// Cloning is cheap; clones share every cache.
#[derive(Clone)]
pub struct ChainQueryService {
    inner: Arc<QueryInner>,
}

impl ChainQueryService {
    pub fn new(
        client: Arc<dyn ChainClient>,
        bridge: Arc<dyn SignerBridge>,
        config: PortalConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<QueryInner>| {
            let cache = config.cache.clone();

            let c = client.clone();
            let staking_ledger =
                Memoized::by_identity("staking_ledger", cache.clone(), move |a: &Account| {
                    from_chain(c.staking_ledger(a))
                });
            let c = client.clone();
            let staking_info =
                Memoized::by_identity("staking_info", cache.clone(), move |a: &Account| {
                    from_chain(c.staking_info(a))
                });
            let c = client.clone();
            let stake_nominators =
                Memoized::by_identity("stake_nominators", cache.clone(), move |a: &Account| {
                    from_chain(c.nominators(a))
                });
            let c = client.clone();
            let balance_info =
                Memoized::by_identity("balance_info", cache.clone(), move |a: &Account| {
                    from_chain(c.balance_info(a))
                });
            let c = client.clone();
            let chain_properties =
                Memoized::singleton("chain_properties", cache.clone(), move || {
                    from_chain(c.chain_properties())
                });
            let c = client.clone();
            let session_info =
                Memoized::singleton("session_info", cache.clone(), move || {
                    from_chain(c.session_info())
                });

            let weak = this.clone();
            let c = client.clone();
            let validators =
                Memoized::singleton("validators", cache.clone(), move || {
                    validators_stream(weak.clone(), from_chain(c.session_validators()))
                });
            let weak = this.clone();
            let stake_exists =
                Memoized::by_identity("stake_exists", cache.clone(), move |a: &Account| {
                    stake_exists_stream(&weak, a)
                });
            let weak = this.clone();
            let total_balance_info =
                Memoized::singleton("total_balance_info", cache.clone(), move || {
                    total_balance_stream(weak.clone())
                });

            QueryInner {
                signer: SignerDiscoveryService::new(bridge, config.discovery, cache),
                queue: ExtrinsicSubmissionQueue::new(client, config.queue),
                validators,
                staking_ledger,
                stake_exists,
                staking_info,
                stake_nominators,
                balance_info,
                chain_properties,
                session_info,
                total_balance_info,
            }
        });

        Self { inner }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Stashes of the current session validators that have a ledger.
    pub fn validators(&self) -> Subscription<Vec<Account>> {
        self.inner.validators.call(&())
    }

    pub fn staking_ledger(&self, controller: &Account) -> Subscription<Option<StakingLedger>> {
        self.inner.staking_ledger.call(controller)
    }

    /// Whether `controller` currently has a ledger.
    pub fn stake_exists(&self, controller: &Account) -> Subscription<bool> {
        self.inner.stake_exists.call(controller)
    }

    pub fn staking_info(&self, stash: &Account) -> Subscription<DerivedStakingInfo> {
        self.inner.staking_info.call(stash)
    }

    /// Validators nominated by `stash`.
    pub fn stake_nominators(&self, stash: &Account) -> Subscription<Vec<Account>> {
        self.inner.stake_nominators.call(stash)
    }

    pub fn balance_info(&self, address: &Account) -> Subscription<BalanceSnapshot> {
        self.inner.balance_info.call(address)
    }

    pub fn chain_properties(&self) -> Subscription<ChainProperties> {
        self.inner.chain_properties.call(&())
    }

    pub fn session_info(&self) -> Subscription<SessionInfo> {
        self.inner.session_info.call(&())
    }

    pub fn signer_accounts(&self) -> Subscription<Vec<SignerAccount>> {
        self.inner.signer.discover()
    }

    pub fn signer_state(&self) -> watch::Receiver<DiscoveryState> {
        self.inner.signer.watch_state()
    }

    /// Balance and bonded totals over every signer account.
    pub fn total_balance_info(&self) -> Subscription<AggregateMetrics> {
        self.inner.total_balance_info.call(&())
    }

    pub fn extrinsics_queue(&self) -> watch::Receiver<Vec<SubmittedExtrinsic>> {
        self.inner.queue.entries()
    }

    pub fn extrinsic_updates(&self) -> broadcast::Receiver<SubmittedExtrinsic> {
        self.inner.queue.updates()
    }

    pub fn queue(&self) -> &ExtrinsicSubmissionQueue {
        &self.inner.queue
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Bond `value` from `from`, which also acts as controller. Rewards are
    /// restaked.
    #[instrument(skip_all, fields(from = %from))]
    pub async fn create_stake(&self, from: &Account, value: Balance) -> ExtrinsicResult<ExtrinsicId> {
        let call = StakingCall::Bond {
            controller: from.clone(),
            value,
            payee: Payee::Staked,
        };
        self.inner.queue.submit(from, call).await
    }

    #[instrument(skip_all, fields(from = %from))]
    pub async fn deposit_to_stake(
        &self,
        from: &Account,
        max_additional: Balance,
    ) -> ExtrinsicResult<ExtrinsicId> {
        let call = StakingCall::BondExtra { max_additional };
        self.inner.queue.submit(from, call).await
    }

    /// Schedule `amount` for unlocking.
    #[instrument(skip_all, fields(from = %from))]
    pub async fn withdraw_from_stake(
        &self,
        from: &Account,
        amount: Balance,
    ) -> ExtrinsicResult<ExtrinsicId> {
        let call = StakingCall::Unbond { value: amount };
        self.inner.queue.submit(from, call).await
    }

    #[instrument(skip_all, fields(from = %from, targets = next.len()))]
    pub async fn edit_nominees(
        &self,
        from: &Account,
        next: Vec<Account>,
    ) -> ExtrinsicResult<ExtrinsicId> {
        let call = StakingCall::Nominate { targets: next };
        self.inner.queue.submit(from, call).await
    }

    #[instrument(skip_all, fields(from = %from))]
    pub async fn stop_nominating(&self, from: &Account) -> ExtrinsicResult<ExtrinsicId> {
        self.inner.queue.submit(from, StakingCall::Chill).await
    }

    /// Withdraw every unlocked chunk.
    #[instrument(skip_all, fields(from = %from))]
    pub async fn redeem(&self, from: &Account) -> ExtrinsicResult<ExtrinsicId> {
        self.inner
            .queue
            .submit(from, StakingCall::WithdrawUnbonded)
            .await
    }
}

// =============================================================================
// Derived queries
// =============================================================================

// Derived factories hold the service weakly: cache entries live inside it.

fn validators_stream(
    this: Weak<QueryInner>,
    controllers: QueryStream<Vec<Account>>,
) -> QueryStream<Vec<Account>> {
    let ledgers = dynamic_join(controllers, move |controller: &Account| {
        match this.upgrade() {
            Some(inner) => inner.staking_ledger.call(controller).boxed(),
            None => stream::empty().boxed(),
        }
    });
    let stashes = map_ok(ledgers, |ledgers| {
        ledgers
            .into_iter()
            .filter_map(|(_, ledger)| ledger.map(|ledger| ledger.stash))
            .collect()
    });
    distinct_until_changed(stashes)
}

fn stake_exists_stream(this: &Weak<QueryInner>, controller: &Account) -> QueryStream<bool> {
    let Some(inner) = this.upgrade() else {
        return stream::empty().boxed();
    };
    let ledger = inner.staking_ledger.call(controller).boxed();
    distinct_until_changed(map_ok(ledger, |ledger| ledger.is_some()))
}

fn total_balance_stream(this: Weak<QueryInner>) -> QueryStream<AggregateMetrics> {
    let Some(inner) = this.upgrade() else {
        return stream::empty().boxed();
    };
    let addresses = map_ok(inner.signer.discover().boxed(), |accounts| {
        accounts.into_iter().map(|account| account.address).collect()
    });
    drop(inner);

    let per_account = dynamic_join(addresses, move |address: &Account| match this.upgrade() {
        Some(inner) => combine_latest2(
            inner.balance_info.call(address).boxed(),
            inner.staking_info.call(address).boxed(),
        ),
        None => stream::empty().boxed(),
    });
    let totals = map_ok(per_account, |rows| {
        AggregateMetrics::from_accounts(rows.iter().map(|(_, (balance, staking))| (balance, staking)))
    });
    // {0, 0} until every account resolved
    let initial = stream::once(future::ready(Ok(AggregateMetrics::default())));
    distinct_until_changed(initial.chain(totals))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheConfig, RetentionPolicy};
    use crate::error::{ChainError, SignerError};
    use crate::models::ExtrinsicStatus;
    use crate::services::mock::{MockBridge, MockChain, ledger, signer_accounts};
    use crate::services::signer::{DiscoveryConfig, NOT_FOUND_EXTENSION};

    fn service(chain: &Arc<MockChain>, bridge: MockBridge) -> (ChainQueryService, Arc<MockBridge>) {
        let bridge = Arc::new(bridge);
        let service = ChainQueryService::new(chain.clone(), bridge.clone(), PortalConfig::default());
        (service, bridge)
    }

    /// Skip intermediate emissions until `expected` shows up.
    async fn until<T>(sub: &mut Subscription<T>, expected: T)
    where
        T: PartialEq + std::fmt::Debug,
    {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match sub.next().await {
                    Some(Ok(value)) if value == expected => return,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected item: {other:?}"),
                }
            }
        })
        .await
        .expect("expected value never emitted");
    }

    fn accounts(addresses: &[&str]) -> Vec<Account> {
        addresses.iter().map(|a| Account::from(*a)).collect()
    }

    fn totals(balance: u64, bonded: u64) -> AggregateMetrics {
        AggregateMetrics {
            total_balance: Balance::from(balance),
            total_bonded: Balance::from(bonded),
        }
    }

    // Only controllers with a ledger yield a stash
    #[tokio::test]
    async fn test_validators_keep_controllers_with_ledger() {
        let chain = Arc::new(MockChain::new());
        chain.set_ledger("c1", Some(ledger("c1", "s1", 10)));
        chain.set_ledger("c2", Some(ledger("c2", "s2", 10)));
        chain.validators.send_replace(accounts(&["c1", "c2", "c3"]));
        let (service, _) = service(&chain, MockBridge::with_accounts(&[]));

        let mut validators = service.validators();
        until(&mut validators, accounts(&["s1", "s2"])).await;

        // Ledger removed: the stash leaves on the next recomputation
        chain.set_ledger("c2", None);
        until(&mut validators, accounts(&["s1"])).await;

        // New controller joins the session
        chain.set_ledger("c4", Some(ledger("c4", "s4", 10)));
        chain.validators.send_replace(accounts(&["c1", "c4"]));
        until(&mut validators, accounts(&["s1", "s4"])).await;
    }

    #[tokio::test]
    async fn test_validators_share_ledger_subscriptions() {
        let chain = Arc::new(MockChain::new());
        chain.set_ledger("c1", Some(ledger("c1", "s1", 10)));
        chain.validators.send_replace(accounts(&["c1", "c2"]));
        let (service, _) = service(&chain, MockBridge::with_accounts(&[]));

        let mut validators = service.validators();
        until(&mut validators, accounts(&["s1"])).await;
        assert_eq!(chain.ledger_reads.load(Ordering::SeqCst), 2);

        let mut direct = service.staking_ledger(&Account::from("c1"));
        assert_eq!(direct.next().await, Some(Ok(Some(ledger("c1", "s1", 10)))));
        assert_eq!(chain.ledger_reads.load(Ordering::SeqCst), 2);

        let mut again = service.validators();
        assert_eq!(again.next().await, Some(Ok(accounts(&["s1"]))));
    }

    #[tokio::test]
    async fn test_stake_exists_follows_ledger() {
        let chain = Arc::new(MockChain::new());
        let (service, _) = service(&chain, MockBridge::with_accounts(&[]));
        let controller = Account::from("c1");

        let mut exists = service.stake_exists(&controller);
        assert_eq!(exists.next().await, Some(Ok(false)));

        chain.set_ledger("c1", Some(ledger("c1", "s1", 5)));
        until(&mut exists, true).await;
    }

    // Totals follow the account set, {0, 0} when empty
    #[tokio::test]
    async fn test_total_balance_tracks_accounts() {
        let chain = Arc::new(MockChain::new());
        chain.set_balance("A", 100);
        chain.set_balance("B", 50);
        chain.set_bonded("A", 30);
        let (service, bridge) = service(&chain, MockBridge::with_accounts(&["A", "B"]));

        let mut totals_sub = service.total_balance_info();
        until(&mut totals_sub, totals(150, 30)).await;

        chain.set_bonded("B", 20);
        until(&mut totals_sub, totals(150, 50)).await;

        bridge.accounts.send_replace(signer_accounts(&["A"]));
        until(&mut totals_sub, totals(100, 30)).await;

        bridge.accounts.send_replace(signer_accounts(&[]));
        until(&mut totals_sub, totals(0, 0)).await;
    }

    // Totals are available while the signer is still being injected
    #[tokio::test(start_paused = true)]
    async fn test_total_balance_starts_at_zero_during_discovery() {
        let chain = Arc::new(MockChain::new());
        chain.set_balance("A", 100);
        let bridge = Arc::new(MockBridge::injected_after(&["A"], 1));
        let config = PortalConfig {
            discovery: DiscoveryConfig {
                injection_delay: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        };
        let service = ChainQueryService::new(chain.clone(), bridge.clone(), config);

        let mut totals_sub = service.total_balance_info();
        let first = tokio::time::timeout(Duration::from_millis(100), totals_sub.next())
            .await
            .expect("totals stalled during discovery");
        assert_eq!(first, Some(Ok(totals(0, 0))));

        until(&mut totals_sub, totals(100, 0)).await;
        assert_eq!(bridge.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_total_balance_ignores_account_order() {
        let chain = Arc::new(MockChain::new());
        chain.set_balance("A", 7);
        chain.set_balance("B", 5);
        let (service, bridge) = service(&chain, MockBridge::with_accounts(&["A", "B"]));

        let mut totals_sub = service.total_balance_info();
        until(&mut totals_sub, totals(12, 0)).await;

        bridge.accounts.send_replace(signer_accounts(&["B", "A"]));
        bridge.accounts.send_replace(signer_accounts(&["B", "A", "B"]));
        chain.set_balance("A", 8);
        until(&mut totals_sub, totals(13, 0)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_signer_failure_fails_totals() {
        let chain = Arc::new(MockChain::new());
        let (service, _) = service(&chain, MockBridge::absent());

        let mut totals_sub = service.total_balance_info();
        assert_eq!(totals_sub.next().await, Some(Ok(totals(0, 0))));
        let Some(Err(QueryError::Signer(SignerError::Unavailable(message)))) =
            totals_sub.next().await
        else {
            panic!("expected the signer to be unavailable");
        };
        assert_eq!(message.key, NOT_FOUND_EXTENSION);
        assert_eq!(totals_sub.next().await, None);
        assert_eq!(*service.signer_state().borrow(), DiscoveryState::Unavailable);
    }

    #[tokio::test]
    async fn test_chain_failure_fails_validators() {
        let chain = Arc::new(MockChain::new());
        *chain.broken.lock() = Some(ChainError::SubscriptionError("closed".into()));
        let (service, _) = service(&chain, MockBridge::with_accounts(&[]));

        let mut validators = service.validators();
        assert_eq!(
            validators.next().await,
            Some(Err(QueryError::Chain(ChainError::SubscriptionError(
                "closed".into()
            ))))
        );
    }

    #[tokio::test]
    async fn test_idle_teardown_resubscribes() {
        let chain = Arc::new(MockChain::new());
        let bridge = Arc::new(MockBridge::with_accounts(&[]));
        let config = PortalConfig {
            cache: CacheConfig {
                retention: RetentionPolicy::TeardownWhenIdle,
                ..Default::default()
            },
            ..Default::default()
        };
        let service = ChainQueryService::new(chain.clone(), bridge, config);
        let alice = Account::from("A");

        let mut balance = service.balance_info(&alice);
        assert!(balance.next().await.is_some());
        drop(balance);

        let mut balance = service.balance_info(&alice);
        assert!(balance.next().await.is_some());
        assert_eq!(chain.balance_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_commands_map_to_staking_calls() {
        let chain = Arc::new(MockChain::new());
        let (service, _) = service(&chain, MockBridge::with_accounts(&[]));
        let alice = Account::from("5Alice");

        service
            .create_stake(&alice, Balance::from(1_000u32))
            .await
            .unwrap();
        service
            .deposit_to_stake(&alice, Balance::from(10u32))
            .await
            .unwrap();
        service
            .withdraw_from_stake(&alice, Balance::from(500u32))
            .await
            .unwrap();
        service
            .edit_nominees(&alice, accounts(&["v1", "v2"]))
            .await
            .unwrap();
        service.stop_nominating(&alice).await.unwrap();
        let last = service.redeem(&alice).await.unwrap();

        let submitted = chain.submitted.lock().clone();
        assert_eq!(
            submitted[0].1,
            StakingCall::Bond {
                controller: alice.clone(),
                value: Balance::from(1_000u32),
                payee: Payee::Staked,
            }
        );
        let methods: Vec<&str> = submitted.iter().map(|(_, call)| call.method()).collect();
        assert_eq!(
            methods,
            vec![
                "staking.bond",
                "staking.bondExtra",
                "staking.unbond",
                "staking.nominate",
                "staking.chill",
                "staking.withdrawUnbonded",
            ]
        );

        let queue = service.extrinsics_queue().borrow().clone();
        assert_eq!(queue.len(), 6);
        assert_eq!(queue[5].id, last);
        assert_eq!(
            queue[0].params,
            serde_json::json!({"controller": "5Alice", "payee": "Staked", "value": "1000"})
        );

        let mut updates = service.extrinsic_updates();
        tokio::time::timeout(Duration::from_secs(1), async {
            while service.queue().get(last).map(|e| e.status) != Some(ExtrinsicStatus::Finalized) {
                let _ = updates.recv().await;
            }
        })
        .await
        .expect("redeem never finalized");
    }
}
