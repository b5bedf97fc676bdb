//! Port trait for the remote chain client.
//!
//! This trait defines the read and write capabilities the core needs from a
//! Substrate node. Implementations live in the infrastructure layer (e.g.,
//! `stakeport-substrate`). Every read is a live stream: it yields the current
//! value first and a new value whenever the underlying state changes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{ChainResult, ExtrinsicResult};
use crate::models::{
    Account, BalanceSnapshot, ChainProperties, DerivedStakingInfo, SessionInfo, StakingCall,
    StakingLedger, TxEvent,
};

/// Live stream of decoded chain values.
pub type ValueStream<T> = Pin<Box<dyn Stream<Item = ChainResult<T>> + Send>>;

/// Progress of a single submitted extrinsic.
pub type TxEventStream = Pin<Box<dyn Stream<Item = TxEvent> + Send>>;

/// Port trait for chain reads and extrinsic submission.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Controllers of the current session validators (`session.validators`).
    fn session_validators(&self) -> ValueStream<Vec<Account>>;

    /// Ledger stored under a controller (`staking.ledger`), `None` if not bonded.
    fn staking_ledger(&self, controller: &Account) -> ValueStream<Option<StakingLedger>>;

    /// Derived staking information of a stash.
    fn staking_info(&self, stash: &Account) -> ValueStream<DerivedStakingInfo>;

    /// Validators nominated by a stash (`staking.nominators`).
    fn nominators(&self, stash: &Account) -> ValueStream<Vec<Account>>;

    /// Available and total balance of an account.
    fn balance_info(&self, address: &Account) -> ValueStream<BalanceSnapshot>;

    /// Node properties (`system_properties`).
    fn chain_properties(&self) -> ValueStream<ChainProperties>;

    /// Session and era progress.
    fn session_info(&self) -> ValueStream<SessionInfo>;

    /// Sign and broadcast a call on behalf of `from`.
    ///
    /// Returns once the transaction was handed to the node. The stream then
    /// starts with [`TxEvent::Pending`] and ends after a terminal event.
    /// Pre-dispatch rejections and signer refusals are returned as errors.
    async fn submit(&self, from: &Account, call: &StakingCall) -> ExtrinsicResult<TxEventStream>;
}
