//! Substrate RPC client with dynamic metadata decoding.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use subxt::backend::chain_head::{ChainHeadBackend, ChainHeadBackendBuilder};
use subxt::backend::legacy::LegacyRpcMethods;
use subxt::backend::rpc::RpcClient;
use subxt::blocks::Block;
use subxt::dynamic::{DecodedValueThunk, Value};
use subxt::tx::TxStatus;
use subxt::utils::AccountId32;
use subxt::{OnlineClient, PolkadotConfig};
use tracing::{debug, instrument, trace, warn};

use stakeport_core::error::{ChainError, ChainResult, ExtrinsicError, ExtrinsicResult};
use stakeport_core::models::{
    Account, Balance, BalanceSnapshot, ChainProperties, DerivedStakingInfo, Payee, SessionInfo,
    StakingCall, StakingLedger, TxEvent,
};
use stakeport_core::ports::{ChainClient, TxEventStream, ValueStream};
use stakeport_core::streams::distinct_until_changed;

use crate::decode::{
    parse_account, parse_accounts, parse_active_era, parse_balance, parse_ledger,
    parse_nominations, parse_properties, parse_u32, value_to_json,
};
use crate::keyring::Keyring;

/// Configuration for the Substrate client.
#[derive(Debug, Clone)]
pub struct SubstrateClientConfig {
    /// WebSocket URL (e.g., "ws://localhost:9944").
    pub ws_url: String,
}

pub type SubstrateBlock = Block<PolkadotConfig, OnlineClient<PolkadotConfig>>;

impl Default for SubstrateClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:9944".to_string(),
        }
    }
}

/// Substrate client adapter implementing the ChainClient port.
///
/// Reads follow finalized blocks: each read re-fetches its storage at every
/// finalized block and only emits when the decoded value changed.
pub struct SubstrateClient {
    client: OnlineClient<PolkadotConfig>,
    rpc: LegacyRpcMethods<PolkadotConfig>,
    keyring: Arc<Keyring>,
}

impl SubstrateClient {
    /// Connect to a Substrate node. Extrinsics are signed with `keyring`.
    #[instrument(skip_all, fields(url = %config.ws_url))]
    pub async fn connect(config: SubstrateClientConfig, keyring: Arc<Keyring>) -> ChainResult<Self> {
        debug!("Connecting to node");

        let rpc_client = RpcClient::from_url(&config.ws_url)
            .await
            .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;
        let backend: ChainHeadBackend<PolkadotConfig> =
            ChainHeadBackendBuilder::default().build_with_background_driver(rpc_client.clone());
        let client = OnlineClient::<PolkadotConfig>::from_backend(Arc::new(backend))
            .await
            .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;
        let rpc = LegacyRpcMethods::<PolkadotConfig>::new(rpc_client);

        debug!(
            spec_version = client.runtime_version().spec_version,
            "Connected successfully"
        );

        Ok(Self {
            client,
            rpc,
            keyring,
        })
    }

    /// Re-run `read` at every finalized block, emitting changes only.
    fn watch_finalized<T, F, Fut>(&self, what: &'static str, read: F) -> ValueStream<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(SubstrateBlock) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChainResult<T>> + Send + 'static,
    {
        let client = self.client.clone();
        let blocks = stream::once(async move { client.blocks().subscribe_finalized().await })
            .flat_map(move |subscription| match subscription {
                Ok(blocks) => blocks
                    .map(|block| block.map_err(|e| ChainError::SubscriptionError(e.to_string())))
                    .boxed(),
                Err(e) => {
                    warn!(what, error = %e, "Finalized block subscription failed");
                    stream::iter([Err(ChainError::SubscriptionError(e.to_string()))]).boxed()
                }
            });

        let read = Arc::new(read);
        let values = blocks.then(move |block| {
            let read = read.clone();
            async move {
                let block = block?;
                trace!(what, block = block.number(), "Reading storage");
                read(block).await
            }
        });

        distinct_until_changed(values)
    }

    /// Number of fields of a Staking call in the connected runtime.
    fn call_arity(&self, call: &str) -> usize {
        self.client
            .metadata()
            .pallet_by_name("Staking")
            .and_then(|pallet| pallet.call_variant_by_name(call))
            .map(|variant| variant.fields.len())
            .unwrap_or(0)
    }

    /// Build the dynamic payload of a staking call.
    fn staking_payload(&self, call: &StakingCall) -> ExtrinsicResult<subxt::tx::DynamicPayload> {
        let (name, fields) = match call {
            StakingCall::Bond {
                controller,
                value,
                payee,
            } => {
                let mut fields = Vec::with_capacity(3);
                // Runtimes before the controller deprecation take it first
                if self.call_arity("bond") == 3 {
                    fields.push(multi_address(controller)?);
                }
                fields.push(amount_value(value)?);
                fields.push(payee_value(*payee));
                ("bond", fields)
            }
            StakingCall::BondExtra { max_additional } => {
                ("bond_extra", vec![amount_value(max_additional)?])
            }
            StakingCall::Unbond { value } => ("unbond", vec![amount_value(value)?]),
            StakingCall::Nominate { targets } => {
                let targets = targets
                    .iter()
                    .map(multi_address)
                    .collect::<ExtrinsicResult<Vec<_>>>()?;
                ("nominate", vec![Value::unnamed_composite(targets)])
            }
            StakingCall::Chill => ("chill", vec![]),
            StakingCall::WithdrawUnbonded => {
                // num_slashing_spans, where the runtime asks for it
                let fields = match self.call_arity("withdraw_unbonded") {
                    0 => vec![],
                    _ => vec![Value::u128(0)],
                };
                ("withdraw_unbonded", fields)
            }
        };

        Ok(subxt::dynamic::tx("Staking", name, fields))
    }
}

// =============================================================================
// Storage helpers
// =============================================================================

fn account_key(account: &Account) -> ChainResult<Value> {
    let id: AccountId32 = account
        .as_str()
        .parse()
        .map_err(|_| ChainError::InvalidAddress(account.to_string()))?;
    Ok(Value::from_bytes(id.0))
}

/// Fetch a storage entry at `block` as JSON, `None` if absent.
async fn fetch_json(
    block: &SubstrateBlock,
    pallet: &str,
    entry: &str,
    keys: Vec<Value>,
) -> ChainResult<Option<serde_json::Value>> {
    let address = subxt::dynamic::storage(pallet, entry, keys);
    let thunk: Option<DecodedValueThunk> = block
        .storage()
        .fetch(&address)
        .await
        .map_err(|e| ChainError::RpcError(e.to_string()))?;

    thunk
        .map(|thunk| {
            thunk
                .to_value()
                .map(|value| value_to_json(&value))
                .map_err(|e| ChainError::DecodingError(e.to_string()))
        })
        .transpose()
}

async fn fetch_ledger(
    block: &SubstrateBlock,
    controller: &Account,
) -> ChainResult<Option<StakingLedger>> {
    let ledger = fetch_json(block, "Staking", "Ledger", vec![account_key(controller)?]).await?;
    ledger
        .map(|json| parse_ledger(controller, &json))
        .transpose()
}

async fn fetch_active_era(block: &SubstrateBlock) -> ChainResult<Option<u32>> {
    let era = fetch_json(block, "Staking", "ActiveEra", vec![]).await?;
    era.map(|json| parse_active_era(&json)).transpose()
}

async fn fetch_staking_info(
    block: &SubstrateBlock,
    stash: &Account,
) -> ChainResult<DerivedStakingInfo> {
    let key = account_key(stash)?;

    let controller = fetch_json(block, "Staking", "Bonded", vec![key.clone()])
        .await?
        .map(|json| parse_account(&json))
        .transpose()?;

    let nominators = fetch_json(block, "Staking", "Nominators", vec![key])
        .await?
        .map(|json| parse_nominations(&json))
        .transpose()?
        .unwrap_or_default();

    let staking_ledger = match &controller {
        Some(controller) => fetch_ledger(block, controller).await?,
        None => None,
    };

    let redeemable = match (&staking_ledger, fetch_active_era(block).await?) {
        (Some(ledger), Some(era)) => ledger.redeemable(era),
        _ => Balance::default(),
    };

    Ok(DerivedStakingInfo {
        stash: stash.clone(),
        controller,
        nominators,
        redeemable,
        staking_ledger,
    })
}

async fn fetch_session_info(
    client: &OnlineClient<PolkadotConfig>,
    block: &SubstrateBlock,
) -> ChainResult<SessionInfo> {
    let current_index = fetch_json(block, "Session", "CurrentIndex", vec![])
        .await?
        .map(|json| parse_u32(&json))
        .transpose()?
        .unwrap_or_default();
    let current_era = fetch_json(block, "Staking", "CurrentEra", vec![])
        .await?
        .map(|json| parse_u32(&json))
        .transpose()?;
    let active_era = fetch_active_era(block).await?;
    let validator_count = fetch_json(block, "Staking", "ValidatorCount", vec![])
        .await?
        .map(|json| parse_u32(&json))
        .transpose()?
        .unwrap_or_default();

    let sessions_per_era = client
        .constants()
        .at(&subxt::dynamic::constant("Staking", "SessionsPerEra"))
        .map_err(|e| ChainError::MetadataError(e.to_string()))?
        .to_value()
        .map_err(|e| ChainError::DecodingError(e.to_string()))?;

    Ok(SessionInfo {
        current_index,
        current_era,
        active_era,
        validator_count,
        sessions_per_era: parse_u32(&value_to_json(&sessions_per_era))?,
    })
}

// =============================================================================
// Call helpers
// =============================================================================

fn amount_value(amount: &Balance) -> ExtrinsicResult<Value> {
    u128::try_from(amount)
        .map(Value::u128)
        .map_err(|_| ExtrinsicError::InvalidCall(format!("amount {amount} exceeds u128")))
}

fn multi_address(account: &Account) -> ExtrinsicResult<Value> {
    let id: AccountId32 = account
        .as_str()
        .parse()
        .map_err(|_| ExtrinsicError::InvalidCall(format!("invalid address {account}")))?;
    Ok(Value::unnamed_variant("Id", [Value::from_bytes(id.0)]))
}

fn payee_value(payee: Payee) -> Value {
    Value::unnamed_variant(payee.as_str(), [])
}

/// Map a transaction status to a queue event; `None` for intermediate steps.
async fn tx_event(
    status: Result<TxStatus<PolkadotConfig, OnlineClient<PolkadotConfig>>, subxt::Error>,
) -> Option<TxEvent> {
    match status {
        Ok(TxStatus::InBestBlock(_)) => Some(TxEvent::InBlock),
        Ok(TxStatus::InFinalizedBlock(in_block)) => Some(match in_block.wait_for_success().await {
            Ok(_) => TxEvent::Finalized,
            Err(e) => TxEvent::Failed(ExtrinsicError::DispatchFailed(e.to_string())),
        }),
        Ok(TxStatus::Error { message })
        | Ok(TxStatus::Invalid { message })
        | Ok(TxStatus::Dropped { message }) => {
            Some(TxEvent::Failed(ExtrinsicError::NodeRejected(message)))
        }
        Ok(_) => None,
        Err(e) => Some(TxEvent::Failed(ExtrinsicError::Network(e.to_string()))),
    }
}

/// Transport failures are retryable, anything else is the node refusing the
/// transaction.
fn submission_error(e: subxt::Error) -> ExtrinsicError {
    match e {
        subxt::Error::Rpc(_) | subxt::Error::Io(_) => ExtrinsicError::Network(e.to_string()),
        e => ExtrinsicError::NodeRejected(e.to_string()),
    }
}

#[async_trait]
impl ChainClient for SubstrateClient {
    fn session_validators(&self) -> ValueStream<Vec<Account>> {
        self.watch_finalized("session_validators", |block| async move {
            let validators = fetch_json(&block, "Session", "Validators", vec![]).await?;
            validators
                .map(|json| parse_accounts(&json))
                .transpose()
                .map(Option::unwrap_or_default)
        })
    }

    fn staking_ledger(&self, controller: &Account) -> ValueStream<Option<StakingLedger>> {
        let controller = controller.clone();
        self.watch_finalized("staking_ledger", move |block| {
            let controller = controller.clone();
            async move { fetch_ledger(&block, &controller).await }
        })
    }

    fn staking_info(&self, stash: &Account) -> ValueStream<DerivedStakingInfo> {
        let stash = stash.clone();
        self.watch_finalized("staking_info", move |block| {
            let stash = stash.clone();
            async move { fetch_staking_info(&block, &stash).await }
        })
    }

    fn nominators(&self, stash: &Account) -> ValueStream<Vec<Account>> {
        let stash = stash.clone();
        self.watch_finalized("nominators", move |block| {
            let stash = stash.clone();
            async move {
                let nominations =
                    fetch_json(&block, "Staking", "Nominators", vec![account_key(&stash)?]).await?;
                nominations
                    .map(|json| parse_nominations(&json))
                    .transpose()
                    .map(Option::unwrap_or_default)
            }
        })
    }

    fn balance_info(&self, address: &Account) -> ValueStream<BalanceSnapshot> {
        let address = address.clone();
        self.watch_finalized("balance_info", move |block| {
            let address = address.clone();
            async move {
                let account =
                    fetch_json(&block, "System", "Account", vec![account_key(&address)?]).await?;
                account
                    .map(|json| parse_balance(&json))
                    .transpose()
                    .map(Option::unwrap_or_default)
            }
        })
    }

    fn chain_properties(&self) -> ValueStream<ChainProperties> {
        let rpc = self.rpc.clone();
        stream::once(async move {
            rpc.system_properties()
                .await
                .map(|properties| parse_properties(&properties))
                .map_err(|e| ChainError::RpcError(e.to_string()))
        })
        .boxed()
    }

    fn session_info(&self) -> ValueStream<SessionInfo> {
        let client = self.client.clone();
        self.watch_finalized("session_info", move |block| {
            let client = client.clone();
            async move { fetch_session_info(&client, &block).await }
        })
    }

    #[instrument(skip_all, fields(from = %from, method = call.method()))]
    async fn submit(&self, from: &Account, call: &StakingCall) -> ExtrinsicResult<TxEventStream> {
        let signer = self
            .keyring
            .signer(from)
            .ok_or_else(|| ExtrinsicError::SignerDeclined(format!("no key for {from}")))?;
        let payload = self.staking_payload(call)?;

        let progress = self
            .client
            .tx()
            .sign_and_submit_then_watch_default(&payload, &signer)
            .await
            .map_err(submission_error)?;
        debug!("Extrinsic submitted");

        // The node accepted it: that is the acknowledgment
        let events =
            stream::once(future::ready(TxEvent::Pending)).chain(progress.filter_map(tx_event));
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_value_bounds() {
        assert!(amount_value(&Balance::from(u128::MAX)).is_ok());

        let too_big = Balance::from(u128::MAX) + 1u32;
        let err = amount_value(&too_big).unwrap_err();
        assert!(matches!(err, ExtrinsicError::InvalidCall(_)));
    }

    #[test]
    fn test_submission_transport_error_is_network() {
        let reset = subxt::Error::Io(std::io::Error::other("connection reset"));
        assert!(matches!(submission_error(reset), ExtrinsicError::Network(_)));

        let refused = subxt::Error::Other("Inability to pay some fees".into());
        assert!(matches!(submission_error(refused), ExtrinsicError::NodeRejected(_)));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let bad = Account::from("not-an-address");
        assert_eq!(
            account_key(&bad).unwrap_err(),
            ChainError::InvalidAddress("not-an-address".into())
        );
        assert!(matches!(
            multi_address(&bad),
            Err(ExtrinsicError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_multi_address_wraps_account_id() {
        let alice = Account::from("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY");
        let value = multi_address(&alice).unwrap();
        // The Id wrapper is transparent in the JSON form
        assert_eq!(
            value_to_json(&value),
            serde_json::json!("0xd43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d")
        );
    }

    #[test]
    fn test_payee_is_unit_variant() {
        assert_eq!(value_to_json(&payee_value(Payee::Staked)), serde_json::json!("Staked"));
    }
}
