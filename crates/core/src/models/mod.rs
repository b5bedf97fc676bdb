//! Domain models for the staking client.
//!
//! These models are transport-agnostic: adapters decode chain data into them
//! and the presentation layer consumes them as-is. Monetary values are
//! arbitrary-precision integers in the chain's minimal unit.

mod call;
mod extrinsic;

use std::fmt;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

pub use call::{Payee, StakingCall};
pub use extrinsic::{ExtrinsicId, ExtrinsicStatus, SubmittedExtrinsic, TxEvent};

/// Amount in the chain's minimal unit.
pub type Balance = BigUint;

/// Serde helpers rendering [`Balance`] as a decimal string.
///
/// JSON numbers cannot hold 128-bit balances, so amounts travel as strings.
pub mod balance_serde {
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::Balance;

    pub fn serialize<S: Serializer>(value: &Balance, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Balance, D::Error> {
        let s = String::deserialize(deserializer)?;
        Balance::from_str(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// SS58-encoded account address (stash or controller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Account(String);

impl Account {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Account {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl From<String> for Account {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl AsRef<str> for Account {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An account exposed by the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerAccount {
    /// Account address.
    pub address: Account,
    /// Display name chosen by the user in the signer.
    pub name: Option<String>,
    /// Provider that exposes this account.
    pub source: String,
}

/// A signer provider that granted authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerProvider {
    pub name: String,
    pub version: String,
}

// =============================================================================
// Staking
// =============================================================================

/// A chunk of stake scheduled to unlock at `era`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockChunk {
    #[serde(with = "balance_serde")]
    pub value: Balance,
    pub era: u32,
}

/// Staking ledger of a controller account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingLedger {
    /// Controller the ledger is stored under.
    pub controller: Account,
    /// Stash holding the funds.
    pub stash: Account,
    /// Total bonded, including unlocking chunks.
    #[serde(with = "balance_serde")]
    pub total: Balance,
    /// Bonded amount actively staking.
    #[serde(with = "balance_serde")]
    pub active: Balance,
    /// Unbonding schedule.
    pub unlocking: Vec<UnlockChunk>,
}

impl StakingLedger {
    /// Sum of the unlocking chunks whose era has been reached.
    pub fn redeemable(&self, active_era: u32) -> Balance {
        self.unlocking
            .iter()
            .filter(|chunk| chunk.era <= active_era)
            .fold(Balance::zero(), |acc, chunk| acc + &chunk.value)
    }
}

/// Staking information derived from several storage entries of a stash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedStakingInfo {
    pub stash: Account,
    pub controller: Option<Account>,
    /// Validators nominated by this stash, in chain order.
    pub nominators: Vec<Account>,
    #[serde(with = "balance_serde")]
    pub redeemable: Balance,
    pub staking_ledger: Option<StakingLedger>,
}

impl DerivedStakingInfo {
    /// Actively bonded amount, zero without a ledger.
    pub fn active_bonded(&self) -> Balance {
        self.staking_ledger
            .as_ref()
            .map(|ledger| ledger.active.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Balances
// =============================================================================

/// Balance of a single account.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Transferable amount.
    #[serde(with = "balance_serde")]
    pub available: Balance,
    /// Free plus reserved.
    #[serde(with = "balance_serde")]
    pub total: Balance,
}

/// Totals across every account known to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateMetrics {
    #[serde(with = "balance_serde")]
    pub total_balance: Balance,
    #[serde(with = "balance_serde")]
    pub total_bonded: Balance,
}

impl AggregateMetrics {
    /// Fold per-account balances and staking info by addition.
    pub fn from_accounts<'a, I>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (&'a BalanceSnapshot, &'a DerivedStakingInfo)>,
    {
        accounts
            .into_iter()
            .fold(Self::default(), |acc, (balance, staking)| Self {
                total_balance: acc.total_balance + &balance.available,
                total_bonded: acc.total_bonded + staking.active_bonded(),
            })
    }
}

// =============================================================================
// Chain & Session
// =============================================================================

/// Properties advertised by the node (`system_properties`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainProperties {
    pub ss58_format: Option<u16>,
    pub token_decimals: Option<u32>,
    pub token_symbol: Option<String>,
}

/// Session and era progress.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub current_index: u32,
    pub current_era: Option<u32>,
    pub active_era: Option<u32>,
    pub validator_count: u32,
    pub sessions_per_era: u32,
}

/// Timestamp helper shared by queue entries.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(active: u64, unlocking: &[(u64, u32)]) -> StakingLedger {
        StakingLedger {
            controller: Account::from("ctrl"),
            stash: Account::from("stash"),
            total: Balance::from(active + unlocking.iter().map(|(v, _)| v).sum::<u64>()),
            active: Balance::from(active),
            unlocking: unlocking
                .iter()
                .map(|(value, era)| UnlockChunk {
                    value: Balance::from(*value),
                    era: *era,
                })
                .collect(),
        }
    }

    #[test]
    fn test_redeemable_counts_only_reached_eras() {
        let ledger = ledger(100, &[(10, 3), (20, 5), (40, 9)]);
        assert_eq!(ledger.redeemable(2), Balance::zero());
        assert_eq!(ledger.redeemable(5), Balance::from(30u32));
        assert_eq!(ledger.redeemable(9), Balance::from(70u32));
    }

    // Amounts beyond u128 must not lose precision
    #[test]
    fn test_aggregate_is_arbitrary_precision() {
        let huge: Balance = "340282366920938463463374607431768211455".parse().unwrap();
        let a = BalanceSnapshot {
            available: huge.clone(),
            total: huge.clone(),
        };
        let b = BalanceSnapshot {
            available: huge.clone(),
            total: huge.clone(),
        };
        let staking = DerivedStakingInfo {
            stash: Account::from("s"),
            controller: None,
            nominators: vec![],
            redeemable: Balance::zero(),
            staking_ledger: None,
        };

        let totals = AggregateMetrics::from_accounts([(&a, &staking), (&b, &staking)]);
        assert_eq!(totals.total_balance, huge.clone() + huge);
        assert_eq!(totals.total_bonded, Balance::zero());
    }

    #[test]
    fn test_balance_serializes_as_decimal_string() {
        let snapshot = BalanceSnapshot {
            available: Balance::from(500u32),
            total: Balance::from(1_000u32),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["available"], "500");

        let back: BalanceSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
