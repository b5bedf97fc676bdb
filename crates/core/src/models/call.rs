//! Typed staking write requests.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Account, Balance};

/// Destination of staking rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payee {
    /// Rewards are added to the bonded amount.
    Staked,
    /// Rewards are paid to the stash, not bonded.
    Stash,
    /// Rewards are paid to the controller.
    Controller,
}

impl Payee {
    pub fn as_str(&self) -> &'static str {
        match self {
            Payee::Staked => "Staked",
            Payee::Stash => "Stash",
            Payee::Controller => "Controller",
        }
    }
}

/// A state-changing call of the Staking pallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakingCall {
    /// Bond `value` from the origin stash.
    Bond {
        controller: Account,
        value: Balance,
        payee: Payee,
    },
    /// Add up to `max_additional` to an existing bond.
    BondExtra { max_additional: Balance },
    /// Schedule `value` for unlocking.
    Unbond { value: Balance },
    /// Replace the nominated validators.
    Nominate { targets: Vec<Account> },
    /// Stop nominating.
    Chill,
    /// Withdraw unlocked chunks.
    WithdrawUnbonded,
}

impl StakingCall {
    /// Method identifier, `pallet.call`.
    pub fn method(&self) -> &'static str {
        match self {
            StakingCall::Bond { .. } => "staking.bond",
            StakingCall::BondExtra { .. } => "staking.bondExtra",
            StakingCall::Unbond { .. } => "staking.unbond",
            StakingCall::Nominate { .. } => "staking.nominate",
            StakingCall::Chill => "staking.chill",
            StakingCall::WithdrawUnbonded => "staking.withdrawUnbonded",
        }
    }

    /// Parameter payload recorded on the queue entry.
    pub fn params(&self) -> Value {
        match self {
            StakingCall::Bond {
                controller,
                value,
                payee,
            } => json!({
                "controller": controller.as_str(),
                "payee": payee.as_str(),
                "value": value.to_string(),
            }),
            StakingCall::BondExtra { max_additional } => json!({
                "maxAdditionalValue": max_additional.to_string(),
            }),
            StakingCall::Unbond { value } => json!({ "value": value.to_string() }),
            StakingCall::Nominate { targets } => json!({
                "nextNominees": targets.iter().map(Account::as_str).collect::<Vec<_>>(),
            }),
            StakingCall::Chill | StakingCall::WithdrawUnbonded => json!({}),
        }
    }
}
