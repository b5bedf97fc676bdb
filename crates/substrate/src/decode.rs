//! SCALE value to JSON conversion and decoding of staking storage.
//!
//! Storage is fetched dynamically, converted to JSON and then read into the
//! domain models. Amounts are carried as decimal strings in the JSON form.

use std::str::FromStr;

use num_bigint::BigUint;
use serde_json::Value as Json;
use subxt::ext::scale_value::{Composite, Primitive, Value, ValueDef};
use subxt::utils::AccountId32;

use stakeport_core::error::{ChainError, ChainResult};
use stakeport_core::models::{
    Account, Balance, BalanceSnapshot, ChainProperties, StakingLedger, UnlockChunk,
};

// =============================================================================
// SCALE Value to JSON conversion
// =============================================================================

/// Convert a Composite to a JSON value.
pub(crate) fn composite_to_json<T>(composite: &Composite<T>) -> Json {
    match composite {
        Composite::Unnamed(values) => {
            // Byte arrays (AccountId, Hash) become hex strings
            if let Some(hex_str) = try_as_byte_array(values) {
                return Json::String(hex_str);
            }
            // Unwrap single-element tuples (newtypes like AccountId32, BoundedVec)
            if values.len() == 1 {
                return value_to_json(&values[0]);
            }
            Json::Array(values.iter().map(value_to_json).collect())
        }
        Composite::Named(fields) => {
            let obj: serde_json::Map<String, Json> = fields
                .iter()
                .map(|(name, v)| (name.clone(), value_to_json(v)))
                .collect();
            Json::Object(obj)
        }
    }
}

/// Interpret an unnamed composite of 32 bytes as a hex string.
fn try_as_byte_array<T>(values: &[Value<T>]) -> Option<String> {
    if values.len() != 32 {
        return None;
    }

    let mut bytes = Vec::with_capacity(values.len());
    for value in values {
        match &value.value {
            ValueDef::Primitive(Primitive::U128(n)) if *n <= 255 => bytes.push(*n as u8),
            _ => return None,
        }
    }

    Some(format!("0x{}", hex::encode(bytes)))
}

/// Convert a Value to a JSON value.
pub(crate) fn value_to_json<T>(value: &Value<T>) -> Json {
    match &value.value {
        ValueDef::Composite(composite) => composite_to_json(composite),
        ValueDef::Variant(variant) => {
            let inner = composite_to_json(&variant.values);
            match variant.name.as_str() {
                "None" => Json::Null,
                // Option and MultiAddress wrappers
                "Some" | "Id" => inner,
                // Fieldless enum variants (e.g. RewardDestination::Staked)
                name if variant.values.is_empty() => Json::String(name.to_string()),
                name => {
                    let mut map = serde_json::Map::new();
                    map.insert(name.to_string(), inner);
                    Json::Object(map)
                }
            }
        }
        ValueDef::Primitive(primitive) => primitive_to_json(primitive),
        ValueDef::BitSequence(bits) => Json::String(format!("{:?}", bits)),
    }
}

/// Convert a Primitive to a JSON value.
fn primitive_to_json(primitive: &Primitive) -> Json {
    match primitive {
        Primitive::Bool(b) => Json::Bool(*b),
        Primitive::Char(c) => Json::String(c.to_string()),
        Primitive::String(s) => Json::String(s.clone()),
        Primitive::U128(n) => Json::String(n.to_string()),
        Primitive::I128(n) => Json::String(n.to_string()),
        Primitive::U256(n) => Json::String(format!("{:?}", n)),
        Primitive::I256(n) => Json::String(format!("{:?}", n)),
    }
}

// =============================================================================
// JSON readers
// =============================================================================

/// Items of a sequence. Single-element sequences were unwrapped during
/// conversion, so a lone non-array value is a one-item list.
pub(crate) fn as_list(value: &Json) -> Vec<&Json> {
    match value {
        Json::Null => Vec::new(),
        Json::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn field<'a>(value: &'a Json, name: &str) -> ChainResult<&'a Json> {
    value
        .get(name)
        .ok_or_else(|| ChainError::DecodingError(format!("missing field `{name}`")))
}

/// Hex-encoded AccountId32 to an SS58 address.
pub(crate) fn parse_account(value: &Json) -> ChainResult<Account> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| ChainError::DecodingError(format!("expected account, got {value}")))?;
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| ChainError::DecodingError(e.to_string()))?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::DecodingError(format!("bad account length: {hex_str}")))?;
    Ok(Account::new(AccountId32(raw).to_string()))
}

pub(crate) fn parse_accounts(value: &Json) -> ChainResult<Vec<Account>> {
    as_list(value).into_iter().map(parse_account).collect()
}

pub(crate) fn parse_amount(value: &Json) -> ChainResult<Balance> {
    match value {
        Json::String(s) => BigUint::from_str(s)
            .map_err(|e| ChainError::DecodingError(format!("bad amount {s}: {e}"))),
        Json::Number(n) => n
            .as_u64()
            .map(Balance::from)
            .ok_or_else(|| ChainError::DecodingError(format!("bad amount {n}"))),
        other => Err(ChainError::DecodingError(format!(
            "expected amount, got {other}"
        ))),
    }
}

pub(crate) fn parse_u32(value: &Json) -> ChainResult<u32> {
    let parsed = match value {
        Json::String(s) => s.parse().ok(),
        Json::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    };
    parsed.ok_or_else(|| ChainError::DecodingError(format!("expected u32, got {value}")))
}

/// `Staking.Ledger` entry. The controller is the storage key.
pub(crate) fn parse_ledger(controller: &Account, value: &Json) -> ChainResult<StakingLedger> {
    let unlocking = match value.get("unlocking") {
        Some(chunks) => as_list(chunks)
            .into_iter()
            .map(|chunk| {
                Ok(UnlockChunk {
                    value: parse_amount(field(chunk, "value")?)?,
                    era: parse_u32(field(chunk, "era")?)?,
                })
            })
            .collect::<ChainResult<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(StakingLedger {
        controller: controller.clone(),
        stash: parse_account(field(value, "stash")?)?,
        total: parse_amount(field(value, "total")?)?,
        active: parse_amount(field(value, "active")?)?,
        unlocking,
    })
}

/// `Staking.Nominators` entry: the nominated targets.
pub(crate) fn parse_nominations(value: &Json) -> ChainResult<Vec<Account>> {
    parse_accounts(field(value, "targets")?)
}

/// `Staking.ActiveEra` entry: the era index.
pub(crate) fn parse_active_era(value: &Json) -> ChainResult<u32> {
    parse_u32(field(value, "index")?)
}

/// `System.Account` entry.
///
/// Available is free minus the frozen amount, total is free plus reserved.
/// Runtimes before the fungible migration split frozen into `misc_frozen`
/// and `fee_frozen`.
pub(crate) fn parse_balance(value: &Json) -> ChainResult<BalanceSnapshot> {
    let data = field(value, "data")?;
    let free = parse_amount(field(data, "free")?)?;
    let reserved = parse_amount(field(data, "reserved")?)?;

    let frozen = match data.get("frozen") {
        Some(frozen) => parse_amount(frozen)?,
        None => {
            let misc = data.get("misc_frozen").map(parse_amount).transpose()?;
            let fee = data.get("fee_frozen").map(parse_amount).transpose()?;
            misc.into_iter().chain(fee).max().unwrap_or_default()
        }
    };

    let available = if free > frozen {
        &free - &frozen
    } else {
        Balance::default()
    };

    Ok(BalanceSnapshot {
        available,
        total: free + reserved,
    })
}

/// `system_properties` RPC result. Multi-token chains report arrays; the
/// first entry is the native token.
pub(crate) fn parse_properties(properties: &serde_json::Map<String, Json>) -> ChainProperties {
    let first = |value: &Json| match value {
        Json::Array(items) => items.first().cloned(),
        other => Some(other.clone()),
    };

    ChainProperties {
        ss58_format: properties
            .get("ss58Format")
            .and_then(Json::as_u64)
            .and_then(|n| u16::try_from(n).ok()),
        token_decimals: properties
            .get("tokenDecimals")
            .and_then(first)
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok()),
        token_symbol: properties
            .get("tokenSymbol")
            .and_then(first)
            .and_then(|v| v.as_str().map(str::to_string)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ALICE_HEX: &str = "0xd43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";
    const ALICE_SS58: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    fn alice_bytes() -> Value<()> {
        let bytes = hex::decode(ALICE_HEX.trim_start_matches("0x")).unwrap();
        Value::unnamed_composite(bytes.into_iter().map(|b| Value::u128(b as u128)))
    }

    #[test]
    fn test_account_id_becomes_ss58() {
        // AccountId32 is a newtype over [u8; 32]
        let account = Value::unnamed_composite([alice_bytes()]);
        let json = value_to_json(&account);
        assert_eq!(json, json!(ALICE_HEX));
        assert_eq!(parse_account(&json).unwrap().as_str(), ALICE_SS58);
    }

    #[test]
    fn test_option_and_unit_variants() {
        let none = Value::unnamed_variant("None", []);
        assert_eq!(value_to_json(&none), Json::Null);

        let some = Value::unnamed_variant("Some", [Value::u128(7)]);
        assert_eq!(value_to_json(&some), json!("7"));

        let staked = Value::unnamed_variant("Staked", []);
        assert_eq!(value_to_json(&staked), json!("Staked"));
    }

    #[test]
    fn test_parse_ledger() {
        let controller = Account::from(ALICE_SS58);
        let ledger = Value::named_composite([
            ("stash", Value::unnamed_composite([alice_bytes()])),
            ("total", Value::u128(1_500)),
            ("active", Value::u128(1_000)),
            (
                "unlocking",
                // BoundedVec with a single chunk
                Value::unnamed_composite([Value::unnamed_composite([Value::named_composite([
                    ("value", Value::u128(500)),
                    ("era", Value::u128(12)),
                ])])]),
            ),
        ]);

        let parsed = parse_ledger(&controller, &value_to_json(&ledger)).unwrap();
        assert_eq!(parsed.stash.as_str(), ALICE_SS58);
        assert_eq!(parsed.total, Balance::from(1_500u32));
        assert_eq!(parsed.active, Balance::from(1_000u32));
        assert_eq!(
            parsed.unlocking,
            vec![UnlockChunk {
                value: Balance::from(500u32),
                era: 12
            }]
        );
        assert_eq!(parsed.redeemable(12), Balance::from(500u32));
        assert_eq!(parsed.redeemable(11), Balance::default());
    }

    #[test]
    fn test_parse_balance_with_frozen() {
        let account = json!({
            "nonce": "3",
            "data": {"free": "1000", "reserved": "200", "frozen": "300", "flags": "0"}
        });
        let balance = parse_balance(&account).unwrap();
        assert_eq!(balance.available, Balance::from(700u32));
        assert_eq!(balance.total, Balance::from(1_200u32));
    }

    #[test]
    fn test_parse_balance_legacy_and_overfrozen() {
        let account = json!({
            "data": {"free": "100", "reserved": "0", "misc_frozen": "150", "fee_frozen": "20"}
        });
        let balance = parse_balance(&account).unwrap();
        // Never negative
        assert_eq!(balance.available, Balance::default());
        assert_eq!(balance.total, Balance::from(100u32));
    }

    #[test]
    fn test_parse_properties() {
        let props = json!({"ss58Format": 42, "tokenDecimals": [12, 18], "tokenSymbol": ["UNIT", "DOT"]});
        let parsed = parse_properties(props.as_object().unwrap());
        assert_eq!(parsed.ss58_format, Some(42));
        assert_eq!(parsed.token_decimals, Some(12));
        assert_eq!(parsed.token_symbol.as_deref(), Some("UNIT"));

        let parsed = parse_properties(&serde_json::Map::new());
        assert_eq!(parsed, ChainProperties::default());
    }

    #[test]
    fn test_as_list_handles_unwrapped_singletons() {
        assert!(as_list(&Json::Null).is_empty());
        assert_eq!(as_list(&json!("0x01")).len(), 1);
        assert_eq!(as_list(&json!(["0x01", "0x02"])).len(), 2);
    }
}
