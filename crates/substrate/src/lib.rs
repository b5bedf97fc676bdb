//! Substrate adapters for Stakeport.
//!
//! This crate implements the two ports of `stakeport-core`:
//!
//! - [`ChainClient`] through [`SubstrateClient`], which follows storage on
//!   finalized blocks over WebSocket RPC and submits `Staking` calls
//! - [`SignerBridge`] through [`KeyringBridge`], backed by a local sr25519
//!   [`Keyring`]
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use stakeport_substrate::{Keyring, KeyringBridge, SubstrateClient, SubstrateClientConfig};
//!
//! let keyring = Arc::new(Keyring::from_uris(["//Alice"])?);
//! let client = SubstrateClient::connect(SubstrateClientConfig::default(), keyring.clone()).await?;
//! let bridge = KeyringBridge::new(keyring);
//! ```
//!
//! # Decoding
//!
//! Storage is read through subxt's dynamic API so that no generated metadata
//! is compiled in. Values go through SCALE value to JSON conversion before
//! being mapped onto the core models; account ids render as SS58.
//!
//! [`ChainClient`]: stakeport_core::ports::ChainClient
//! [`SignerBridge`]: stakeport_core::ports::SignerBridge

mod client;
mod decode;
mod keyring;

pub use client::{SubstrateBlock, SubstrateClient, SubstrateClientConfig};
pub use keyring::{KEYRING_SOURCE, Keyring, KeyringBridge};
