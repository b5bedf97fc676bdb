//! Core domain layer for the Stakeport staking client.
//!
//! This crate contains the domain models, port traits (interfaces), the
//! reactive query cache and the services sitting between UI consumers and a
//! remote Substrate node. It follows hexagonal architecture principles - this
//! is the innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    stakeport (binary)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   stakeport-substrate                       │
//! │          (subxt chain client, keyring signer)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 stakeport-core  ← YOU ARE HERE              │
//! │      (models, ports, cache, streams, services)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (ledgers, balances, calls, queue entries)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`cache`] - Keyed observable cache and memoized stream factories
//! - [`streams`] - Stream combinators for derived queries
//! - [`services`] - Queries, signer discovery and the submission queue
//! - [`config`] - Service configuration
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::ChainClient`] - Live chain reads and extrinsic submission
//! - [`ports::SignerBridge`] - Authorization and accounts of the external signer
//!
//! ## Shared queries
//!
//! Every read of [`services::ChainQueryService`] goes through a
//! [`cache::Memoized`] factory. Equal arguments share one upstream
//! subscription and late subscribers start from the latest value.
//!
//! ## Write lifecycle
//!
//! 1. A command appends a `Pending` entry to the queue
//! 2. The chain client signs and broadcasts the call
//! 3. The command resolves once the node acknowledged it
//! 4. `InBlock`, `Finalized` or `Failed` events update the entry

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
pub mod streams;
