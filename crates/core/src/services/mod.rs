//! Core services.
//!
//! - [`ChainQueryService`] - memoized live reads and staking commands
//! - [`SignerDiscoveryService`] - signer handshake and account list
//! - [`ExtrinsicSubmissionQueue`] - write submissions and their lifecycle

mod extrinsic_queue;
#[cfg(test)]
pub(crate) mod mock;
mod query;
mod signer;

pub use extrinsic_queue::{ExtrinsicSubmissionQueue, QueueConfig, QueueStream};
pub use query::ChainQueryService;
pub use signer::{
    CHROME_EXTENSION_URL, DiscoveryConfig, DiscoveryState, FIREFOX_EXTENSION_URL,
    NOT_FOUND_EXTENSION, SignerDiscoveryService, extension_not_found,
};
