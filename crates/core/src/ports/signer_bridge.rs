//! Port trait for the external signer.
//!
//! The signer holds the user's keys. The core only needs to ask for
//! authorization and to follow the list of accounts it exposes; signing
//! itself happens inside the [`ChainClient`](super::ChainClient) adapter.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::SignerResult;
use crate::models::{SignerAccount, SignerProvider};

/// Live account list. Dropping the stream unsubscribes.
pub type AccountStream = Pin<Box<dyn Stream<Item = SignerResult<Vec<SignerAccount>>> + Send>>;

/// Port trait for signer discovery.
#[async_trait]
pub trait SignerBridge: Send + Sync {
    /// Ask every installed signer provider to authorize `app_name`.
    ///
    /// An empty list means no provider has been injected (yet).
    async fn request_authorization(&self, app_name: &str) -> SignerResult<Vec<SignerProvider>>;

    /// Follow the accounts exposed by the authorized providers.
    async fn subscribe_accounts(&self) -> SignerResult<AccountStream>;
}
