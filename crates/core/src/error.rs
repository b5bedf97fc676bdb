//! Error types for the staking client domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`ChainError`] - Chain RPC and decoding errors (read side)
//! - [`SignerError`] - Signer discovery errors
//! - [`ExtrinsicError`] - Write submission errors
//! - [`QueryError`] - Item error carried by every cached query stream
//! - [`PortalError`] - Top-level orchestration errors
//!
//! Every error that travels through a shared stream is `Clone`, because the
//! same failure is fanned out to all subscribers of a cache entry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Chain Errors
// =============================================================================

/// Blockchain RPC, subscription and decoding errors.
///
/// These errors occur when reading state from the Substrate node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// WebSocket connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// RPC request failed.
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Storage or block subscription failed or disconnected.
    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    /// Runtime metadata could not be fetched or did not contain an entry.
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// A storage value could not be decoded into a domain model.
    #[error("Decoding error: {0}")]
    DecodingError(String),

    /// An address string is not a valid SS58 account.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

// =============================================================================
// Signer Errors
// =============================================================================

/// A user-facing message identified by a translation key.
///
/// The presentation layer renders it through its own i18n catalogue; the
/// parameters are substituted into the translated template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatableMessage {
    /// Translation key (e.g. `shared.notFoundExtension`).
    pub key: String,
    /// Named template parameters.
    pub params: BTreeMap<String, String>,
}

impl TranslatableMessage {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a template parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for TranslatableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self
                .params
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            write!(f, " ({})", params.join(", "))?;
        }
        Ok(())
    }
}

/// Errors raised while discovering the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    /// No signer extension responded, even after the injection delay.
    #[error("Signer unavailable: {0}")]
    Unavailable(TranslatableMessage),

    /// The signer bridge failed in a way that may succeed on retry.
    #[error("Signer bridge error: {0}")]
    Transient(String),

    /// Key material the signer cannot use.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

impl SignerError {
    /// Whether discovery may run again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SignerError::Unavailable(_) | SignerError::Transient(_))
    }
}

// =============================================================================
// Extrinsic Errors
// =============================================================================

/// Write submission failures.
///
/// Always surfaced to the caller and recorded on the queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtrinsicError {
    /// The signer refused to sign (or holds no key for the origin).
    #[error("Signer declined: {0}")]
    SignerDeclined(String),

    /// The node rejected the transaction before dispatch.
    #[error("Rejected by node: {0}")]
    NodeRejected(String),

    /// The extrinsic was included but its dispatch failed.
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    /// The submission call failed on the network.
    #[error("Network error: {0}")]
    Network(String),

    /// The call could not be built (e.g. amount out of range for the chain).
    #[error("Invalid call: {0}")]
    InvalidCall(String),
}

impl ExtrinsicError {
    /// The bare reason, without the error kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ExtrinsicError::SignerDeclined(m)
            | ExtrinsicError::NodeRejected(m)
            | ExtrinsicError::DispatchFailed(m)
            | ExtrinsicError::Network(m)
            | ExtrinsicError::InvalidCall(m) => m,
        }
    }
}

// =============================================================================
// Query Errors
// =============================================================================

/// Error item of cached query streams.
///
/// Derived queries combine chain reads with signer output, so both can
/// terminate them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// An upstream chain read failed.
    #[error("Chain query failed: {0}")]
    Chain(#[from] ChainError),

    /// Signer discovery failed.
    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),
}

// =============================================================================
// Portal Errors
// =============================================================================

/// Top-level errors for binaries embedding the client.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Chain connectivity error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Signer error.
    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    /// Write submission error.
    #[error("Extrinsic error: {0}")]
    Extrinsic(#[from] ExtrinsicError),

    /// Query stream error.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for chain reads.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for signer operations.
pub type SignerResult<T> = Result<T, SignerError>;

/// Result type for write submissions.
pub type ExtrinsicResult<T> = Result<T, ExtrinsicError>;

/// Result type carried by query streams.
pub type QueryResult<T> = Result<T, QueryError>;

/// Result type for top-level operations.
pub type PortalResult<T> = Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use super::*;

    // The conversion chain lets `?` cross layer boundaries
    #[test]
    fn test_error_conversion_chain() {
        let chain_err = ChainError::RpcError("rpc failed".into());
        let query_err: QueryError = chain_err.into();
        let portal_err: PortalError = query_err.into();
        assert!(portal_err.to_string().contains("rpc failed"));

        let signer_err = SignerError::Transient("bridge down".into());
        let portal_err: PortalError = signer_err.into();
        assert!(portal_err.to_string().contains("bridge down"));
    }

    // The presentation layer needs the raw reason, not the prefixed Display
    #[test]
    fn test_extrinsic_error_message_is_bare_reason() {
        let err = ExtrinsicError::NodeRejected("Inability to pay fees".into());
        assert_eq!(err.message(), "Inability to pay fees");
        assert_eq!(err.to_string(), "Rejected by node: Inability to pay fees");
    }

    #[test]
    fn test_invalid_key_is_not_retryable() {
        assert!(SignerError::Transient("port closed".into()).is_retryable());
        assert!(SignerError::Unavailable(TranslatableMessage::new("x")).is_retryable());
        assert!(!SignerError::InvalidKey("bad URI".into()).is_retryable());
    }

    #[test]
    fn test_translatable_message_keeps_params() {
        let msg = TranslatableMessage::new("shared.notFoundExtension")
            .with_param("chromeLink", "https://chrome.example")
            .with_param("firefoxLink", "https://firefox.example");

        assert_eq!(msg.params.len(), 2);
        let rendered = msg.to_string();
        assert!(rendered.starts_with("shared.notFoundExtension"));
        assert!(rendered.contains("chromeLink=https://chrome.example"));
    }
}
