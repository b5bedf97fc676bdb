//! Local sr25519 keyring acting as the external signer.
//!
//! Keys are derived from secret URIs (`//Alice`, a mnemonic, a hex seed with
//! derivation paths). The keyring signs for [`SubstrateClient`] and is exposed
//! to the core through [`KeyringBridge`], which implements the signer port.
//!
//! [`SubstrateClient`]: crate::SubstrateClient

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use subxt::utils::AccountId32;
use subxt_signer::SecretUri;
use subxt_signer::sr25519::Keypair;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

use stakeport_core::error::{SignerError, SignerResult};
use stakeport_core::models::{Account, SignerAccount, SignerProvider};
use stakeport_core::ports::{AccountStream, SignerBridge};

/// Provider name reported to the core.
pub const KEYRING_SOURCE: &str = "stakeport-keyring";

struct Key {
    account: Account,
    name: Option<String>,
    pair: Keypair,
}

/// In-memory set of signing keys.
pub struct Keyring {
    keys: RwLock<Vec<Key>>,
    accounts: watch::Sender<Vec<SignerAccount>>,
}

impl Keyring {
    pub fn new() -> Self {
        let (accounts, _) = watch::channel(Vec::new());
        Self {
            keys: RwLock::new(Vec::new()),
            accounts,
        }
    }

    /// Build a keyring from secret URIs.
    pub fn from_uris<I, S>(uris: I) -> SignerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keyring = Self::new();
        for uri in uris {
            keyring.add_uri(uri.as_ref(), None)?;
        }
        Ok(keyring)
    }

    /// Add a key. Returns its SS58 address.
    pub fn add_uri(&self, uri: &str, name: Option<String>) -> SignerResult<Account> {
        let secret = SecretUri::from_str(uri)
            .map_err(|e| SignerError::InvalidKey(format!("invalid secret URI: {e}")))?;
        let pair = Keypair::from_uri(&secret)
            .map_err(|e| SignerError::InvalidKey(format!("cannot derive key: {e}")))?;
        let account = Account::new(AccountId32(pair.public_key().0).to_string());

        // Dev URIs like //Alice make a readable default name
        let name = name.or_else(|| uri.strip_prefix("//").map(str::to_string));

        let mut keys = self.keys.write();
        if keys.iter().any(|key| key.account == account) {
            debug!(%account, "Key already in keyring");
            return Ok(account);
        }
        keys.push(Key {
            account: account.clone(),
            name,
            pair,
        });
        let listed = list(&keys);
        drop(keys);

        info!(%account, "🔐 Key added to keyring");
        self.accounts.send_replace(listed);
        Ok(account)
    }

    /// Keypair for `account`, if held.
    pub fn signer(&self, account: &Account) -> Option<Keypair> {
        self.keys
            .read()
            .iter()
            .find(|key| &key.account == account)
            .map(|key| key.pair.clone())
    }

    pub fn accounts(&self) -> Vec<SignerAccount> {
        self.accounts.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

fn list(keys: &[Key]) -> Vec<SignerAccount> {
    keys.iter()
        .map(|key| SignerAccount {
            address: key.account.clone(),
            name: key.name.clone(),
            source: KEYRING_SOURCE.to_string(),
        })
        .collect()
}

// =============================================================================
// SignerBridge
// =============================================================================

/// Signer port backed by a [`Keyring`].
///
/// An empty keyring behaves like a host without signer extension: the
/// authorization request gets no provider.
pub struct KeyringBridge {
    keyring: Arc<Keyring>,
}

impl KeyringBridge {
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self { keyring }
    }
}

#[async_trait]
impl SignerBridge for KeyringBridge {
    async fn request_authorization(&self, app_name: &str) -> SignerResult<Vec<SignerProvider>> {
        if self.keyring.is_empty() {
            debug!(app_name, "Keyring is empty");
            return Ok(Vec::new());
        }
        debug!(app_name, keys = self.keyring.len(), "Authorizing with keyring");
        Ok(vec![SignerProvider {
            name: KEYRING_SOURCE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }])
    }

    async fn subscribe_accounts(&self) -> SignerResult<AccountStream> {
        let accounts = WatchStream::new(self.keyring.accounts.subscribe()).map(Ok);
        Ok(accounts.boxed())
    }
}
