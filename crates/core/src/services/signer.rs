//! Signer discovery - finds the external signer and follows its accounts.
//!
//! Signer extensions inject themselves into the host asynchronously, so the
//! first authorization request can race the injection. Discovery therefore
//! waits once per attempt when nobody answers and retries the whole
//! request-and-subscribe sequence a bounded number of times.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheConfig, Memoized, QueryStream, Subscription};
use crate::error::{QueryError, SignerError, SignerResult, TranslatableMessage};
use crate::metrics::record_discovery_attempt;
use crate::models::SignerAccount;
use crate::ports::{AccountStream, SignerBridge};

/// Translation key of the "no signer extension" message.
pub const NOT_FOUND_EXTENSION: &str = "shared.notFoundExtension";

/// Store page of the polkadot{.js} extension for Chrome.
pub const CHROME_EXTENSION_URL: &str = "https://chrome.google.com/webstore/detail/polkadot%7Bjs%7D-extension/mopnmbcafieddcagagdcbnhejhlodfdd";

/// Store page of the polkadot{.js} extension for Firefox.
pub const FIREFOX_EXTENSION_URL: &str =
    "https://addons.mozilla.org/en-US/firefox/addon/polkadot-js-extension/";

/// The error surfaced when no signer extension is installed.
pub fn extension_not_found() -> SignerError {
    SignerError::Unavailable(
        TranslatableMessage::new(NOT_FOUND_EXTENSION)
            .with_param("chromeLink", CHROME_EXTENSION_URL)
            .with_param("firefoxLink", FIREFOX_EXTENSION_URL),
    )
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for signer discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Name presented to the signer when requesting authorization.
    pub app_name: String,
    /// Total number of request-and-subscribe attempts.
    pub max_attempts: u32,
    /// Wait after an attempt where no provider answered.
    pub injection_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            app_name: "Stakeport".to_string(),
            max_attempts: 3,
            injection_delay: Duration::from_millis(1000),
        }
    }
}

/// Observable progress of discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiscoveryState {
    Idle,
    Requesting { attempt: u32 },
    Subscribed,
    Unavailable,
}

// =============================================================================
// SignerDiscoveryService
// =============================================================================

struct Discovery {
    bridge: Arc<dyn SignerBridge>,
    config: DiscoveryConfig,
    state: watch::Sender<DiscoveryState>,
}

/// Discovers the signer and exposes its live account list.
///
/// The account list is a memoized singleton: every consumer shares one
/// bridge subscription.
pub struct SignerDiscoveryService {
    discovery: Arc<Discovery>,
    accounts: Memoized<(), (), Vec<SignerAccount>>,
}

impl SignerDiscoveryService {
    pub fn new(
        bridge: Arc<dyn SignerBridge>,
        config: DiscoveryConfig,
        cache_config: CacheConfig,
    ) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Idle);
        let discovery = Arc::new(Discovery {
            bridge,
            config,
            state,
        });

        let factory = discovery.clone();
        let accounts = Memoized::singleton("signer_accounts", cache_config, move || {
            account_stream(factory.clone())
        });

        Self {
            discovery,
            accounts,
        }
    }

    /// Live list of signer accounts.
    ///
    /// Fails with [`SignerError::Unavailable`] once every attempt found no
    /// signer; the error is replayed to later subscribers.
    pub fn discover(&self) -> Subscription<Vec<SignerAccount>> {
        self.accounts.call(&())
    }

    pub fn state(&self) -> DiscoveryState {
        *self.discovery.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DiscoveryState> {
        self.discovery.state.subscribe()
    }
}

struct Session {
    discovery: Arc<Discovery>,
    /// Attempts spent so far, shared by connecting and reconnecting.
    attempts: u32,
    live: Option<AccountStream>,
    done: bool,
}

/// Lazy discovery: nothing happens until the shared entry starts pumping.
///
/// A retryable error on the live account stream re-runs the whole
/// request-and-subscribe sequence while attempts remain.
fn account_stream(discovery: Arc<Discovery>) -> QueryStream<Vec<SignerAccount>> {
    let session = Session {
        discovery,
        attempts: 0,
        live: None,
        done: false,
    };

    stream::unfold(session, |mut s| async move {
        if s.done {
            return None;
        }
        loop {
            if s.live.is_none() {
                match s.discovery.connect(&mut s.attempts).await {
                    Ok(accounts) => s.live = Some(accounts),
                    Err(e) => {
                        s.done = true;
                        return Some((Err(QueryError::from(e)), s));
                    }
                }
            }
            let Some(live) = s.live.as_mut() else {
                return None;
            };

            match live.next().await {
                Some(Ok(accounts)) => return Some((Ok(accounts), s)),
                Some(Err(e)) if e.is_retryable() && s.attempts < s.discovery.max_attempts() => {
                    warn!(attempts = s.attempts, error = %e, "Signer account stream failed, reconnecting");
                    s.live = None;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Signer account stream failed");
                    s.discovery.state.send_replace(DiscoveryState::Unavailable);
                    s.done = true;
                    return Some((Err(QueryError::from(e)), s));
                }
                None => {
                    debug!("Signer account stream ended");
                    return None;
                }
            }
        }
    })
    .boxed()
}

impl Discovery {
    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Run request-and-subscribe attempts until one succeeds or the budget
    /// is spent. `attempts` carries the count across reconnections.
    #[instrument(skip_all, fields(app = %self.config.app_name))]
    async fn connect(&self, attempts: &mut u32) -> SignerResult<AccountStream> {
        let max_attempts = self.max_attempts();
        let mut last_error = None;

        while *attempts < max_attempts {
            *attempts += 1;
            let attempt = *attempts;
            self.state
                .send_replace(DiscoveryState::Requesting { attempt });
            record_discovery_attempt(attempt);

            match self.attempt().await {
                Ok(accounts) => {
                    info!(attempt, "🔑 Signer connected");
                    self.state.send_replace(DiscoveryState::Subscribed);
                    return Ok(accounts);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, max_attempts, error = %e, "Signer discovery attempt failed");
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Signer discovery failed");
                    last_error = Some(e);
                    break;
                }
            }
        }

        self.state.send_replace(DiscoveryState::Unavailable);
        Err(last_error.unwrap_or_else(extension_not_found))
    }

    async fn attempt(&self) -> SignerResult<AccountStream> {
        let providers = self
            .bridge
            .request_authorization(&self.config.app_name)
            .await?;

        if providers.is_empty() {
            debug!(
                delay_ms = self.config.injection_delay.as_millis() as u64,
                "No signer provider answered, waiting for injection"
            );
            tokio::time::sleep(self.config.injection_delay).await;
            return Err(extension_not_found());
        }

        debug!(
            providers = providers.len(),
            names = ?providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "Signer providers authorized"
        );
        self.bridge.subscribe_accounts().await
    }
}
