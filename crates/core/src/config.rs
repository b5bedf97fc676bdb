//! Aggregated configuration of the core services.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{PortalError, PortalResult};
use crate::services::{DiscoveryConfig, QueueConfig};

/// Everything [`ChainQueryService`](crate::services::ChainQueryService) needs
/// besides its ports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub cache: CacheConfig,
    pub discovery: DiscoveryConfig,
    pub queue: QueueConfig,
}

impl PortalConfig {
    /// Parse a JSON document. Missing sections take their defaults.
    pub fn from_json(json: &str) -> PortalResult<Self> {
        serde_json::from_str(json).map_err(|e| PortalError::ConfigError(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> PortalResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| PortalError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}
