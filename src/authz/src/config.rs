//! Runtime configuration for permission resolution

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthzError, Result};

/// Permission cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthzConfig {
    /// When false every lookup answers the default value and no table is
    /// ever built
    pub enabled: bool,

    /// Keep answering from the last successfully built table when a rebuild
    /// fails; the failure is still logged and kept in `last_error`
    pub serve_stale_on_failure: bool,

    /// Drop table entries equal to the default value. Lookups are unaffected.
    pub prune_defaults: bool,

    /// Rebuilds slower than this are logged at warn level
    pub slow_rebuild_ms: u64,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serve_stale_on_failure: true,
            prune_defaults: false,
            slow_rebuild_ms: 500,
        }
    }
}

impl AuthzConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| AuthzError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slow_rebuild_ms == 0 {
            return Err(AuthzError::Config(
                "slow_rebuild_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn slow_rebuild_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_rebuild_ms)
    }
}
