use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::retention::{ClaimPolicy, PrunePolicy};

/// Environment prefix for configuration overrides, e.g. `PEERBOOK_MAX_NODES`.
pub const ENV_PREFIX: &str = "PEERBOOK";

/// Default delay before a peer that was dialed may be dialed again.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory. `None` opens a temporary store.
    pub path: Option<PathBuf>,
    pub cache_capacity_bytes: u64,
    /// Background flush interval. `0` disables background flushing.
    pub flush_every_ms: u64,
    /// Dial cool-down applied by default peer selection.
    pub cooldown_secs: u64,
    pub max_age_secs: Option<u64>,
    pub max_nodes: Option<usize>,
    pub prune_batch_size: usize,
    /// Grace period for superseded address claims. `None` keeps every claim.
    pub claim_grace_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_capacity_bytes: 64 * 1024 * 1024,
            flush_every_ms: 500,
            cooldown_secs: DEFAULT_COOLDOWN.as_secs(),
            max_age_secs: Some(7 * 24 * 60 * 60),
            max_nodes: Some(10_000),
            prune_batch_size: 256,
            claim_grace_secs: None,
        }
    }
}

impl StoreConfig {
    /// Load configuration from an optional file, overridden by `PEERBOOK_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                bail!("Configuration file {} not found", path.display());
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config = builder
            .build()
            .context("failed to assemble store configuration")?;
        config
            .try_deserialize()
            .context("failed to decode store configuration")
    }

    pub fn in_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Pruning policy described by this configuration.
    pub fn prune_policy(&self) -> PrunePolicy {
        PrunePolicy {
            max_age: self.max_age_secs.map(Duration::from_secs),
            max_nodes: self.max_nodes,
            batch_size: self.prune_batch_size.max(1),
            claims: match self.claim_grace_secs {
                Some(secs) => ClaimPolicy::KeepMostRecentSuccess {
                    grace: Duration::from_secs(secs),
                },
                None => ClaimPolicy::KeepAll,
            },
        }
    }
}
