//! Runtime configuration loaded from `market.toml`.
//!
//! ```toml
//! [storage]
//! backend = "sqlite"        # or "memory"
//! path = ".agent-market/market.db"
//! id_strategy = "random"    # memory backend only
//!
//! [treasury]
//! max_single_transfer = 1000000
//! required_approvals = 2
//!
//! [roles]
//! alice = ["verifier", "treasury"]
//! ```
//!
//! A missing file yields the defaults. `AGENT_MARKET_CONFIG` overrides the path.

use crate::core::db;
use crate::core::error::MarketError;
use crate::core::memory::{IdStrategy, InMemoryStore};
use crate::core::sqlite::SqliteStore;
use crate::core::store::MarketStore;
use crate::plugins::policy::{AuthorizationPolicy, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONFIG_ENV: &str = "AGENT_MARKET_CONFIG";
pub const CONFIG_FILE: &str = "market.toml";
pub const DATA_DIR: &str = ".agent-market";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,
    /// Database file; relative paths resolve against the config root.
    pub path: Option<PathBuf>,
    pub id_strategy: IdStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    pub max_single_transfer: u64,
    pub required_approvals: u32,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        TreasuryConfig {
            max_single_transfer: 1_000_000,
            required_approvals: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub storage: StorageConfig,
    pub treasury: TreasuryConfig,
    pub roles: BTreeMap<String, Vec<Role>>,
}

impl MarketConfig {
    pub fn from_toml(content: &str) -> Result<Self, MarketError> {
        let config: MarketConfig =
            toml::from_str(content).map_err(|e| MarketError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`; a missing file is not an error.
    pub fn load(path: &Path) -> Result<Self, MarketError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(MarketConfig::default());
        }
        let content = fs::read_to_string(path).map_err(MarketError::IoError)?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), backend = ?config.storage.backend, "loaded config");
        Ok(config)
    }

    /// `$AGENT_MARKET_CONFIG`, else `<root>/market.toml`.
    pub fn resolve_path(root: &Path) -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.treasury.required_approvals == 0 {
            return Err(MarketError::ConfigError(
                "treasury.required_approvals must be at least 1".into(),
            ));
        }
        if self.treasury.max_single_transfer == 0 {
            return Err(MarketError::ConfigError(
                "treasury.max_single_transfer must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> AuthorizationPolicy {
        self.roles
            .iter()
            .fold(AuthorizationPolicy::new(), |policy, (actor, roles)| {
                policy.grant_all(actor, roles.iter().copied())
            })
    }

    pub fn database_path(&self, root: &Path) -> PathBuf {
        match &self.storage.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => db::market_db_path(&root.join(DATA_DIR)),
        }
    }

    pub fn open_store(&self, root: &Path) -> Result<Arc<dyn MarketStore>, MarketError> {
        match self.storage.backend {
            Backend::Memory => Ok(Arc::new(InMemoryStore::new(self.storage.id_strategy))),
            Backend::Sqlite => Ok(Arc::new(SqliteStore::open(self.database_path(root))?)),
        }
    }
}
