//! Ports to the outside world plus the in-process doubles used by the CLI
//! and tests. None of these talk to a network.

use crate::core::error::MarketError;
use crate::core::model::Foundup;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, MarketError> {
    m.lock()
        .map_err(|_| MarketError::StorageError(format!("{} lock poisoned", what)))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenTerms {
    pub total_supply: u64,
    pub treasury_share_bps: u32,
    pub vesting_months: u32,
    pub cliff_months: u32,
}

impl Default for TokenTerms {
    fn default() -> Self {
        TokenTerms {
            total_supply: 1_000_000,
            treasury_share_bps: 2_000,
            vesting_months: 24,
            cliff_months: 6,
        }
    }
}

impl TokenTerms {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.total_supply == 0 {
            return Err(MarketError::ValidationError("total supply must be positive".into()));
        }
        if self.treasury_share_bps > 10_000 {
            return Err(MarketError::ValidationError(format!(
                "treasury share {} bps exceeds 10000",
                self.treasury_share_bps
            )));
        }
        if self.cliff_months > self.vesting_months {
            return Err(MarketError::ValidationError(
                "cliff cannot exceed the vesting period".into(),
            ));
        }
        Ok(())
    }
}

pub trait TokenFactoryAdapter: Send + Sync {
    /// Deploys the foundup's token and returns its address. Callable once per foundup.
    fn deploy_token(&self, foundup: &Foundup, terms: &TokenTerms) -> Result<String, MarketError>;
    fn configure_vesting(&self, address: &str, terms: &TokenTerms) -> Result<(), MarketError>;
    fn get_treasury_account(&self, foundup_id: &str) -> Result<String, MarketError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RepoMetadata {
    pub foundup_id: String,
    pub repo_name: String,
    pub provider: String,
    pub default_branch: String,
    pub url: String,
}

pub trait RepoProvisioningAdapter: Send + Sync {
    fn provision_repo(
        &self,
        foundup_id: &str,
        repo_name: &str,
        provider: &str,
        default_branch: &str,
    ) -> Result<String, MarketError>;
    fn get_repo_metadata(&self, foundup_id: &str) -> Result<Option<RepoMetadata>, MarketError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelReceipt {
    pub post_id: String,
    pub channel: String,
    pub timestamp: String,
    pub status: String,
}

pub trait DistributionChannelAdapter: Send + Sync {
    /// `milestone` carries at least `channel`, `task_id` and `title`.
    fn publish_milestone(
        &self,
        foundup_id: &str,
        task_id: &str,
        milestone: &JsonValue,
        actor_id: &str,
    ) -> Result<ChannelReceipt, MarketError>;
}

// --- token factory ---

/// Deterministic chain-free token factory.
#[derive(Debug, Default)]
pub struct MockTokenFactory {
    deployed: Mutex<HashMap<String, String>>,
    vesting: Mutex<HashMap<String, TokenTerms>>,
}

impl MockTokenFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0x` + first 40 hex chars of sha256(`<salt>:<foundup_id>`).
    fn derive_address(salt: &str, foundup_id: &str) -> String {
        let digest = Sha256::digest(format!("{}:{}", salt, foundup_id).as_bytes());
        let hex = format!("{:x}", digest);
        format!("0x{}", &hex[..40])
    }

    pub fn deployed_address(&self, foundup_id: &str) -> Result<Option<String>, MarketError> {
        Ok(lock(&self.deployed, "token factory")?.get(foundup_id).cloned())
    }

    pub fn vesting_for(&self, address: &str) -> Result<Option<TokenTerms>, MarketError> {
        Ok(lock(&self.vesting, "token factory")?.get(address).cloned())
    }
}

impl TokenFactoryAdapter for MockTokenFactory {
    fn deploy_token(&self, foundup: &Foundup, terms: &TokenTerms) -> Result<String, MarketError> {
        terms.validate()?;
        let mut deployed = lock(&self.deployed, "token factory")?;
        if deployed.contains_key(&foundup.id) {
            return Err(MarketError::ValidationError(format!(
                "token for foundup {} is already deployed",
                foundup.id
            )));
        }
        let address = Self::derive_address("token", &foundup.id);
        deployed.insert(foundup.id.clone(), address.clone());
        tracing::debug!(foundup_id = %foundup.id, %address, symbol = %foundup.token_symbol, "mock token deployed");
        Ok(address)
    }

    fn configure_vesting(&self, address: &str, terms: &TokenTerms) -> Result<(), MarketError> {
        terms.validate()?;
        let known = lock(&self.deployed, "token factory")?
            .values()
            .any(|a| a == address);
        if !known {
            return Err(MarketError::NotFound(format!("token {} not found", address)));
        }
        lock(&self.vesting, "token factory")?.insert(address.to_string(), terms.clone());
        Ok(())
    }

    fn get_treasury_account(&self, foundup_id: &str) -> Result<String, MarketError> {
        if !lock(&self.deployed, "token factory")?.contains_key(foundup_id) {
            return Err(MarketError::NotFound(format!(
                "no token deployed for foundup {}",
                foundup_id
            )));
        }
        Ok(Self::derive_address("treasury", foundup_id))
    }
}

// --- repository provisioning ---

#[derive(Debug, Default)]
pub struct MockRepoProvisioner {
    repos: Mutex<HashMap<String, RepoMetadata>>,
}

impl MockRepoProvisioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RepoProvisioningAdapter for MockRepoProvisioner {
    /// Returns the existing URL when the foundup already has a repository.
    fn provision_repo(
        &self,
        foundup_id: &str,
        repo_name: &str,
        provider: &str,
        default_branch: &str,
    ) -> Result<String, MarketError> {
        if repo_name.trim().is_empty() {
            return Err(MarketError::ValidationError("repo name must not be empty".into()));
        }
        let mut repos = lock(&self.repos, "repo provisioner")?;
        if let Some(existing) = repos.get(foundup_id) {
            return Ok(existing.url.clone());
        }
        let meta = RepoMetadata {
            foundup_id: foundup_id.to_string(),
            repo_name: repo_name.to_string(),
            provider: provider.to_string(),
            default_branch: default_branch.to_string(),
            url: format!("https://{}.example/{}", provider, repo_name),
        };
        let url = meta.url.clone();
        repos.insert(foundup_id.to_string(), meta);
        Ok(url)
    }

    fn get_repo_metadata(&self, foundup_id: &str) -> Result<Option<RepoMetadata>, MarketError> {
        Ok(lock(&self.repos, "repo provisioner")?.get(foundup_id).cloned())
    }
}

// --- distribution channel ---

/// Channel double that remembers every receipt and counts calls.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    receipts: Mutex<HashMap<(String, String), ChannelReceipt>>,
    calls: AtomicUsize,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DistributionChannelAdapter for RecordingChannel {
    fn publish_milestone(
        &self,
        foundup_id: &str,
        task_id: &str,
        milestone: &JsonValue,
        actor_id: &str,
    ) -> Result<ChannelReceipt, MarketError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let channel = milestone
            .get("channel")
            .and_then(JsonValue::as_str)
            .unwrap_or("default")
            .to_string();
        let mut receipts = lock(&self.receipts, "recording channel")?;
        let key = (task_id.to_string(), channel.clone());
        if let Some(existing) = receipts.get(&key) {
            return Ok(existing.clone());
        }
        let receipt = ChannelReceipt {
            post_id: format!("post_{}", time::new_ulid()),
            channel,
            timestamp: time::now_epoch_z(),
            status: "published".to_string(),
        };
        tracing::debug!(foundup_id, task_id, actor_id, post_id = %receipt.post_id, "milestone recorded");
        receipts.insert(key, receipt.clone());
        Ok(receipt)
    }
}
