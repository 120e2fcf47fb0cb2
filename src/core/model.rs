//! Domain records for the marketplace.
//!
//! Every record is a plain value: construction helpers validate shape, the
//! persistence layer owns the instances. Records built with an empty `id`
//! are drafts; the component that persists them assigns the id.

use crate::core::error::MarketError;
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub type Metadata = serde_json::Map<String, JsonValue>;

fn token_symbol_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9]{2,12}$").expect("static token symbol regex"))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), MarketError> {
    if value.trim().is_empty() {
        return Err(MarketError::ValidationError(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

/// Id namespaces. The prefix is stable and shows up in every generated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Foundup,
    Task,
    Proof,
    Verification,
    Payout,
    Distribution,
    Event,
    Proposal,
    CabrScore,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Foundup => "fup",
            IdKind::Task => "task",
            IdKind::Proof => "proof",
            IdKind::Verification => "verif",
            IdKind::Payout => "payout",
            IdKind::Distribution => "dist",
            IdKind::Event => "evt",
            IdKind::Proposal => "prop",
            IdKind::CabrScore => "cabr",
        }
    }
}

// --- Foundup ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Foundup {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub token_symbol: String,
    #[serde(default)]
    pub immutable_metadata: Metadata,
    #[serde(default)]
    pub mutable_metadata: Metadata,
    pub created_at: String,
    pub updated_at: String,
}

/// Upper-cases and checks a token symbol. Uniqueness is the store's job.
pub fn normalize_token_symbol(symbol: &str) -> Result<String, MarketError> {
    let normalized = symbol.trim().to_ascii_uppercase();
    if !token_symbol_re().is_match(&normalized) {
        return Err(MarketError::ValidationError(format!(
            "token symbol '{}' must be 2-12 ASCII letters or digits",
            symbol
        )));
    }
    Ok(normalized)
}

impl Foundup {
    pub fn draft(name: &str, owner_id: &str, token_symbol: &str) -> Result<Self, MarketError> {
        let ts = time::now_epoch_z();
        let foundup = Foundup {
            id: String::new(),
            name: name.trim().to_string(),
            owner_id: owner_id.trim().to_string(),
            token_symbol: normalize_token_symbol(token_symbol)?,
            immutable_metadata: Metadata::new(),
            mutable_metadata: Metadata::new(),
            created_at: ts.clone(),
            updated_at: ts,
        };
        foundup.validate()?;
        Ok(foundup)
    }

    pub fn with_immutable(mut self, key: &str, value: JsonValue) -> Self {
        self.immutable_metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_mutable(mut self, key: &str, value: JsonValue) -> Self {
        self.mutable_metadata.insert(key.to_string(), value);
        self
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        require_non_empty("foundup name", &self.name)?;
        require_non_empty("foundup owner", &self.owner_id)?;
        if normalize_token_symbol(&self.token_symbol)? != self.token_symbol {
            return Err(MarketError::ValidationError(format!(
                "token symbol '{}' is not normalized",
                self.token_symbol
            )));
        }
        if let Some(key) = self
            .mutable_metadata
            .keys()
            .find(|k| self.immutable_metadata.contains_key(*k))
        {
            return Err(MarketError::ValidationError(format!(
                "metadata key '{}' cannot be both immutable and mutable",
                key
            )));
        }
        Ok(())
    }

    /// Merges a patch, refusing to touch any write-once key.
    pub fn apply_patch(&self, patch: &MetadataPatch, ts: &str) -> Result<Foundup, MarketError> {
        if let Some(key) = patch
            .immutable
            .keys()
            .find(|k| patch.mutable.contains_key(*k))
        {
            return Err(MarketError::ValidationError(format!(
                "metadata key '{}' cannot be both immutable and mutable",
                key
            )));
        }
        for key in patch.immutable.keys().chain(patch.mutable.keys()) {
            if self.immutable_metadata.contains_key(key) {
                return Err(MarketError::ImmutableField(format!(
                    "foundup {} metadata key '{}' is write-once",
                    self.id, key
                )));
            }
        }
        if let Some(key) = patch
            .immutable
            .keys()
            .find(|k| self.mutable_metadata.contains_key(*k))
        {
            return Err(MarketError::ValidationError(format!(
                "metadata key '{}' is already mutable",
                key
            )));
        }

        let mut next = self.clone();
        for (k, v) in &patch.immutable {
            next.immutable_metadata.insert(k.clone(), v.clone());
        }
        for (k, v) in &patch.mutable {
            next.mutable_metadata.insert(k.clone(), v.clone());
        }
        next.updated_at = ts.to_string();
        Ok(next)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MetadataPatch {
    #[serde(default)]
    pub immutable: Metadata,
    #[serde(default)]
    pub mutable: Metadata,
}

impl MetadataPatch {
    pub fn mutable(key: &str, value: JsonValue) -> Self {
        let mut patch = MetadataPatch::default();
        patch.mutable.insert(key.to_string(), value);
        patch
    }

    pub fn is_empty(&self) -> bool {
        self.immutable.is_empty() && self.mutable.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.immutable
            .keys()
            .chain(self.mutable.keys())
            .cloned()
            .collect()
    }
}

// --- Task ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Claimed,
    Submitted,
    Verified,
    Paid,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Open,
        TaskStatus::Claimed,
        TaskStatus::Submitted,
        TaskStatus::Verified,
        TaskStatus::Paid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Verified => "verified",
            TaskStatus::Paid => "paid",
        }
    }

    /// The only legal successor; `None` once paid.
    pub fn next(&self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Open => Some(TaskStatus::Claimed),
            TaskStatus::Claimed => Some(TaskStatus::Submitted),
            TaskStatus::Submitted => Some(TaskStatus::Verified),
            TaskStatus::Verified => Some(TaskStatus::Paid),
            TaskStatus::Paid => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Open => 0,
            TaskStatus::Claimed => 1,
            TaskStatus::Submitted => 2,
            TaskStatus::Verified => 3,
            TaskStatus::Paid => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| MarketError::ValidationError(format!("unknown task status '{}'", s)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub foundup_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    pub reward_amount: u64,
    pub creator_id: String,
    pub status: TaskStatus,
    pub assignee_id: Option<String>,
    pub proof_id: Option<String>,
    pub verification_id: Option<String>,
    pub payout_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn draft(
        foundup_id: &str,
        title: &str,
        reward_amount: u64,
        creator_id: &str,
    ) -> Result<Self, MarketError> {
        let ts = time::now_epoch_z();
        let task = Task {
            id: String::new(),
            foundup_id: foundup_id.to_string(),
            title: title.trim().to_string(),
            description: String::new(),
            acceptance_criteria: String::new(),
            reward_amount,
            creator_id: creator_id.to_string(),
            status: TaskStatus::Open,
            assignee_id: None,
            proof_id: None,
            verification_id: None,
            payout_id: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        task.validate()?;
        Ok(task)
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: &str) -> Self {
        self.acceptance_criteria = criteria.to_string();
        self
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        require_non_empty("task title", &self.title)?;
        require_non_empty("task foundup", &self.foundup_id)?;
        require_non_empty("task creator", &self.creator_id)?;
        if self.reward_amount == 0 {
            return Err(MarketError::ValidationError(
                "reward amount must be positive".into(),
            ));
        }
        Ok(())
    }
}

// --- Proof / Verification / Payout ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Proof {
    pub id: String,
    pub task_id: String,
    pub submitter_id: String,
    pub artifact_uri: String,
    pub artifact_hash: String,
    pub notes: Option<String>,
    pub created_at: String,
}

impl Proof {
    pub fn draft(
        task_id: &str,
        submitter_id: &str,
        artifact_uri: &str,
        artifact_hash: &str,
    ) -> Result<Self, MarketError> {
        let proof = Proof {
            id: String::new(),
            task_id: task_id.to_string(),
            submitter_id: submitter_id.to_string(),
            artifact_uri: artifact_uri.trim().to_string(),
            artifact_hash: artifact_hash.trim().to_string(),
            notes: None,
            created_at: time::now_epoch_z(),
        };
        proof.validate()?;
        Ok(proof)
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }

    /// `sha256:<hex>` digest of an artifact body.
    pub fn hash_artifact(bytes: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("sha256:{:x}", hasher.finalize())
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        require_non_empty("proof task", &self.task_id)?;
        require_non_empty("proof submitter", &self.submitter_id)?;
        require_non_empty("artifact uri", &self.artifact_uri)?;
        require_non_empty("artifact hash", &self.artifact_hash)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Verification {
    pub id: String,
    pub task_id: String,
    pub verifier_id: String,
    pub approved: bool,
    pub reason: String,
    pub created_at: String,
}

impl Verification {
    pub fn draft(task_id: &str, verifier_id: &str, approved: bool, reason: &str) -> Self {
        Verification {
            id: String::new(),
            task_id: task_id.to_string(),
            verifier_id: verifier_id.to_string(),
            approved,
            reason: reason.to_string(),
            created_at: time::now_epoch_z(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }
}

impl FromStr for PayoutStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "completed" => Ok(PayoutStatus::Completed),
            "failed" => Ok(PayoutStatus::Failed),
            other => Err(MarketError::ValidationError(format!(
                "unknown payout status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Payout {
    pub id: String,
    pub task_id: String,
    pub recipient_id: String,
    pub amount: u64,
    pub status: PayoutStatus,
    pub reference: String,
    pub created_at: String,
}

// --- Distribution ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DistributionPost {
    pub id: String,
    pub foundup_id: String,
    pub task_id: String,
    pub channel: String,
    pub content: String,
    pub actor_id: String,
    pub dedupe_key: String,
    pub external_post_id: Option<String>,
    pub created_at: String,
}

impl DistributionPost {
    pub fn dedupe_key_for(task_id: &str, channel: &str) -> String {
        format!("{}:{}:verified", task_id, channel)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CabrScore {
    pub id: String,
    pub foundup_id: String,
    pub score: f64,
    #[serde(default)]
    pub payload: JsonValue,
    pub recorded_at: String,
}

// --- Treasury ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            "executed" => Ok(ProposalStatus::Executed),
            "expired" => Ok(ProposalStatus::Expired),
            other => Err(MarketError::ValidationError(format!(
                "unknown proposal status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TreasuryProposal {
    pub id: String,
    pub foundup_id: String,
    pub proposer_id: String,
    pub amount: u64,
    pub reason: String,
    pub status: ProposalStatus,
    #[serde(default)]
    pub approvals: Vec<String>,
    pub required_approvals: u32,
    pub execution_ref: Option<String>,
    pub created_at: String,
    pub executed_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TreasuryState {
    pub foundup_id: String,
    pub balance: u64,
    pub pending_outflows: u64,
    pub total_inflows: u64,
    pub total_outflows: u64,
    pub updated_at: String,
}

impl TreasuryState {
    pub fn empty(foundup_id: &str) -> Self {
        TreasuryState {
            foundup_id: foundup_id.to_string(),
            balance: 0,
            pending_outflows: 0,
            total_inflows: 0,
            total_outflows: 0,
            updated_at: String::new(),
        }
    }

    pub fn credited(&self, amount: u64, ts: &str) -> Result<TreasuryState, MarketError> {
        let overflow = || MarketError::ValidationError("treasury balance overflow".into());
        Ok(TreasuryState {
            balance: self.balance.checked_add(amount).ok_or_else(overflow)?,
            total_inflows: self.total_inflows.checked_add(amount).ok_or_else(overflow)?,
            updated_at: ts.to_string(),
            ..self.clone()
        })
    }

    pub fn reserved(&self, amount: u64, ts: &str) -> Result<TreasuryState, MarketError> {
        Ok(TreasuryState {
            pending_outflows: self.pending_outflows.checked_add(amount).ok_or_else(|| {
                MarketError::ValidationError("pending outflow overflow".into())
            })?,
            updated_at: ts.to_string(),
            ..self.clone()
        })
    }

    /// Debits an executed transfer; never goes negative.
    pub fn debited(&self, amount: u64, ts: &str) -> Result<TreasuryState, MarketError> {
        if self.balance < amount {
            return Err(MarketError::ValidationError(format!(
                "insufficient balance: {} available, {} requested",
                self.balance, amount
            )));
        }
        Ok(TreasuryState {
            balance: self.balance - amount,
            pending_outflows: self.pending_outflows.saturating_sub(amount),
            total_outflows: self.total_outflows.saturating_add(amount),
            updated_at: ts.to_string(),
            ..self.clone()
        })
    }
}
