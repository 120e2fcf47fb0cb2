//! Append-only audit events.
//!
//! Every mutating operation produces one `EventRecord`. Payloads are typed
//! per event; `EventPayload::Custom` carries freeform context for sagas and
//! external writers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    FoundupCreated {
        name: String,
        token_symbol: String,
        owner_id: String,
    },
    FoundupMetadataUpdated {
        keys: Vec<String>,
    },
    TaskCreated {
        title: String,
        reward_amount: u64,
    },
    TaskClaimed {
        assignee_id: String,
    },
    ProofSubmitted {
        artifact_uri: String,
        artifact_hash: String,
    },
    ProofVerified {
        verifier_id: String,
        reason: String,
    },
    ProofRejected {
        verifier_id: String,
        reason: String,
    },
    PayoutCompleted {
        recipient_id: String,
        amount: u64,
        reference: String,
    },
    MilestonePublished {
        channel: String,
        dedupe_key: String,
        cabr_threshold: f64,
        cabr_score: Option<f64>,
        external_post_id: Option<String>,
    },
    CabrRecorded {
        score: f64,
    },
    TreasuryDeposit {
        amount: u64,
        source: String,
        balance: u64,
    },
    ProposalCreated {
        amount: u64,
        reason: String,
        required_approvals: u32,
    },
    ProposalApproved {
        approver_id: String,
        approval_count: u32,
        required_approvals: u32,
        status: String,
    },
    TransferExecuted {
        amount: u64,
        execution_ref: String,
        balance: u64,
    },
    Custom {
        event_type: String,
        #[serde(default)]
        context: serde_json::Map<String, JsonValue>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::FoundupCreated { .. } => "foundup.created",
            EventPayload::FoundupMetadataUpdated { .. } => "foundup.metadata_updated",
            EventPayload::TaskCreated { .. } => "task.created",
            EventPayload::TaskClaimed { .. } => "task.claimed",
            EventPayload::ProofSubmitted { .. } => "proof.submitted",
            EventPayload::ProofVerified { .. } => "proof.verified",
            EventPayload::ProofRejected { .. } => "proof.rejected",
            EventPayload::PayoutCompleted { .. } => "payout.completed",
            EventPayload::MilestonePublished { .. } => "milestone.verified_published",
            EventPayload::CabrRecorded { .. } => "cabr.recorded",
            EventPayload::TreasuryDeposit { .. } => "treasury.deposit",
            EventPayload::ProposalCreated { .. } => "treasury.proposal.created",
            EventPayload::ProposalApproved { .. } => "treasury.proposal.approved",
            EventPayload::TransferExecuted { .. } => "treasury.transfer.executed",
            EventPayload::Custom { event_type, .. } => event_type,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub actor_id: String,
    pub payload: EventPayload,
    pub foundup_id: Option<String>,
    pub task_id: Option<String>,
    pub proof_id: Option<String>,
    pub payout_id: Option<String>,
    pub created_at: String,
}

impl EventRecord {
    pub fn new(id: String, actor_id: &str, payload: EventPayload, created_at: &str) -> Self {
        EventRecord {
            id,
            event_type: payload.event_type().to_string(),
            actor_id: actor_id.to_string(),
            payload,
            foundup_id: None,
            task_id: None,
            proof_id: None,
            payout_id: None,
            created_at: created_at.to_string(),
        }
    }

    pub fn for_foundup(mut self, foundup_id: &str) -> Self {
        self.foundup_id = Some(foundup_id.to_string());
        self
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_proof(mut self, proof_id: &str) -> Self {
        self.proof_id = Some(proof_id.to_string());
        self
    }

    pub fn with_payout(mut self, payout_id: &str) -> Self {
        self.payout_id = Some(payout_id.to_string());
        self
    }

    /// Copy of this event carrying the post-write treasury balance. Stores call
    /// this inside the write so the recorded balance matches the row it wrote.
    pub fn with_resulting_balance(&self, resulting: u64) -> Self {
        let mut event = self.clone();
        if let EventPayload::TreasuryDeposit { balance, .. }
        | EventPayload::TransferExecuted { balance, .. } = &mut event.payload
        {
            *balance = resulting;
        }
        event
    }
}

/// Conjunctive event query; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub foundup_id: Option<String>,
    pub task_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn for_task(task_id: &str) -> Self {
        EventFilter {
            task_id: Some(task_id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_foundup(foundup_id: &str) -> Self {
        EventFilter {
            foundup_id: Some(foundup_id.to_string()),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn matches(&self, ev: &EventRecord) -> bool {
        self.foundup_id
            .as_deref()
            .is_none_or(|f| ev.foundup_id.as_deref() == Some(f))
            && self
                .task_id
                .as_deref()
                .is_none_or(|t| ev.task_id.as_deref() == Some(t))
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| ev.event_type == t)
    }
}
