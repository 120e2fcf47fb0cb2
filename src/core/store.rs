//! Persistence contract shared by the in-memory and SQLite backends.
//!
//! Components above this layer hold an `Arc<dyn MarketStore>` and nothing
//! else, so swapping backends never changes behavior. Both implementations
//! must return the same `MarketError` variant for the same failure; the
//! conformance suite in `tests/core/conformance.rs` runs against each.
//!
//! Every mutating method takes the `EventRecord` describing it and applies
//! record change plus event append as one atomic unit. A rejected call
//! leaves no trace.

use crate::core::error::MarketError;
use crate::core::events::{EventFilter, EventRecord};
use crate::core::model::{
    CabrScore, DistributionPost, Foundup, IdKind, MetadataPatch, Payout, Proof, ProposalStatus,
    Task, TaskStatus, TreasuryProposal, TreasuryState, Verification,
};

/// Result of reserving a distribution slot.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionClaim {
    Claimed(DistributionPost),
    Existing(DistributionPost),
}

/// Sub-record created together with a task transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionLink {
    None,
    Proof(Proof),
    Verification(Verification),
    Payout(Payout),
}

/// Compare-and-swap request on a task's status column.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub task_id: String,
    pub expected: TaskStatus,
    pub next: TaskStatus,
    /// When set, the current assignee must match.
    pub expected_assignee: Option<String>,
    /// When set, replaces the assignee.
    pub assignee_id: Option<String>,
    pub link: TransitionLink,
    pub updated_at: String,
}

impl TaskTransition {
    pub fn new(task_id: &str, expected: TaskStatus, next: TaskStatus, updated_at: &str) -> Self {
        TaskTransition {
            task_id: task_id.to_string(),
            expected,
            next,
            expected_assignee: None,
            assignee_id: None,
            link: TransitionLink::None,
            updated_at: updated_at.to_string(),
        }
    }

    pub fn assign(mut self, assignee_id: &str) -> Self {
        self.assignee_id = Some(assignee_id.to_string());
        self
    }

    pub fn require_assignee(mut self, assignee_id: &str) -> Self {
        self.expected_assignee = Some(assignee_id.to_string());
        self
    }

    pub fn link(mut self, link: TransitionLink) -> Self {
        self.link = link;
        self
    }

    /// Produces the post-transition task or the error both backends report.
    pub fn apply_to(&self, task: &Task) -> Result<Task, MarketError> {
        if task.status != self.expected {
            return Err(MarketError::InvalidStateTransition(format!(
                "task {} is {}, expected {}",
                task.id, task.status, self.expected
            )));
        }
        if self.expected.next() != Some(self.next) {
            return Err(MarketError::InvalidStateTransition(format!(
                "task {} cannot move from {} to {}",
                task.id, self.expected, self.next
            )));
        }
        if let Some(expected_assignee) = &self.expected_assignee {
            if task.assignee_id.as_ref() != Some(expected_assignee) {
                return Err(MarketError::PermissionDenied(format!(
                    "{} is not the assignee of task {}",
                    expected_assignee, task.id
                )));
            }
        }

        let mut next = task.clone();
        next.status = self.next;
        next.updated_at = self.updated_at.clone();
        if let Some(assignee) = &self.assignee_id {
            next.assignee_id = Some(assignee.clone());
        }
        match &self.link {
            TransitionLink::None => {}
            TransitionLink::Proof(p) => next.proof_id = Some(p.id.clone()),
            TransitionLink::Verification(v) => next.verification_id = Some(v.id.clone()),
            TransitionLink::Payout(p) => next.payout_id = Some(p.id.clone()),
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub foundup_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub assignee_id: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.foundup_id
            .as_deref()
            .is_none_or(|f| task.foundup_id == f)
            && self.status.is_none_or(|s| task.status == s)
            && self
                .assignee_id
                .as_deref()
                .is_none_or(|a| task.assignee_id.as_deref() == Some(a))
    }
}

pub trait MarketStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn next_id(&self, kind: IdKind) -> String;

    // --- foundups ---
    fn create_foundup(&self, foundup: &Foundup, event: &EventRecord) -> Result<Foundup, MarketError>;
    fn get_foundup(&self, id: &str) -> Result<Foundup, MarketError>;
    fn list_foundups(&self) -> Result<Vec<Foundup>, MarketError>;
    fn update_foundup_metadata(
        &self,
        id: &str,
        patch: &MetadataPatch,
        event: &EventRecord,
    ) -> Result<Foundup, MarketError>;

    // --- tasks ---
    fn create_task(&self, task: &Task, event: &EventRecord) -> Result<Task, MarketError>;
    fn get_task(&self, id: &str) -> Result<Task, MarketError>;
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError>;
    fn apply_transition(
        &self,
        transition: &TaskTransition,
        event: &EventRecord,
    ) -> Result<Task, MarketError>;
    /// Persists a rejected verification; the task must be `Submitted` and stays there.
    fn record_rejection(
        &self,
        verification: &Verification,
        event: &EventRecord,
    ) -> Result<Verification, MarketError>;
    fn get_proof(&self, id: &str) -> Result<Proof, MarketError>;
    fn get_verification(&self, id: &str) -> Result<Verification, MarketError>;
    fn get_payout(&self, id: &str) -> Result<Payout, MarketError>;

    // --- distribution ---
    fn find_distribution(
        &self,
        task_id: &str,
        channel: &str,
    ) -> Result<Option<DistributionPost>, MarketError>;
    /// Reserves the `(task_id, channel)` slot for `post`. Only the caller that gets
    /// `Claimed` may publish externally; everyone else gets the stored post.
    fn claim_distribution(&self, post: &DistributionPost)
    -> Result<DistributionClaim, MarketError>;
    /// Stamps the external post id on a claimed post and appends `event`.
    fn complete_distribution(
        &self,
        post_id: &str,
        external_post_id: Option<&str>,
        event: &EventRecord,
    ) -> Result<DistributionPost, MarketError>;
    /// Drops a claim whose external publication failed so it can be retried.
    fn release_distribution(&self, post_id: &str) -> Result<(), MarketError>;
    fn list_distributions(&self, task_id: &str) -> Result<Vec<DistributionPost>, MarketError>;

    // --- cabr ---
    fn record_cabr_score(&self, score: &CabrScore, event: &EventRecord)
    -> Result<CabrScore, MarketError>;
    fn latest_cabr_score(&self, foundup_id: &str) -> Result<Option<CabrScore>, MarketError>;

    // --- treasury ---
    fn treasury_state(&self, foundup_id: &str) -> Result<TreasuryState, MarketError>;
    /// Credits the treasury. The appended event carries the balance written here.
    fn deposit(
        &self,
        foundup_id: &str,
        amount: u64,
        event: &EventRecord,
    ) -> Result<TreasuryState, MarketError>;
    /// Inserts a pending proposal and reserves its amount in `pending_outflows`.
    fn create_proposal(
        &self,
        proposal: &TreasuryProposal,
        event: &EventRecord,
    ) -> Result<TreasuryProposal, MarketError>;
    fn get_proposal(&self, id: &str) -> Result<TreasuryProposal, MarketError>;
    fn list_proposals(&self, foundup_id: &str) -> Result<Vec<TreasuryProposal>, MarketError>;
    /// Writes `proposal` only if the stored row still has `expected_status` and
    /// `expected_approvals` approvals.
    fn update_proposal(
        &self,
        proposal: &TreasuryProposal,
        expected_status: ProposalStatus,
        expected_approvals: usize,
        event: &EventRecord,
    ) -> Result<TreasuryProposal, MarketError>;
    /// Checks `Approved` and balance, then debits, all in one unit. The appended
    /// event carries the resulting balance.
    fn execute_proposal(
        &self,
        id: &str,
        execution_ref: &str,
        executed_at: &str,
        event: &EventRecord,
    ) -> Result<(TreasuryProposal, TreasuryState), MarketError>;

    // --- event log ---
    fn append_event(&self, event: &EventRecord) -> Result<(), MarketError>;
    fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, MarketError>;
}

pub(crate) fn not_found(kind: &str, id: &str) -> MarketError {
    MarketError::NotFound(format!("{} {} not found", kind, id))
}

pub(crate) fn duplicate_symbol(symbol: &str) -> MarketError {
    MarketError::ValidationError(format!("token symbol '{}' is already taken", symbol))
}

pub(crate) fn require_pending_rejection(
    task: &Task,
    verification: &Verification,
) -> Result<(), MarketError> {
    if task.status != TaskStatus::Submitted {
        return Err(MarketError::InvalidStateTransition(format!(
            "task {} is {}, expected {}",
            task.id,
            task.status,
            TaskStatus::Submitted
        )));
    }
    if verification.approved {
        return Err(MarketError::ValidationError(
            "approved verifications go through a transition".into(),
        ));
    }
    Ok(())
}

pub(crate) fn check_proposal_cas(
    current: &TreasuryProposal,
    expected_status: ProposalStatus,
    expected_approvals: usize,
) -> Result<(), MarketError> {
    if current.status != expected_status {
        return Err(MarketError::InvalidStateTransition(format!(
            "proposal {} is {}, expected {}",
            current.id, current.status, expected_status
        )));
    }
    if current.approvals.len() != expected_approvals {
        return Err(MarketError::InvalidStateTransition(format!(
            "proposal {} changed concurrently ({} approvals, expected {})",
            current.id,
            current.approvals.len(),
            expected_approvals
        )));
    }
    Ok(())
}

pub(crate) fn require_approved(proposal: &TreasuryProposal) -> Result<(), MarketError> {
    if proposal.status != ProposalStatus::Approved {
        return Err(MarketError::InvalidStateTransition(format!(
            "proposal {} is {}, expected {}",
            proposal.id,
            proposal.status,
            ProposalStatus::Approved
        )));
    }
    Ok(())
}
