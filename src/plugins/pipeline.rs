//! Task lifecycle: `open -> claimed -> submitted -> verified -> paid`.
//!
//! Every step is a compare-and-swap on `(task_id, expected_status)` executed
//! by the store together with its sub-record and its event. Two agents racing
//! to claim the same task get exactly one winner; the loser sees
//! `InvalidStateTransition`.

use crate::core::error::MarketError;
use crate::core::events::{EventFilter, EventPayload, EventRecord};
use crate::core::model::{
    DistributionPost, IdKind, Payout, PayoutStatus, Proof, Task, TaskStatus, Verification,
};
use crate::core::store::{MarketStore, TaskFilter, TaskTransition, TransitionLink};
use crate::core::time;
use crate::plugins::policy::{AuthorizationPolicy, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything linked to one task, plus its audit trail in append order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskTrace {
    pub task: Task,
    pub proof: Option<Proof>,
    pub verification: Option<Verification>,
    pub payout: Option<Payout>,
    pub distributions: Vec<DistributionPost>,
    pub events: Vec<EventRecord>,
}

#[derive(Clone)]
pub struct TaskPipeline {
    store: Arc<dyn MarketStore>,
    policy: AuthorizationPolicy,
}

fn require_status(task: &Task, expected: TaskStatus) -> Result<(), MarketError> {
    if task.status != expected {
        return Err(MarketError::InvalidStateTransition(format!(
            "task {} is {}, expected {}",
            task.id, task.status, expected
        )));
    }
    Ok(())
}

impl TaskPipeline {
    pub fn new(store: Arc<dyn MarketStore>, policy: AuthorizationPolicy) -> Self {
        TaskPipeline { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    fn event(&self, actor_id: &str, payload: EventPayload, ts: &str, task: &Task) -> EventRecord {
        EventRecord::new(self.store.next_id(IdKind::Event), actor_id, payload, ts)
            .for_foundup(&task.foundup_id)
            .for_task(&task.id)
    }

    /// Persists a new `Open` task under an existing foundup.
    pub fn create_task(&self, mut task: Task) -> Result<Task, MarketError> {
        if task.status != TaskStatus::Open {
            return Err(MarketError::ValidationError(format!(
                "new tasks must be open, got {}",
                task.status
            )));
        }
        task.validate()?;
        if task.id.is_empty() {
            task.id = self.store.next_id(IdKind::Task);
        }
        let ts = time::now_epoch_z();
        task.created_at = ts.clone();
        task.updated_at = ts.clone();

        let event = self.event(
            &task.creator_id,
            EventPayload::TaskCreated {
                title: task.title.clone(),
                reward_amount: task.reward_amount,
            },
            &ts,
            &task,
        );
        let created = self.store.create_task(&task, &event)?;
        tracing::info!(task_id = %created.id, foundup_id = %created.foundup_id, reward = created.reward_amount, "task created");
        Ok(created)
    }

    pub fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<Task, MarketError> {
        if agent_id.trim().is_empty() {
            return Err(MarketError::ValidationError("agent id must not be empty".into()));
        }
        let task = self.store.get_task(task_id)?;
        require_status(&task, TaskStatus::Open)?;

        let ts = time::now_epoch_z();
        let transition = TaskTransition::new(task_id, TaskStatus::Open, TaskStatus::Claimed, &ts)
            .assign(agent_id);
        let event = self.event(
            agent_id,
            EventPayload::TaskClaimed {
                assignee_id: agent_id.to_string(),
            },
            &ts,
            &task,
        );
        let claimed = self.store.apply_transition(&transition, &event)?;
        tracing::info!(task_id, agent_id, "task claimed");
        Ok(claimed)
    }

    /// Records the assignee's proof and moves the task to `Submitted`.
    pub fn submit_proof(&self, mut proof: Proof) -> Result<Task, MarketError> {
        proof.validate()?;
        let task = self.store.get_task(&proof.task_id)?;
        if proof.id.is_empty() {
            proof.id = self.store.next_id(IdKind::Proof);
        }
        let ts = time::now_epoch_z();
        proof.created_at = ts.clone();

        let event = self
            .event(
                &proof.submitter_id,
                EventPayload::ProofSubmitted {
                    artifact_uri: proof.artifact_uri.clone(),
                    artifact_hash: proof.artifact_hash.clone(),
                },
                &ts,
                &task,
            )
            .with_proof(&proof.id);
        let transition =
            TaskTransition::new(&task.id, TaskStatus::Claimed, TaskStatus::Submitted, &ts)
                .require_assignee(&proof.submitter_id)
                .link(TransitionLink::Proof(proof.clone()));
        let submitted = self.store.apply_transition(&transition, &event)?;
        tracing::info!(task_id = %submitted.id, proof_id = %proof.id, "proof submitted");
        Ok(submitted)
    }

    /// Approval moves the task to `Verified`; a rejection is recorded and
    /// audited while the task stays `Submitted`.
    pub fn verify_proof(
        &self,
        task_id: &str,
        mut verification: Verification,
    ) -> Result<Task, MarketError> {
        self.policy.require(&verification.verifier_id, Role::Verifier)?;
        if !verification.task_id.is_empty() && verification.task_id != task_id {
            return Err(MarketError::ValidationError(format!(
                "verification targets task {}, not {}",
                verification.task_id, task_id
            )));
        }
        let task = self.store.get_task(task_id)?;
        require_status(&task, TaskStatus::Submitted)?;

        verification.task_id = task_id.to_string();
        if verification.id.is_empty() {
            verification.id = self.store.next_id(IdKind::Verification);
        }
        let ts = time::now_epoch_z();
        verification.created_at = ts.clone();

        let payload = if verification.approved {
            EventPayload::ProofVerified {
                verifier_id: verification.verifier_id.clone(),
                reason: verification.reason.clone(),
            }
        } else {
            EventPayload::ProofRejected {
                verifier_id: verification.verifier_id.clone(),
                reason: verification.reason.clone(),
            }
        };
        let mut event = self.event(&verification.verifier_id, payload, &ts, &task);
        if let Some(proof_id) = &task.proof_id {
            event = event.with_proof(proof_id);
        }

        if !verification.approved {
            self.store.record_rejection(&verification, &event)?;
            tracing::info!(task_id, verifier = %verification.verifier_id, "proof rejected");
            return self.store.get_task(task_id);
        }

        let transition =
            TaskTransition::new(task_id, TaskStatus::Submitted, TaskStatus::Verified, &ts)
                .link(TransitionLink::Verification(verification.clone()));
        let verified = self.store.apply_transition(&transition, &event)?;
        tracing::info!(task_id, verifier = %verification.verifier_id, "proof verified");
        Ok(verified)
    }

    /// Pays the assignee the task reward. A task is paid at most once.
    pub fn trigger_payout(&self, task_id: &str, actor_id: &str) -> Result<Task, MarketError> {
        self.policy.require(actor_id, Role::Treasury)?;
        let task = self.store.get_task(task_id)?;
        require_status(&task, TaskStatus::Verified)?;
        let recipient_id = task.assignee_id.clone().ok_or_else(|| {
            MarketError::StorageError(format!("verified task {} has no assignee", task_id))
        })?;

        let ts = time::now_epoch_z();
        let payout_id = self.store.next_id(IdKind::Payout);
        let payout = Payout {
            reference: format!("settle_{}", time::new_ulid()),
            id: payout_id,
            task_id: task_id.to_string(),
            recipient_id,
            amount: task.reward_amount,
            status: PayoutStatus::Completed,
            created_at: ts.clone(),
        };
        let event = self
            .event(
                actor_id,
                EventPayload::PayoutCompleted {
                    recipient_id: payout.recipient_id.clone(),
                    amount: payout.amount,
                    reference: payout.reference.clone(),
                },
                &ts,
                &task,
            )
            .with_payout(&payout.id);
        let transition = TaskTransition::new(task_id, TaskStatus::Verified, TaskStatus::Paid, &ts)
            .link(TransitionLink::Payout(payout.clone()));
        let paid = self.store.apply_transition(&transition, &event)?;
        tracing::info!(task_id, payout_id = %payout.id, amount = payout.amount, "payout completed");
        Ok(paid)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, MarketError> {
        self.store.get_task(task_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError> {
        self.store.list_tasks(filter)
    }

    pub fn get_trace(&self, task_id: &str) -> Result<TaskTrace, MarketError> {
        let task = self.store.get_task(task_id)?;
        let proof = task
            .proof_id
            .as_deref()
            .map(|id| self.store.get_proof(id))
            .transpose()?;
        let verification = task
            .verification_id
            .as_deref()
            .map(|id| self.store.get_verification(id))
            .transpose()?;
        let payout = task
            .payout_id
            .as_deref()
            .map(|id| self.store.get_payout(id))
            .transpose()?;
        let distributions = self.store.list_distributions(task_id)?;
        let events = self.store.list_events(&EventFilter::for_task(task_id))?;
        tracing::debug!(task_id, events = events.len(), "trace loaded");
        Ok(TaskTrace {
            task,
            proof,
            verification,
            payout,
            distributions,
            events,
        })
    }
}
