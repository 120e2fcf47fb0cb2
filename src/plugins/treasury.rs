//! Counted-approval treasury transfers: `pending -> approved -> executed`.
//!
//! Approvals are compare-and-swapped on `(status, approval count)`, and the
//! balance check plus debit of an execution happen inside one store call, so
//! a treasury can never be overdrawn.

use crate::core::config::TreasuryConfig;
use crate::core::error::MarketError;
use crate::core::events::{EventPayload, EventRecord};
use crate::core::model::{IdKind, ProposalStatus, TreasuryProposal, TreasuryState};
use crate::core::store::MarketStore;
use crate::core::time;
use crate::plugins::policy::{AuthorizationPolicy, Role};
use std::sync::Arc;

pub struct TreasuryGovernance {
    store: Arc<dyn MarketStore>,
    policy: AuthorizationPolicy,
    config: TreasuryConfig,
}

impl TreasuryGovernance {
    pub fn new(
        store: Arc<dyn MarketStore>,
        policy: AuthorizationPolicy,
        config: TreasuryConfig,
    ) -> Self {
        TreasuryGovernance {
            store,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &TreasuryConfig {
        &self.config
    }

    fn event(&self, actor_id: &str, payload: EventPayload, ts: &str, foundup_id: &str) -> EventRecord {
        EventRecord::new(self.store.next_id(IdKind::Event), actor_id, payload, ts)
            .for_foundup(foundup_id)
    }

    pub fn deposit(
        &self,
        foundup_id: &str,
        amount: u64,
        source: &str,
    ) -> Result<TreasuryState, MarketError> {
        if amount == 0 {
            return Err(MarketError::ValidationError("deposit amount must be positive".into()));
        }
        let source = source.trim();
        if source.is_empty() {
            return Err(MarketError::ValidationError("deposit source must not be empty".into()));
        }
        let ts = time::now_epoch_z();
        // balance is stamped by the store under its write lock
        let event = self.event(
            source,
            EventPayload::TreasuryDeposit {
                amount,
                source: source.to_string(),
                balance: 0,
            },
            &ts,
            foundup_id,
        );
        let state = self.store.deposit(foundup_id, amount, &event)?;
        tracing::info!(foundup_id, amount, balance = state.balance, "treasury deposit");
        Ok(state)
    }

    pub fn propose_transfer(
        &self,
        foundup_id: &str,
        amount: u64,
        reason: &str,
        proposer_id: &str,
    ) -> Result<TreasuryProposal, MarketError> {
        if amount == 0 {
            return Err(MarketError::ValidationError("transfer amount must be positive".into()));
        }
        if amount > self.config.max_single_transfer {
            return Err(MarketError::ValidationError(format!(
                "transfer amount {} exceeds the single-transfer limit of {}",
                amount, self.config.max_single_transfer
            )));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MarketError::ValidationError("transfer reason must not be empty".into()));
        }
        if proposer_id.trim().is_empty() {
            return Err(MarketError::ValidationError("proposer id must not be empty".into()));
        }

        let ts = time::now_epoch_z();
        let proposal = TreasuryProposal {
            id: self.store.next_id(IdKind::Proposal),
            foundup_id: foundup_id.to_string(),
            proposer_id: proposer_id.to_string(),
            amount,
            reason: reason.to_string(),
            status: ProposalStatus::Pending,
            approvals: Vec::new(),
            required_approvals: self.config.required_approvals,
            execution_ref: None,
            created_at: ts.clone(),
            executed_at: None,
        };
        let event = self.event(
            proposer_id,
            EventPayload::ProposalCreated {
                amount,
                reason: proposal.reason.clone(),
                required_approvals: proposal.required_approvals,
            },
            &ts,
            foundup_id,
        );
        let created = self.store.create_proposal(&proposal, &event)?;
        tracing::info!(proposal_id = %created.id, foundup_id, amount, "transfer proposed");
        Ok(created)
    }

    pub fn approve_transfer(
        &self,
        proposal_id: &str,
        approver_id: &str,
    ) -> Result<TreasuryProposal, MarketError> {
        self.policy.require(approver_id, Role::Treasury)?;
        let current = self.store.get_proposal(proposal_id)?;
        if current.status != ProposalStatus::Pending {
            return Err(MarketError::InvalidStateTransition(format!(
                "proposal {} is {}, expected {}",
                current.id,
                current.status,
                ProposalStatus::Pending
            )));
        }
        if current.approvals.iter().any(|a| a == approver_id) {
            return Err(MarketError::ValidationError(format!(
                "{} already approved proposal {}",
                approver_id, proposal_id
            )));
        }
        if current.required_approvals > 1 && current.proposer_id == approver_id {
            return Err(MarketError::PermissionDenied(format!(
                "proposer {} cannot approve their own multi-approval transfer",
                approver_id
            )));
        }

        let expected_approvals = current.approvals.len();
        let mut next = current.clone();
        next.approvals.push(approver_id.to_string());
        let count = u32::try_from(next.approvals.len()).unwrap_or(u32::MAX);
        if count >= next.required_approvals {
            next.status = ProposalStatus::Approved;
        }

        let ts = time::now_epoch_z();
        let event = self.event(
            approver_id,
            EventPayload::ProposalApproved {
                approver_id: approver_id.to_string(),
                approval_count: count,
                required_approvals: next.required_approvals,
                status: next.status.to_string(),
            },
            &ts,
            &next.foundup_id,
        );
        let updated =
            self.store
                .update_proposal(&next, ProposalStatus::Pending, expected_approvals, &event)?;
        tracing::info!(
            proposal_id,
            approver_id,
            approvals = count,
            required = updated.required_approvals,
            status = %updated.status,
            "transfer approved"
        );
        Ok(updated)
    }

    pub fn execute_transfer(
        &self,
        proposal_id: &str,
        executor_id: &str,
    ) -> Result<(TreasuryProposal, TreasuryState), MarketError> {
        self.policy.require(executor_id, Role::Treasury)?;
        let current = self.store.get_proposal(proposal_id)?;
        let ts = time::now_epoch_z();
        let execution_ref = time::prefixed_ulid("exec");
        let event = self.event(
            executor_id,
            EventPayload::TransferExecuted {
                amount: current.amount,
                execution_ref: execution_ref.clone(),
                balance: 0,
            },
            &ts,
            &current.foundup_id,
        );
        let (executed, state) = self
            .store
            .execute_proposal(proposal_id, &execution_ref, &ts, &event)
            .inspect_err(|e| {
                tracing::warn!(proposal_id, error = %e, "transfer not executed");
            })?;
        tracing::info!(
            proposal_id,
            execution_ref = %execution_ref,
            amount = executed.amount,
            balance = state.balance,
            "transfer executed"
        );
        Ok((executed, state))
    }

    pub fn get_state(&self, foundup_id: &str) -> Result<TreasuryState, MarketError> {
        self.store.treasury_state(foundup_id)
    }

    pub fn get_proposal(&self, proposal_id: &str) -> Result<TreasuryProposal, MarketError> {
        self.store.get_proposal(proposal_id)
    }

    pub fn list_proposals(&self, foundup_id: &str) -> Result<Vec<TreasuryProposal>, MarketError> {
        self.store.list_proposals(foundup_id)
    }
}
