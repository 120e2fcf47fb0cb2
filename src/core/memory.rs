//! Map-backed `MarketStore` for deterministic tests and ephemeral runs.
//!
//! All state sits behind one mutex, so each trait call is a single writer
//! critical section: checks run first, mutation happens only after every
//! check passed.

use crate::core::error::MarketError;
use crate::core::events::{EventFilter, EventRecord};
use crate::core::model::{
    CabrScore, DistributionPost, Foundup, IdKind, MetadataPatch, Payout, Proof, ProposalStatus,
    Task, TreasuryProposal, TreasuryState, Verification,
};
use crate::core::store::{
    self, DistributionClaim, MarketStore, TaskFilter, TaskTransition, TransitionLink, not_found,
};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// How the in-memory backend mints ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// `<prefix>_<n>` from a per-store counter.
    Sequential,
    /// `<prefix>_<ulid>`.
    #[default]
    Random,
}

/// Insertion-ordered table with an id index.
#[derive(Debug)]
struct Table<T> {
    rows: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Table {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Clone> Table<T> {
    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|i| &self.rows[*i])
    }

    fn insert(&mut self, id: &str, row: T) {
        self.index.insert(id.to_string(), self.rows.len());
        self.rows.push(row);
    }

    fn replace(&mut self, id: &str, row: T) {
        if let Some(i) = self.index.get(id) {
            self.rows[*i] = row;
        }
    }

    fn remove(&mut self, id: &str) -> Option<T> {
        let i = self.index.remove(id)?;
        let row = self.rows.remove(i);
        for pos in self.index.values_mut() {
            if *pos > i {
                *pos -= 1;
            }
        }
        Some(row)
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.rows.iter()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    foundups: Table<Foundup>,
    tasks: Table<Task>,
    proofs: Table<Proof>,
    verifications: Table<Verification>,
    payouts: Table<Payout>,
    distributions: Table<DistributionPost>,
    proposals: Table<TreasuryProposal>,
    treasury: HashMap<String, TreasuryState>,
    cabr_scores: Vec<CabrScore>,
    events: Vec<EventRecord>,
}

impl MemoryState {
    fn require_foundup(&self, id: &str) -> Result<&Foundup, MarketError> {
        self.foundups.get(id).ok_or_else(|| not_found("foundup", id))
    }

    fn treasury_of(&self, foundup_id: &str) -> TreasuryState {
        self.treasury
            .get(foundup_id)
            .cloned()
            .unwrap_or_else(|| TreasuryState::empty(foundup_id))
    }

    fn require_unique_id<T: Clone>(table: &Table<T>, kind: &str, id: &str) -> Result<(), MarketError> {
        if id.is_empty() {
            return Err(MarketError::ValidationError(format!("{} id must be set", kind)));
        }
        if table.contains(id) {
            return Err(MarketError::ValidationError(format!(
                "{} {} already exists",
                kind, id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    ids: IdStrategy,
    counter: AtomicU64,
}

impl InMemoryStore {
    pub fn new(ids: IdStrategy) -> Self {
        InMemoryStore {
            state: Mutex::new(MemoryState::default()),
            ids,
            counter: AtomicU64::new(0),
        }
    }

    pub fn sequential() -> Self {
        Self::new(IdStrategy::Sequential)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, MarketError> {
        self.state
            .lock()
            .map_err(|_| MarketError::StorageError("in-memory store lock poisoned".to_string()))
    }
}

impl MarketStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn next_id(&self, kind: IdKind) -> String {
        match self.ids {
            IdStrategy::Sequential => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                format!("{}_{}", kind.prefix(), n)
            }
            IdStrategy::Random => time::prefixed_ulid(kind.prefix()),
        }
    }

    fn create_foundup(&self, foundup: &Foundup, event: &EventRecord) -> Result<Foundup, MarketError> {
        foundup.validate()?;
        let mut state = self.lock()?;
        MemoryState::require_unique_id(&state.foundups, "foundup", &foundup.id)?;
        if state
            .foundups
            .iter()
            .any(|f| f.token_symbol.eq_ignore_ascii_case(&foundup.token_symbol))
        {
            return Err(store::duplicate_symbol(&foundup.token_symbol));
        }
        state.foundups.insert(&foundup.id, foundup.clone());
        state.events.push(event.clone());
        Ok(foundup.clone())
    }

    fn get_foundup(&self, id: &str) -> Result<Foundup, MarketError> {
        let state = self.lock()?;
        state.require_foundup(id).cloned()
    }

    fn list_foundups(&self) -> Result<Vec<Foundup>, MarketError> {
        let state = self.lock()?;
        Ok(state.foundups.iter().cloned().collect())
    }

    fn update_foundup_metadata(
        &self,
        id: &str,
        patch: &MetadataPatch,
        event: &EventRecord,
    ) -> Result<Foundup, MarketError> {
        let mut state = self.lock()?;
        let updated = state.require_foundup(id)?.apply_patch(patch, &event.created_at)?;
        state.foundups.replace(id, updated.clone());
        state.events.push(event.clone());
        Ok(updated)
    }

    fn create_task(&self, task: &Task, event: &EventRecord) -> Result<Task, MarketError> {
        task.validate()?;
        let mut state = self.lock()?;
        state.require_foundup(&task.foundup_id)?;
        MemoryState::require_unique_id(&state.tasks, "task", &task.id)?;
        state.tasks.insert(&task.id, task.clone());
        state.events.push(event.clone());
        Ok(task.clone())
    }

    fn get_task(&self, id: &str) -> Result<Task, MarketError> {
        let state = self.lock()?;
        state.tasks.get(id).cloned().ok_or_else(|| not_found("task", id))
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    fn apply_transition(
        &self,
        transition: &TaskTransition,
        event: &EventRecord,
    ) -> Result<Task, MarketError> {
        let mut state = self.lock()?;
        let current = state
            .tasks
            .get(&transition.task_id)
            .ok_or_else(|| not_found("task", &transition.task_id))?;
        let next = transition.apply_to(current)?;

        match &transition.link {
            TransitionLink::None => {}
            TransitionLink::Proof(p) => {
                MemoryState::require_unique_id(&state.proofs, "proof", &p.id)?;
                state.proofs.insert(&p.id, p.clone());
            }
            TransitionLink::Verification(v) => {
                MemoryState::require_unique_id(&state.verifications, "verification", &v.id)?;
                state.verifications.insert(&v.id, v.clone());
            }
            TransitionLink::Payout(p) => {
                MemoryState::require_unique_id(&state.payouts, "payout", &p.id)?;
                state.payouts.insert(&p.id, p.clone());
            }
        }
        state.tasks.replace(&transition.task_id, next.clone());
        state.events.push(event.clone());
        Ok(next)
    }

    fn record_rejection(
        &self,
        verification: &Verification,
        event: &EventRecord,
    ) -> Result<Verification, MarketError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get(&verification.task_id)
            .ok_or_else(|| not_found("task", &verification.task_id))?;
        store::require_pending_rejection(task, verification)?;
        MemoryState::require_unique_id(&state.verifications, "verification", &verification.id)?;
        state
            .verifications
            .insert(&verification.id, verification.clone());
        state.events.push(event.clone());
        Ok(verification.clone())
    }

    fn get_proof(&self, id: &str) -> Result<Proof, MarketError> {
        let state = self.lock()?;
        state.proofs.get(id).cloned().ok_or_else(|| not_found("proof", id))
    }

    fn get_verification(&self, id: &str) -> Result<Verification, MarketError> {
        let state = self.lock()?;
        state
            .verifications
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("verification", id))
    }

    fn get_payout(&self, id: &str) -> Result<Payout, MarketError> {
        let state = self.lock()?;
        state.payouts.get(id).cloned().ok_or_else(|| not_found("payout", id))
    }

    fn find_distribution(
        &self,
        task_id: &str,
        channel: &str,
    ) -> Result<Option<DistributionPost>, MarketError> {
        let state = self.lock()?;
        Ok(state
            .distributions
            .iter()
            .find(|d| d.task_id == task_id && d.channel == channel)
            .cloned())
    }

    fn claim_distribution(
        &self,
        post: &DistributionPost,
    ) -> Result<DistributionClaim, MarketError> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .distributions
            .iter()
            .find(|d| d.task_id == post.task_id && d.channel == post.channel)
        {
            return Ok(DistributionClaim::Existing(existing.clone()));
        }
        if !state.tasks.contains(&post.task_id) {
            return Err(not_found("task", &post.task_id));
        }
        MemoryState::require_unique_id(&state.distributions, "distribution", &post.id)?;
        state.distributions.insert(&post.id, post.clone());
        Ok(DistributionClaim::Claimed(post.clone()))
    }

    fn complete_distribution(
        &self,
        post_id: &str,
        external_post_id: Option<&str>,
        event: &EventRecord,
    ) -> Result<DistributionPost, MarketError> {
        let mut state = self.lock()?;
        let mut post = state
            .distributions
            .get(post_id)
            .cloned()
            .ok_or_else(|| not_found("distribution", post_id))?;
        post.external_post_id = external_post_id.map(str::to_string);
        state.distributions.replace(post_id, post.clone());
        state.events.push(event.clone());
        Ok(post)
    }

    fn release_distribution(&self, post_id: &str) -> Result<(), MarketError> {
        let mut state = self.lock()?;
        state
            .distributions
            .remove(post_id)
            .map(|_| ())
            .ok_or_else(|| not_found("distribution", post_id))
    }

    fn list_distributions(&self, task_id: &str) -> Result<Vec<DistributionPost>, MarketError> {
        let state = self.lock()?;
        Ok(state
            .distributions
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    fn record_cabr_score(
        &self,
        score: &CabrScore,
        event: &EventRecord,
    ) -> Result<CabrScore, MarketError> {
        let mut state = self.lock()?;
        state.require_foundup(&score.foundup_id)?;
        state.cabr_scores.push(score.clone());
        state.events.push(event.clone());
        Ok(score.clone())
    }

    fn latest_cabr_score(&self, foundup_id: &str) -> Result<Option<CabrScore>, MarketError> {
        let state = self.lock()?;
        Ok(state
            .cabr_scores
            .iter()
            .rev()
            .find(|s| s.foundup_id == foundup_id)
            .cloned())
    }

    fn treasury_state(&self, foundup_id: &str) -> Result<TreasuryState, MarketError> {
        let state = self.lock()?;
        state.require_foundup(foundup_id)?;
        Ok(state.treasury_of(foundup_id))
    }

    fn deposit(
        &self,
        foundup_id: &str,
        amount: u64,
        event: &EventRecord,
    ) -> Result<TreasuryState, MarketError> {
        let mut state = self.lock()?;
        state.require_foundup(foundup_id)?;
        let next = state.treasury_of(foundup_id).credited(amount, &event.created_at)?;
        state.treasury.insert(foundup_id.to_string(), next.clone());
        state.events.push(event.with_resulting_balance(next.balance));
        Ok(next)
    }

    fn create_proposal(
        &self,
        proposal: &TreasuryProposal,
        event: &EventRecord,
    ) -> Result<TreasuryProposal, MarketError> {
        let mut state = self.lock()?;
        state.require_foundup(&proposal.foundup_id)?;
        MemoryState::require_unique_id(&state.proposals, "proposal", &proposal.id)?;
        let next = state
            .treasury_of(&proposal.foundup_id)
            .reserved(proposal.amount, &event.created_at)?;
        state.proposals.insert(&proposal.id, proposal.clone());
        state.treasury.insert(proposal.foundup_id.clone(), next);
        state.events.push(event.clone());
        Ok(proposal.clone())
    }

    fn get_proposal(&self, id: &str) -> Result<TreasuryProposal, MarketError> {
        let state = self.lock()?;
        state
            .proposals
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("proposal", id))
    }

    fn list_proposals(&self, foundup_id: &str) -> Result<Vec<TreasuryProposal>, MarketError> {
        let state = self.lock()?;
        Ok(state
            .proposals
            .iter()
            .filter(|p| p.foundup_id == foundup_id)
            .cloned()
            .collect())
    }

    fn update_proposal(
        &self,
        proposal: &TreasuryProposal,
        expected_status: ProposalStatus,
        expected_approvals: usize,
        event: &EventRecord,
    ) -> Result<TreasuryProposal, MarketError> {
        let mut state = self.lock()?;
        let current = state
            .proposals
            .get(&proposal.id)
            .ok_or_else(|| not_found("proposal", &proposal.id))?;
        store::check_proposal_cas(current, expected_status, expected_approvals)?;
        state.proposals.replace(&proposal.id, proposal.clone());
        state.events.push(event.clone());
        Ok(proposal.clone())
    }

    fn execute_proposal(
        &self,
        id: &str,
        execution_ref: &str,
        executed_at: &str,
        event: &EventRecord,
    ) -> Result<(TreasuryProposal, TreasuryState), MarketError> {
        let mut state = self.lock()?;
        let current = state
            .proposals
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("proposal", id))?;
        store::require_approved(&current)?;
        let next_state = state
            .treasury_of(&current.foundup_id)
            .debited(current.amount, executed_at)?;

        let executed = TreasuryProposal {
            status: ProposalStatus::Executed,
            execution_ref: Some(execution_ref.to_string()),
            executed_at: Some(executed_at.to_string()),
            ..current
        };
        state.proposals.replace(id, executed.clone());
        state
            .treasury
            .insert(executed.foundup_id.clone(), next_state.clone());
        state.events.push(event.with_resulting_balance(next_state.balance));
        Ok((executed, next_state))
    }

    fn append_event(&self, event: &EventRecord) -> Result<(), MarketError> {
        let mut state = self.lock()?;
        state.events.push(event.clone());
        Ok(())
    }

    fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, MarketError> {
        let state = self.lock()?;
        let matching = state.events.iter().filter(|e| filter.matches(e)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}
