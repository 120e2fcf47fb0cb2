#![allow(dead_code)]

use agent_market::core::memory::InMemoryStore;
use agent_market::core::model::{Foundup, Proof, Task, TaskStatus, Verification};
use agent_market::core::sqlite::SqliteStore;
use agent_market::core::store::MarketStore;
use agent_market::core::config::TreasuryConfig;
use agent_market::plugins::distribution::DistributionGate;
use agent_market::plugins::foundups::FoundupRegistry;
use agent_market::plugins::pipeline::TaskPipeline;
use agent_market::plugins::policy::{AuthorizationPolicy, Role};
use agent_market::plugins::treasury::TreasuryGovernance;
use std::sync::Arc;

pub const VERIFIER: &str = "verifier1";
pub const TREASURER: &str = "treasury1";
pub const TREASURER_2: &str = "treasury2";
pub const PUBLISHER: &str = "dist1";
pub const AGENT: &str = "agent1";
pub const OWNER: &str = "alice";

pub fn policy() -> AuthorizationPolicy {
    AuthorizationPolicy::new()
        .grant(VERIFIER, Role::Verifier)
        .grant(TREASURER, Role::Treasury)
        .grant(TREASURER_2, Role::Treasury)
        .grant(OWNER, Role::Treasury)
        .grant(PUBLISHER, Role::Distribution)
}

/// Every backend the conformance tests run against.
pub fn backends() -> Vec<(&'static str, Arc<dyn MarketStore>)> {
    vec![
        ("memory", Arc::new(InMemoryStore::sequential())),
        (
            "sqlite",
            Arc::new(SqliteStore::in_memory().expect("open sqlite in memory")),
        ),
    ]
}

pub struct Market {
    pub store: Arc<dyn MarketStore>,
    pub registry: FoundupRegistry,
    pub pipeline: TaskPipeline,
    pub gate: DistributionGate,
    pub treasury: TreasuryGovernance,
}

impl Market {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        Self::with_treasury(store, TreasuryConfig::default())
    }

    pub fn with_treasury(store: Arc<dyn MarketStore>, config: TreasuryConfig) -> Self {
        Market {
            registry: FoundupRegistry::new(store.clone()),
            pipeline: TaskPipeline::new(store.clone(), policy()),
            gate: DistributionGate::new(store.clone(), policy()),
            treasury: TreasuryGovernance::new(store.clone(), policy(), config),
            store,
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(InMemoryStore::sequential()))
    }

    pub fn foundup(&self, symbol: &str) -> Foundup {
        let draft = Foundup::draft(&format!("Venture {}", symbol), OWNER, symbol)
            .expect("valid foundup draft");
        self.registry.create_foundup(draft).expect("create foundup")
    }

    pub fn task(&self, foundup_id: &str, reward: u64) -> Task {
        let draft = Task::draft(foundup_id, "Write the onboarding guide", reward, OWNER)
            .expect("valid task draft");
        self.pipeline.create_task(draft).expect("create task")
    }

    pub fn proof(&self, task_id: &str, submitter: &str) -> Proof {
        Proof::draft(
            task_id,
            submitter,
            "https://artifacts.example/guide.md",
            &Proof::hash_artifact(b"guide"),
        )
        .expect("valid proof draft")
    }

    /// Drives a fresh task forward until it reaches `target`.
    pub fn advance(&self, task_id: &str, target: TaskStatus) -> Task {
        let mut task = self.pipeline.get_task(task_id).expect("get task");
        while task.status.rank() < target.rank() {
            task = match task.status {
                TaskStatus::Open => self.pipeline.claim_task(task_id, AGENT),
                TaskStatus::Claimed => self.pipeline.submit_proof(self.proof(task_id, AGENT)),
                TaskStatus::Submitted => self.pipeline.verify_proof(
                    task_id,
                    Verification::draft(task_id, VERIFIER, true, "looks good"),
                ),
                TaskStatus::Verified => self.pipeline.trigger_payout(task_id, TREASURER),
                TaskStatus::Paid => unreachable!("paid is terminal"),
            }
            .expect("advance task");
        }
        task
    }
}
