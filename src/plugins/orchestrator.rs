//! Foundup launch saga.
//!
//! Steps run in order and stop at the first failure. Validation and
//! not-found failures come back as `LaunchOutcome::Failed` naming the step;
//! every other error is returned as `Err`. Steps that already ran are not
//! compensated.

use crate::core::error::MarketError;
use crate::core::events::{EventFilter, EventPayload, EventRecord};
use crate::core::model::{Foundup, IdKind, Metadata, Task};
use crate::core::store::MarketStore;
use crate::core::time;
use crate::plugins::adapters::{RepoProvisioningAdapter, TokenFactoryAdapter, TokenTerms};
use crate::plugins::foundups::FoundupRegistry;
use crate::plugins::pipeline::TaskPipeline;
use crate::plugins::policy::AuthorizationPolicy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;

pub const LAUNCHED_EVENT: &str = "foundup.launched";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStep {
    CreateFoundup,
    ProvisionRepo,
    DeployToken,
    ConfigureVesting,
    TreasuryAccount,
    CreateTasks,
    RecordLaunch,
}

impl LaunchStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStep::CreateFoundup => "create_foundup",
            LaunchStep::ProvisionRepo => "provision_repo",
            LaunchStep::DeployToken => "deploy_token",
            LaunchStep::ConfigureVesting => "configure_vesting",
            LaunchStep::TreasuryAccount => "treasury_account",
            LaunchStep::CreateTasks => "create_tasks",
            LaunchStep::RecordLaunch => "record_launch",
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InitialTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    pub reward_amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub name: String,
    pub owner_id: String,
    pub token_symbol: String,
    #[serde(default)]
    pub immutable_metadata: Metadata,
    #[serde(default)]
    pub mutable_metadata: Metadata,
    pub repo_name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub token_terms: TokenTerms,
    #[serde(default)]
    pub initial_tasks: Vec<InitialTask>,
}

fn default_provider() -> String {
    "github".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl LaunchRequest {
    pub fn new(name: &str, owner_id: &str, token_symbol: &str, repo_name: &str) -> Self {
        LaunchRequest {
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            token_symbol: token_symbol.to_string(),
            immutable_metadata: Metadata::new(),
            mutable_metadata: Metadata::new(),
            repo_name: repo_name.to_string(),
            provider: default_provider(),
            default_branch: default_branch(),
            token_terms: TokenTerms::default(),
            initial_tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, title: &str, reward_amount: u64) -> Self {
        self.initial_tasks.push(InitialTask {
            title: title.to_string(),
            description: String::new(),
            acceptance_criteria: String::new(),
            reward_amount,
        });
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LaunchReport {
    pub foundup: Foundup,
    pub repo_url: String,
    pub token_address: String,
    pub treasury_account: String,
    pub tasks: Vec<Task>,
    pub audit: Vec<EventRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Launched(Box<LaunchReport>),
    Failed {
        step: LaunchStep,
        kind: String,
        error: String,
    },
}

impl LaunchOutcome {
    pub fn is_launched(&self) -> bool {
        matches!(self, LaunchOutcome::Launched(_))
    }
}

pub struct FoundupOrchestrator {
    store: Arc<dyn MarketStore>,
    registry: FoundupRegistry,
    pipeline: TaskPipeline,
    repos: Arc<dyn RepoProvisioningAdapter>,
    tokens: Arc<dyn TokenFactoryAdapter>,
}

impl FoundupOrchestrator {
    pub fn new(
        store: Arc<dyn MarketStore>,
        policy: AuthorizationPolicy,
        repos: Arc<dyn RepoProvisioningAdapter>,
        tokens: Arc<dyn TokenFactoryAdapter>,
    ) -> Self {
        FoundupOrchestrator {
            registry: FoundupRegistry::new(store.clone()),
            pipeline: TaskPipeline::new(store.clone(), policy),
            store,
            repos,
            tokens,
        }
    }

    pub fn launch(&self, request: LaunchRequest) -> Result<LaunchOutcome, MarketError> {
        match self.run(&request) {
            Ok(report) => Ok(LaunchOutcome::Launched(Box::new(report))),
            Err((step, err)) if err.is_business() => {
                tracing::warn!(step = %step, error = %err, name = %request.name, "foundup launch failed");
                Ok(LaunchOutcome::Failed {
                    step,
                    kind: err.kind().to_string(),
                    error: err.to_string(),
                })
            }
            Err((_, err)) => Err(err),
        }
    }

    fn run(&self, req: &LaunchRequest) -> Result<LaunchReport, (LaunchStep, MarketError)> {
        let at = |step: LaunchStep| move |e: MarketError| (step, e);

        let mut draft = Foundup::draft(&req.name, &req.owner_id, &req.token_symbol)
            .map_err(at(LaunchStep::CreateFoundup))?;
        draft.immutable_metadata = req.immutable_metadata.clone();
        draft.mutable_metadata = req.mutable_metadata.clone();
        let foundup = self
            .registry
            .create_foundup(draft)
            .map_err(at(LaunchStep::CreateFoundup))?;

        let repo_url = self
            .repos
            .provision_repo(&foundup.id, &req.repo_name, &req.provider, &req.default_branch)
            .map_err(at(LaunchStep::ProvisionRepo))?;
        let token_address = self
            .tokens
            .deploy_token(&foundup, &req.token_terms)
            .map_err(at(LaunchStep::DeployToken))?;
        self.tokens
            .configure_vesting(&token_address, &req.token_terms)
            .map_err(at(LaunchStep::ConfigureVesting))?;
        let treasury_account = self
            .tokens
            .get_treasury_account(&foundup.id)
            .map_err(at(LaunchStep::TreasuryAccount))?;

        let mut tasks = Vec::with_capacity(req.initial_tasks.len());
        for initial in &req.initial_tasks {
            let task = Task::draft(
                &foundup.id,
                &initial.title,
                initial.reward_amount,
                &req.owner_id,
            )
            .map(|t| {
                t.with_description(&initial.description)
                    .with_acceptance_criteria(&initial.acceptance_criteria)
            })
            .and_then(|t| self.pipeline.create_task(t))
            .map_err(at(LaunchStep::CreateTasks))?;
            tasks.push(task);
        }

        let task_ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut context = serde_json::Map::new();
        context.insert("repo_url".into(), json!(repo_url));
        context.insert("token_address".into(), json!(token_address));
        context.insert("treasury_account".into(), json!(treasury_account));
        context.insert("task_ids".into(), json!(task_ids));
        let event = EventRecord::new(
            self.store.next_id(IdKind::Event),
            &req.owner_id,
            EventPayload::Custom {
                event_type: LAUNCHED_EVENT.to_string(),
                context,
            },
            &time::now_epoch_z(),
        )
        .for_foundup(&foundup.id);
        self.store
            .append_event(&event)
            .map_err(at(LaunchStep::RecordLaunch))?;

        let audit = self
            .store
            .list_events(&EventFilter::for_foundup(&foundup.id))
            .map_err(at(LaunchStep::RecordLaunch))?;
        tracing::info!(foundup_id = %foundup.id, tasks = tasks.len(), %token_address, "foundup launched");
        Ok(LaunchReport {
            foundup,
            repo_url,
            token_address,
            treasury_account,
            tasks,
            audit,
        })
    }
}
