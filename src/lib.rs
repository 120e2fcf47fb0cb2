//! agent-market: a Foundup task marketplace backend.
//!
//! Actors create ventures ("Foundups"), post paid tasks, claim them, submit
//! proof of work, get it verified and get paid. Verified milestones can be
//! published to external channels once the foundup's CABR score clears a
//! gate, and each foundup runs a counted-approval treasury.
//!
//! # Core Principles
//!
//! - **Linear lifecycle**: `open -> claimed -> submitted -> verified -> paid`, no skips
//! - **Compare-and-swap transitions**: keyed by `(task_id, expected_status)`
//! - **Event sourced**: every mutation appends exactly one audit event in the same unit of work
//! - **Fail closed**: actors without a role mapping hold only `advisory`
//! - **Swappable storage**: in-memory and SQLite backends share one contract
//!
//! # Examples
//!
//! ```bash
//! agent-market foundup create --name Alpha --owner alice --symbol FUP
//! agent-market task create --foundup <id> --title "Write docs" --reward 250 --creator alice
//! agent-market task claim --id <task> --agent agent1
//! agent-market task trace --id <task> --format json
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: records, events, storage backends, migrations, config
//! - [`plugins`]: pipeline, treasury, distribution gate, adapters, orchestrator

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{
    CabrCommand, Cli, Command, FoundupCommand, MilestoneCommand, OutputFormat, TaskCommand,
    TreasuryCommand,
};
use crate::core::config::{Backend, MarketConfig};
use crate::core::error::MarketError;
use crate::core::events::EventFilter;
use crate::core::model::{
    Foundup, Metadata, MetadataPatch, Proof, Task, TaskStatus, Verification,
};
use crate::core::sqlite::SqliteStore;
use crate::core::store::{MarketStore, TaskFilter};
use crate::core::time;
use crate::plugins::adapters::{MockRepoProvisioner, MockTokenFactory};
use crate::plugins::distribution::DistributionGate;
use crate::plugins::foundups::FoundupRegistry;
use crate::plugins::orchestrator::{FoundupOrchestrator, LaunchRequest};
use crate::plugins::pipeline::TaskPipeline;
use crate::plugins::treasury::TreasuryGovernance;

use clap::Parser;
use colored::Colorize;
use serde_json::{Value as JsonValue, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Installs the stderr subscriber. `RUST_LOG` applies when no `-v` is given.
pub fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parses `key=value`; the value is JSON when it parses, a string otherwise.
fn parse_metadata(pairs: &[String]) -> Result<Metadata, MarketError> {
    let mut map = Metadata::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            MarketError::ValidationError(format!("metadata '{}' must be key=value", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(MarketError::ValidationError(format!(
                "metadata '{}' has an empty key",
                pair
            )));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

/// Parses `title:reward`, splitting on the last colon.
fn parse_initial_task(raw: &str) -> Result<(String, u64), MarketError> {
    let (title, reward) = raw.rsplit_once(':').ok_or_else(|| {
        MarketError::ValidationError(format!("task '{}' must be title:reward", raw))
    })?;
    let reward = reward.trim().parse::<u64>().map_err(|e| {
        MarketError::ValidationError(format!("task '{}' has a bad reward: {}", raw, e))
    })?;
    Ok((title.trim().to_string(), reward))
}

fn emit(format: OutputFormat, cmd: &str, body: JsonValue) -> Result<(), MarketError> {
    match format {
        OutputFormat::Json => {
            let envelope = time::command_envelope(cmd, "ok", body);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => {
            println!("{} {}", "ok".green().bold(), cmd.bright_white());
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}

struct Services {
    store: Arc<dyn MarketStore>,
    config: MarketConfig,
}

impl Services {
    fn pipeline(&self) -> TaskPipeline {
        TaskPipeline::new(self.store.clone(), self.config.policy())
    }

    fn gate(&self) -> DistributionGate {
        DistributionGate::new(self.store.clone(), self.config.policy())
    }

    fn treasury(&self) -> TreasuryGovernance {
        TreasuryGovernance::new(
            self.store.clone(),
            self.config.policy(),
            self.config.treasury.clone(),
        )
    }

    fn registry(&self) -> FoundupRegistry {
        FoundupRegistry::new(self.store.clone())
    }
}

pub fn run() -> Result<(), MarketError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let root = match &cli.root {
        Some(r) => r.clone(),
        None => std::env::current_dir()?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| MarketConfig::resolve_path(&root));
    let config = MarketConfig::load(&config_path)?;
    if config.storage.backend == Backend::Memory {
        tracing::warn!("memory backend selected: state is discarded when the command exits");
    }

    if let Command::Migrate { target } = &cli.command {
        return run_migrate(&root, &config, *target, cli.format);
    }

    let services = Services {
        store: config.open_store(&root)?,
        config,
    };
    tracing::debug!(backend = services.store.backend_name(), root = %root.display(), "store ready");

    match cli.command {
        Command::Migrate { .. } => Ok(()),
        Command::Foundup(f) => run_foundup(&services, f.command, cli.format),
        Command::Task(t) => run_task(&services, t.command, cli.format),
        Command::Milestone(m) => match m.command {
            MilestoneCommand::Publish {
                task,
                actor,
                channel,
                threshold,
            } => {
                let post = services
                    .gate()
                    .publish_verified_milestone(&task, &actor, &channel, threshold)?;
                emit(cli.format, "milestone.publish", json!({ "post": post }))
            }
        },
        Command::Cabr(c) => run_cabr(&services, c.command, cli.format),
        Command::Treasury(t) => run_treasury(&services, t.command, cli.format),
        Command::Events {
            foundup,
            task,
            event_type,
            limit,
        } => {
            let filter = EventFilter {
                foundup_id: foundup,
                task_id: task,
                event_type,
                limit,
            };
            let events = services.store.list_events(&filter)?;
            emit(
                cli.format,
                "events.list",
                json!({ "count": events.len(), "events": events }),
            )
        }
        Command::Launch {
            name,
            owner,
            symbol,
            repo,
            provider,
            tasks,
        } => {
            let mut request = LaunchRequest::new(&name, &owner, &symbol, &repo);
            request.provider = provider;
            for raw in &tasks {
                let (title, reward) = parse_initial_task(raw)?;
                request = request.with_task(&title, reward);
            }
            let orchestrator = FoundupOrchestrator::new(
                services.store.clone(),
                services.config.policy(),
                Arc::new(MockRepoProvisioner::new()),
                Arc::new(MockTokenFactory::new()),
            );
            let outcome = orchestrator.launch(request)?;
            if !outcome.is_launched() {
                eprintln!("{} launch stopped early", "failed".red().bold());
            }
            emit(cli.format, "foundup.launch", json!({ "outcome": outcome }))
        }
    }
}

fn run_migrate(
    root: &Path,
    config: &MarketConfig,
    target: Option<u32>,
    format: OutputFormat,
) -> Result<(), MarketError> {
    if config.storage.backend != Backend::Sqlite {
        return Err(MarketError::ConfigError(
            "migrate needs the sqlite backend".into(),
        ));
    }
    let path: PathBuf = config.database_path(root);
    let store = SqliteStore::open_unmigrated(&path)?;
    let report = store.migrate(target)?;
    emit(
        format,
        "migrate",
        json!({
            "db": path.to_string_lossy(),
            "from_version": report.from_version,
            "to_version": report.to_version,
            "applied": report.applied,
            "journal_mode": store.journal_mode()?,
        }),
    )
}

fn run_foundup(
    services: &Services,
    command: FoundupCommand,
    format: OutputFormat,
) -> Result<(), MarketError> {
    let registry = services.registry();
    match command {
        FoundupCommand::Create {
            name,
            owner,
            symbol,
            immutable,
            mutable,
        } => {
            let mut draft = Foundup::draft(&name, &owner, &symbol)?;
            draft.immutable_metadata = parse_metadata(&immutable)?;
            draft.mutable_metadata = parse_metadata(&mutable)?;
            let foundup = registry.create_foundup(draft)?;
            emit(format, "foundup.create", json!({ "foundup": foundup }))
        }
        FoundupCommand::SetMeta {
            id,
            actor,
            immutable,
            mutable,
        } => {
            let patch = MetadataPatch {
                immutable: parse_metadata(&immutable)?,
                mutable: parse_metadata(&mutable)?,
            };
            let foundup = registry.update_metadata(&id, &patch, &actor)?;
            emit(format, "foundup.set_meta", json!({ "foundup": foundup }))
        }
        FoundupCommand::Show { id } => {
            let foundup = registry.get(&id)?;
            let treasury = services.treasury().get_state(&id)?;
            emit(
                format,
                "foundup.show",
                json!({ "foundup": foundup, "treasury": treasury }),
            )
        }
        FoundupCommand::List => {
            let foundups = registry.list()?;
            emit(
                format,
                "foundup.list",
                json!({ "count": foundups.len(), "items": foundups }),
            )
        }
    }
}

fn run_task(
    services: &Services,
    command: TaskCommand,
    format: OutputFormat,
) -> Result<(), MarketError> {
    let pipeline = services.pipeline();
    match command {
        TaskCommand::Create {
            foundup,
            title,
            reward,
            creator,
            description,
            criteria,
        } => {
            let draft = Task::draft(&foundup, &title, reward, &creator)?
                .with_description(&description)
                .with_acceptance_criteria(&criteria);
            let task = pipeline.create_task(draft)?;
            emit(format, "task.create", json!({ "task": task }))
        }
        TaskCommand::Claim { id, agent } => {
            let task = pipeline.claim_task(&id, &agent)?;
            emit(format, "task.claim", json!({ "task": task }))
        }
        TaskCommand::Submit {
            id,
            agent,
            uri,
            hash,
            artifact,
            notes,
        } => {
            let hash = match (hash, artifact) {
                (Some(h), _) => h,
                (None, Some(path)) => Proof::hash_artifact(&fs::read(&path)?),
                (None, None) => {
                    return Err(MarketError::ValidationError(
                        "pass --hash or --artifact".into(),
                    ));
                }
            };
            let mut proof = Proof::draft(&id, &agent, &uri, &hash)?;
            if let Some(notes) = notes {
                proof = proof.with_notes(&notes);
            }
            let task = pipeline.submit_proof(proof)?;
            emit(format, "task.submit", json!({ "task": task }))
        }
        TaskCommand::Verify {
            id,
            verifier,
            reject,
            reason,
        } => {
            let verification = Verification::draft(&id, &verifier, !reject, &reason);
            let task = pipeline.verify_proof(&id, verification)?;
            emit(
                format,
                "task.verify",
                json!({ "approved": !reject, "task": task }),
            )
        }
        TaskCommand::Payout { id, actor } => {
            let task = pipeline.trigger_payout(&id, &actor)?;
            emit(format, "task.payout", json!({ "task": task }))
        }
        TaskCommand::Trace { id } => {
            let trace = pipeline.get_trace(&id)?;
            emit(format, "task.trace", json!({ "trace": trace }))
        }
        TaskCommand::List {
            foundup,
            status,
            assignee,
        } => {
            let filter = TaskFilter {
                foundup_id: foundup,
                status: status
                    .as_deref()
                    .map(str::parse::<TaskStatus>)
                    .transpose()?,
                assignee_id: assignee,
            };
            let tasks = pipeline.list_tasks(&filter)?;
            emit(
                format,
                "task.list",
                json!({ "count": tasks.len(), "items": tasks }),
            )
        }
    }
}

fn run_cabr(
    services: &Services,
    command: CabrCommand,
    format: OutputFormat,
) -> Result<(), MarketError> {
    let gate = services.gate();
    match command {
        CabrCommand::Record {
            foundup,
            score,
            payload,
        } => {
            let mut body = match payload {
                Some(raw) => serde_json::from_str::<JsonValue>(&raw)?,
                None => json!({}),
            };
            let obj = body.as_object_mut().ok_or_else(|| {
                MarketError::ValidationError("CABR payload must be a JSON object".into())
            })?;
            obj.insert("score".into(), json!(score));
            let recorded = gate.record_cabr_output(&foundup, body)?;
            emit(format, "cabr.record", json!({ "score": recorded }))
        }
        CabrCommand::Latest { foundup } => {
            let score = gate.get_latest_cabr_score(&foundup)?;
            emit(
                format,
                "cabr.latest",
                json!({ "foundup_id": foundup, "score": score }),
            )
        }
    }
}

fn run_treasury(
    services: &Services,
    command: TreasuryCommand,
    format: OutputFormat,
) -> Result<(), MarketError> {
    let treasury = services.treasury();
    match command {
        TreasuryCommand::Deposit {
            foundup,
            amount,
            source,
        } => {
            let state = treasury.deposit(&foundup, amount, &source)?;
            emit(format, "treasury.deposit", json!({ "treasury": state }))
        }
        TreasuryCommand::Propose {
            foundup,
            amount,
            reason,
            proposer,
        } => {
            let proposal = treasury.propose_transfer(&foundup, amount, &reason, &proposer)?;
            emit(format, "treasury.propose", json!({ "proposal": proposal }))
        }
        TreasuryCommand::Approve { id, approver } => {
            let proposal = treasury.approve_transfer(&id, &approver)?;
            emit(format, "treasury.approve", json!({ "proposal": proposal }))
        }
        TreasuryCommand::Execute { id, executor } => {
            let (proposal, state) = treasury.execute_transfer(&id, &executor)?;
            emit(
                format,
                "treasury.execute",
                json!({ "proposal": proposal, "treasury": state }),
            )
        }
        TreasuryCommand::Show { foundup } => {
            let state = treasury.get_state(&foundup)?;
            let proposals = treasury.list_proposals(&foundup)?;
            emit(
                format,
                "treasury.show",
                json!({ "treasury": state, "proposals": proposals }),
            )
        }
    }
}
