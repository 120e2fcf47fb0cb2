//! CLI struct definitions for the agent-market command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "agent-market",
    version = env!("CARGO_PKG_VERSION"),
    about = "Foundup task marketplace: tasks, proofs, payouts, milestones and treasury"
)]
pub(crate) struct Cli {
    /// Project root holding `market.toml` and the `.agent-market/` data dir.
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Config file (overrides `$AGENT_MARKET_CONFIG` and `<root>/market.toml`).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Output format.
    #[clap(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Apply pending schema migrations to the SQLite store
    Migrate {
        /// Stop at this version instead of the latest.
        #[clap(long)]
        target: Option<u32>,
    },

    /// Create and inspect foundups
    #[clap(name = "foundup", visible_alias = "f")]
    Foundup(FoundupCli),

    /// Task lifecycle: create, claim, submit, verify, payout
    #[clap(name = "task", visible_alias = "t")]
    Task(TaskCli),

    /// Publish verified milestones
    Milestone(MilestoneCli),

    /// Record and read CABR scores
    Cabr(CabrCli),

    /// Treasury deposits and transfer proposals
    Treasury(TreasuryCli),

    /// Query the audit log
    Events {
        #[clap(long)]
        foundup: Option<String>,
        #[clap(long)]
        task: Option<String>,
        #[clap(long = "type")]
        event_type: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
    },

    /// Launch a foundup: repo, token, treasury account and initial tasks
    Launch {
        #[clap(long)]
        name: String,
        #[clap(long)]
        owner: String,
        #[clap(long)]
        symbol: String,
        #[clap(long)]
        repo: String,
        #[clap(long, default_value = "github")]
        provider: String,
        /// Initial task as `title:reward`; repeatable.
        #[clap(long = "task")]
        tasks: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct FoundupCli {
    #[clap(subcommand)]
    pub command: FoundupCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum FoundupCommand {
    Create {
        #[clap(long)]
        name: String,
        #[clap(long)]
        owner: String,
        #[clap(long)]
        symbol: String,
        /// Write-once metadata as `key=value`; repeatable.
        #[clap(long = "immutable")]
        immutable: Vec<String>,
        /// Mutable metadata as `key=value`; repeatable.
        #[clap(long = "mutable")]
        mutable: Vec<String>,
    },
    /// Merge metadata into a foundup; write-once keys cannot change.
    SetMeta {
        #[clap(long)]
        id: String,
        #[clap(long)]
        actor: String,
        #[clap(long = "immutable")]
        immutable: Vec<String>,
        #[clap(long = "mutable")]
        mutable: Vec<String>,
    },
    Show {
        #[clap(long)]
        id: String,
    },
    List,
}

#[derive(clap::Args, Debug)]
pub(crate) struct TaskCli {
    #[clap(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TaskCommand {
    Create {
        #[clap(long)]
        foundup: String,
        #[clap(long)]
        title: String,
        #[clap(long)]
        reward: u64,
        #[clap(long)]
        creator: String,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(long, default_value = "")]
        criteria: String,
    },
    Claim {
        #[clap(long)]
        id: String,
        #[clap(long)]
        agent: String,
    },
    /// Submit proof of work. The hash is computed from `--artifact` when given.
    Submit {
        #[clap(long)]
        id: String,
        #[clap(long)]
        agent: String,
        #[clap(long)]
        uri: String,
        #[clap(long)]
        hash: Option<String>,
        #[clap(long)]
        artifact: Option<PathBuf>,
        #[clap(long)]
        notes: Option<String>,
    },
    Verify {
        #[clap(long)]
        id: String,
        #[clap(long)]
        verifier: String,
        #[clap(long)]
        reject: bool,
        #[clap(long, default_value = "")]
        reason: String,
    },
    Payout {
        #[clap(long)]
        id: String,
        #[clap(long)]
        actor: String,
    },
    Trace {
        #[clap(long)]
        id: String,
    },
    List {
        #[clap(long)]
        foundup: Option<String>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        assignee: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct MilestoneCli {
    #[clap(subcommand)]
    pub command: MilestoneCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum MilestoneCommand {
    Publish {
        #[clap(long)]
        task: String,
        #[clap(long)]
        actor: String,
        #[clap(long)]
        channel: String,
        /// Minimum CABR score; 0 disables the gate.
        #[clap(long, default_value_t = 0.0)]
        threshold: f64,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct CabrCli {
    #[clap(subcommand)]
    pub command: CabrCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CabrCommand {
    Record {
        #[clap(long)]
        foundup: String,
        #[clap(long)]
        score: f64,
        /// Extra JSON object stored with the score.
        #[clap(long)]
        payload: Option<String>,
    },
    Latest {
        #[clap(long)]
        foundup: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct TreasuryCli {
    #[clap(subcommand)]
    pub command: TreasuryCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum TreasuryCommand {
    Deposit {
        #[clap(long)]
        foundup: String,
        #[clap(long)]
        amount: u64,
        #[clap(long)]
        source: String,
    },
    Propose {
        #[clap(long)]
        foundup: String,
        #[clap(long)]
        amount: u64,
        #[clap(long)]
        reason: String,
        #[clap(long)]
        proposer: String,
    },
    Approve {
        #[clap(long)]
        id: String,
        #[clap(long)]
        approver: String,
    },
    Execute {
        #[clap(long)]
        id: String,
        #[clap(long)]
        executor: String,
    },
    Show {
        #[clap(long)]
        foundup: String,
    },
}
