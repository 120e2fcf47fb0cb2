//! Centralized SQLite schema definitions for the market database.
//!
//! One database file ("market.db") holds every entity table plus the
//! append-only event log. Statements are idempotent (`IF NOT EXISTS`) so a
//! migration can be replayed safely; `migration.rs` decides which run.

pub const MARKET_DB_NAME: &str = "market.db";

pub const SCHEMA_MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        description TEXT NOT NULL,
        applied_at TEXT NOT NULL
    )
";

// --- 1. Core entities ---

pub const SCHEMA_FOUNDUPS: &str = "
    CREATE TABLE IF NOT EXISTS foundups (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        token_symbol TEXT NOT NULL COLLATE NOCASE UNIQUE,
        immutable_metadata TEXT NOT NULL DEFAULT '{}', -- JSON object, write-once keys
        mutable_metadata TEXT NOT NULL DEFAULT '{}',   -- JSON object, merge-updated
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        foundup_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        acceptance_criteria TEXT NOT NULL DEFAULT '',
        reward_amount INTEGER NOT NULL CHECK (reward_amount > 0),
        creator_id TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('open', 'claimed', 'submitted', 'verified', 'paid')),
        assignee_id TEXT,
        proof_id TEXT,
        verification_id TEXT,
        payout_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(foundup_id) REFERENCES foundups(id),
        FOREIGN KEY(proof_id) REFERENCES proofs(id),
        FOREIGN KEY(verification_id) REFERENCES verifications(id),
        FOREIGN KEY(payout_id) REFERENCES payouts(id)
    )
";

pub const SCHEMA_PROOFS: &str = "
    CREATE TABLE IF NOT EXISTS proofs (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        submitter_id TEXT NOT NULL,
        artifact_uri TEXT NOT NULL,
        artifact_hash TEXT NOT NULL,
        notes TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(task_id) REFERENCES tasks(id)
    )
";

pub const SCHEMA_VERIFICATIONS: &str = "
    CREATE TABLE IF NOT EXISTS verifications (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        verifier_id TEXT NOT NULL,
        approved INTEGER NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        FOREIGN KEY(task_id) REFERENCES tasks(id)
    )
";

pub const SCHEMA_PAYOUTS: &str = "
    CREATE TABLE IF NOT EXISTS payouts (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL UNIQUE,
        recipient_id TEXT NOT NULL,
        amount INTEGER NOT NULL CHECK (amount > 0),
        status TEXT NOT NULL,
        reference TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(task_id) REFERENCES tasks(id)
    )
";

// --- 2. Event log ---

pub const SCHEMA_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        event_type TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        payload TEXT NOT NULL, -- JSON, tagged by kind
        foundup_id TEXT,
        task_id TEXT,
        proof_id TEXT,
        payout_id TEXT,
        created_at TEXT NOT NULL
    )
";

// --- 3. Distribution and scoring ---

pub const SCHEMA_DISTRIBUTION_POSTS: &str = "
    CREATE TABLE IF NOT EXISTS distribution_posts (
        id TEXT PRIMARY KEY,
        foundup_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        content TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        dedupe_key TEXT NOT NULL UNIQUE,
        external_post_id TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(task_id, channel),
        FOREIGN KEY(foundup_id) REFERENCES foundups(id),
        FOREIGN KEY(task_id) REFERENCES tasks(id)
    )
";

pub const SCHEMA_CABR_SCORES: &str = "
    CREATE TABLE IF NOT EXISTS cabr_scores (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        foundup_id TEXT NOT NULL,
        score REAL NOT NULL,
        payload TEXT NOT NULL DEFAULT 'null',
        recorded_at TEXT NOT NULL,
        FOREIGN KEY(foundup_id) REFERENCES foundups(id)
    )
";

// --- 4. Treasury ---

pub const SCHEMA_TREASURY_STATES: &str = "
    CREATE TABLE IF NOT EXISTS treasury_states (
        foundup_id TEXT PRIMARY KEY,
        balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        pending_outflows INTEGER NOT NULL DEFAULT 0 CHECK (pending_outflows >= 0),
        total_inflows INTEGER NOT NULL DEFAULT 0,
        total_outflows INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(foundup_id) REFERENCES foundups(id)
    )
";

pub const SCHEMA_TREASURY_PROPOSALS: &str = "
    CREATE TABLE IF NOT EXISTS treasury_proposals (
        id TEXT PRIMARY KEY,
        foundup_id TEXT NOT NULL,
        proposer_id TEXT NOT NULL,
        amount INTEGER NOT NULL CHECK (amount > 0),
        reason TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'rejected', 'executed', 'expired')),
        approvals TEXT NOT NULL DEFAULT '[]', -- JSON array of approver ids
        required_approvals INTEGER NOT NULL,
        execution_ref TEXT,
        created_at TEXT NOT NULL,
        executed_at TEXT,
        FOREIGN KEY(foundup_id) REFERENCES foundups(id)
    )
";

// --- 5. Indexes ---

pub const INDEX_TASKS_FOUNDUP: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_foundup ON tasks(foundup_id)";
pub const INDEX_TASKS_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)";
pub const INDEX_EVENTS_TASK: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, seq)";
pub const INDEX_EVENTS_FOUNDUP: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_foundup ON events(foundup_id, seq)";
pub const INDEX_EVENTS_TYPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)";
pub const INDEX_CABR_FOUNDUP: &str =
    "CREATE INDEX IF NOT EXISTS idx_cabr_scores_foundup ON cabr_scores(foundup_id, seq)";
pub const INDEX_PROPOSALS_FOUNDUP: &str =
    "CREATE INDEX IF NOT EXISTS idx_treasury_proposals_foundup ON treasury_proposals(foundup_id)";
