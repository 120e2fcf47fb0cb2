//! SQLite `MarketStore`.
//!
//! One connection behind a mutex; every mutating call runs in its own
//! transaction and commits only after all checks passed. Status changes are
//! conditional updates (`WHERE id = ? AND status = ?`) so a row that moved
//! underneath a writer from another process is reported, never overwritten.
//!
//! Two engines share the schema and migration list: a WAL file database
//! (`SqliteStore::open`) and a private in-memory database
//! (`SqliteStore::in_memory`).

use crate::core::db;
use crate::core::error::MarketError;
use crate::core::events::{EventFilter, EventRecord};
use crate::core::migration::{self, MigrationReport};
use crate::core::model::{
    CabrScore, DistributionPost, Foundup, IdKind, MetadataPatch, Payout, Proof, ProposalStatus,
    Task, TreasuryProposal, TreasuryState, Verification,
};
use crate::core::store::{
    self, DistributionClaim, MarketStore, TaskFilter, TaskTransition, TransitionLink, not_found,
};
use crate::core::time;
use rusqlite::types::{ToSql, Type};
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter,
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const FOUNDUP_COLUMNS: &str =
    "id, name, owner_id, token_symbol, immutable_metadata, mutable_metadata, created_at, updated_at";
const TASK_COLUMNS: &str = "id, foundup_id, title, description, acceptance_criteria, reward_amount, creator_id, status, assignee_id, proof_id, verification_id, payout_id, created_at, updated_at";
const DISTRIBUTION_COLUMNS: &str = "id, foundup_id, task_id, channel, content, actor_id, dedupe_key, external_post_id, created_at";
const PROPOSAL_COLUMNS: &str = "id, foundup_id, proposer_id, amount, reason, status, approvals, required_approvals, execution_ref, created_at, executed_at";
const EVENT_COLUMNS: &str =
    "id, event_type, actor_id, payload, foundup_id, task_id, proof_id, payout_id, created_at";

fn json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_col<T: FromStr<Err = MarketError>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn amount_col(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn sql_amount(value: u64) -> Result<i64, MarketError> {
    i64::try_from(value)
        .map_err(|_| MarketError::ValidationError(format!("amount {} exceeds storage range", value)))
}

fn foundup_from_row(row: &Row) -> rusqlite::Result<Foundup> {
    Ok(Foundup {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        token_symbol: row.get(3)?,
        immutable_metadata: json_col(row, 4)?,
        mutable_metadata: json_col(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        foundup_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        acceptance_criteria: row.get(4)?,
        reward_amount: amount_col(row, 5)?,
        creator_id: row.get(6)?,
        status: parsed_col(row, 7)?,
        assignee_id: row.get(8)?,
        proof_id: row.get(9)?,
        verification_id: row.get(10)?,
        payout_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn distribution_from_row(row: &Row) -> rusqlite::Result<DistributionPost> {
    Ok(DistributionPost {
        id: row.get(0)?,
        foundup_id: row.get(1)?,
        task_id: row.get(2)?,
        channel: row.get(3)?,
        content: row.get(4)?,
        actor_id: row.get(5)?,
        dedupe_key: row.get(6)?,
        external_post_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn proposal_from_row(row: &Row) -> rusqlite::Result<TreasuryProposal> {
    Ok(TreasuryProposal {
        id: row.get(0)?,
        foundup_id: row.get(1)?,
        proposer_id: row.get(2)?,
        amount: amount_col(row, 3)?,
        reason: row.get(4)?,
        status: parsed_col(row, 5)?,
        approvals: json_col(row, 6)?,
        required_approvals: row.get(7)?,
        execution_ref: row.get(8)?,
        created_at: row.get(9)?,
        executed_at: row.get(10)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        event_type: row.get(1)?,
        actor_id: row.get(2)?,
        payload: json_col(row, 3)?,
        foundup_id: row.get(4)?,
        task_id: row.get(5)?,
        proof_id: row.get(6)?,
        payout_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn insert_event(conn: &Connection, ev: &EventRecord) -> Result<(), MarketError> {
    conn.execute(
        "INSERT INTO events(id, event_type, actor_id, payload, foundup_id, task_id, proof_id, payout_id, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            ev.id,
            ev.event_type,
            ev.actor_id,
            serde_json::to_string(&ev.payload)?,
            ev.foundup_id,
            ev.task_id,
            ev.proof_id,
            ev.payout_id,
            ev.created_at
        ],
    )?;
    Ok(())
}

fn load_foundup(conn: &Connection, id: &str) -> Result<Foundup, MarketError> {
    conn.query_row(
        &format!("SELECT {} FROM foundups WHERE id = ?1", FOUNDUP_COLUMNS),
        [id],
        foundup_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("foundup", id))
}

fn require_foundup(conn: &Connection, id: &str) -> Result<(), MarketError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM foundups WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    exists.map(|_| ()).ok_or_else(|| not_found("foundup", id))
}

fn load_task(conn: &Connection, id: &str) -> Result<Task, MarketError> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        [id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("task", id))
}

fn load_proposal(conn: &Connection, id: &str) -> Result<TreasuryProposal, MarketError> {
    conn.query_row(
        &format!("SELECT {} FROM treasury_proposals WHERE id = ?1", PROPOSAL_COLUMNS),
        [id],
        proposal_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("proposal", id))
}

fn load_distribution(
    conn: &Connection,
    task_id: &str,
    channel: &str,
) -> Result<Option<DistributionPost>, MarketError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM distribution_posts WHERE task_id = ?1 AND channel = ?2",
                DISTRIBUTION_COLUMNS
            ),
            [task_id, channel],
            distribution_from_row,
        )
        .optional()?)
}

fn load_treasury(conn: &Connection, foundup_id: &str) -> Result<TreasuryState, MarketError> {
    let state = conn
        .query_row(
            "SELECT foundup_id, balance, pending_outflows, total_inflows, total_outflows, updated_at
             FROM treasury_states WHERE foundup_id = ?1",
            [foundup_id],
            |row| {
                Ok(TreasuryState {
                    foundup_id: row.get(0)?,
                    balance: amount_col(row, 1)?,
                    pending_outflows: amount_col(row, 2)?,
                    total_inflows: amount_col(row, 3)?,
                    total_outflows: amount_col(row, 4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(state.unwrap_or_else(|| TreasuryState::empty(foundup_id)))
}

fn write_treasury(conn: &Connection, state: &TreasuryState) -> Result<(), MarketError> {
    conn.execute(
        "INSERT INTO treasury_states(foundup_id, balance, pending_outflows, total_inflows, total_outflows, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(foundup_id) DO UPDATE SET
            balance = excluded.balance,
            pending_outflows = excluded.pending_outflows,
            total_inflows = excluded.total_inflows,
            total_outflows = excluded.total_outflows,
            updated_at = excluded.updated_at",
        params![
            state.foundup_id,
            sql_amount(state.balance)?,
            sql_amount(state.pending_outflows)?,
            sql_amount(state.total_inflows)?,
            sql_amount(state.total_outflows)?,
            state.updated_at
        ],
    )?;
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn require_absent(conn: &Connection, table: &str, kind: &str, id: &str) -> Result<(), MarketError> {
    if id.is_empty() {
        return Err(MarketError::ValidationError(format!("{} id must be set", kind)));
    }
    let exists: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", table),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(MarketError::ValidationError(format!(
            "{} {} already exists",
            kind, id
        )));
    }
    Ok(())
}

fn insert_verification(conn: &Connection, v: &Verification) -> Result<(), MarketError> {
    require_absent(conn, "verifications", "verification", &v.id)?;
    conn.execute(
        "INSERT INTO verifications(id, task_id, verifier_id, approved, reason, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![v.id, v.task_id, v.verifier_id, v.approved, v.reason, v.created_at],
    )?;
    Ok(())
}

fn insert_link(conn: &Connection, link: &TransitionLink) -> Result<(), MarketError> {
    match link {
        TransitionLink::None => {}
        TransitionLink::Proof(p) => {
            require_absent(conn, "proofs", "proof", &p.id)?;
            conn.execute(
                "INSERT INTO proofs(id, task_id, submitter_id, artifact_uri, artifact_hash, notes, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    p.id,
                    p.task_id,
                    p.submitter_id,
                    p.artifact_uri,
                    p.artifact_hash,
                    p.notes,
                    p.created_at
                ],
            )?;
        }
        TransitionLink::Verification(v) => insert_verification(conn, v)?,
        TransitionLink::Payout(p) => {
            require_absent(conn, "payouts", "payout", &p.id)?;
            conn.execute(
                "INSERT INTO payouts(id, task_id, recipient_id, amount, status, reference, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    p.id,
                    p.task_id,
                    p.recipient_id,
                    sql_amount(p.amount)?,
                    p.status.as_str(),
                    p.reference,
                    p.created_at
                ],
            )?;
        }
    }
    Ok(())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens (or creates) a WAL database file and applies pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MarketError> {
        let path = path.as_ref();
        let mut conn = db::db_connect(path)?;
        let report = migration::migrate(&mut conn, None)?;
        tracing::debug!(path = %path.display(), applied = ?report.applied, "opened sqlite store");
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a database file without touching its schema; `migrate` does the rest.
    pub fn open_unmigrated(path: impl AsRef<Path>) -> Result<Self, MarketError> {
        let path = path.as_ref();
        Ok(SqliteStore {
            conn: Mutex::new(db::db_connect(path)?),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self, MarketError> {
        let mut conn = db::db_connect_in_memory()?;
        migration::migrate(&mut conn, None)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-runs the migration list; a no-op once everything is applied.
    pub fn migrate(&self, target: Option<u32>) -> Result<MigrationReport, MarketError> {
        let mut conn = self.lock()?;
        migration::migrate(&mut conn, target)
    }

    pub fn schema_version(&self) -> Result<u32, MarketError> {
        let conn = self.lock()?;
        migration::current_version(&conn)
    }

    pub fn journal_mode(&self) -> Result<String, MarketError> {
        let conn = self.lock()?;
        db::journal_mode(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MarketError> {
        self.conn
            .lock()
            .map_err(|_| MarketError::StorageError("sqlite connection lock poisoned".to_string()))
    }

    fn with_read<F, R>(&self, f: F) -> Result<R, MarketError>
    where
        F: FnOnce(&Connection) -> Result<R, MarketError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` in one `BEGIN IMMEDIATE` transaction; any error rolls everything back.
    /// Writers from other connections queue on the busy timeout instead of failing.
    fn with_write<F, R>(&self, f: F) -> Result<R, MarketError>
    where
        F: FnOnce(&Transaction) -> Result<R, MarketError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl MarketStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn next_id(&self, kind: IdKind) -> String {
        time::prefixed_ulid(kind.prefix())
    }

    fn create_foundup(&self, foundup: &Foundup, event: &EventRecord) -> Result<Foundup, MarketError> {
        foundup.validate()?;
        self.with_write(|tx| {
            require_absent(tx, "foundups", "foundup", &foundup.id)?;
            let taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM foundups WHERE token_symbol = ?1 COLLATE NOCASE",
                    [&foundup.token_symbol],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(store::duplicate_symbol(&foundup.token_symbol));
            }
            tx.execute(
                &format!(
                    "INSERT INTO foundups({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    FOUNDUP_COLUMNS
                ),
                params![
                    foundup.id,
                    foundup.name,
                    foundup.owner_id,
                    foundup.token_symbol,
                    serde_json::to_string(&foundup.immutable_metadata)?,
                    serde_json::to_string(&foundup.mutable_metadata)?,
                    foundup.created_at,
                    foundup.updated_at
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    store::duplicate_symbol(&foundup.token_symbol)
                } else {
                    MarketError::RusqliteError(e)
                }
            })?;
            insert_event(tx, event)?;
            Ok(foundup.clone())
        })
    }

    fn get_foundup(&self, id: &str) -> Result<Foundup, MarketError> {
        self.with_read(|conn| load_foundup(conn, id))
    }

    fn list_foundups(&self) -> Result<Vec<Foundup>, MarketError> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM foundups ORDER BY rowid ASC",
                FOUNDUP_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], foundup_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn update_foundup_metadata(
        &self,
        id: &str,
        patch: &MetadataPatch,
        event: &EventRecord,
    ) -> Result<Foundup, MarketError> {
        self.with_write(|tx| {
            let updated = load_foundup(tx, id)?.apply_patch(patch, &event.created_at)?;
            tx.execute(
                "UPDATE foundups SET immutable_metadata = ?1, mutable_metadata = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    serde_json::to_string(&updated.immutable_metadata)?,
                    serde_json::to_string(&updated.mutable_metadata)?,
                    updated.updated_at,
                    id
                ],
            )?;
            insert_event(tx, event)?;
            Ok(updated)
        })
    }

    fn create_task(&self, task: &Task, event: &EventRecord) -> Result<Task, MarketError> {
        task.validate()?;
        self.with_write(|tx| {
            require_foundup(tx, &task.foundup_id)?;
            require_absent(tx, "tasks", "task", &task.id)?;
            tx.execute(
                &format!(
                    "INSERT INTO tasks({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    TASK_COLUMNS
                ),
                params![
                    task.id,
                    task.foundup_id,
                    task.title,
                    task.description,
                    task.acceptance_criteria,
                    sql_amount(task.reward_amount)?,
                    task.creator_id,
                    task.status.as_str(),
                    task.assignee_id,
                    task.proof_id,
                    task.verification_id,
                    task.payout_id,
                    task.created_at,
                    task.updated_at
                ],
            )?;
            insert_event(tx, event)?;
            Ok(task.clone())
        })
    }

    fn get_task(&self, id: &str) -> Result<Task, MarketError> {
        self.with_read(|conn| load_task(conn, id))
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, MarketError> {
        let mut sql = format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS);
        let mut values: Vec<String> = Vec::new();
        if let Some(foundup_id) = &filter.foundup_id {
            values.push(foundup_id.clone());
            sql.push_str(&format!(" AND foundup_id = ?{}", values.len()));
        }
        if let Some(status) = &filter.status {
            values.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(assignee_id) = &filter.assignee_id {
            values.push(assignee_id.clone());
            sql.push_str(&format!(" AND assignee_id = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY rowid ASC");

        self.with_read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn apply_transition(
        &self,
        transition: &TaskTransition,
        event: &EventRecord,
    ) -> Result<Task, MarketError> {
        self.with_write(|tx| {
            let current = load_task(tx, &transition.task_id)?;
            let next = transition.apply_to(&current)?;
            insert_link(tx, &transition.link)?;
            let changed = tx.execute(
                "UPDATE tasks
                 SET status = ?1, assignee_id = ?2, proof_id = ?3, verification_id = ?4,
                     payout_id = ?5, updated_at = ?6
                 WHERE id = ?7 AND status = ?8",
                params![
                    next.status.as_str(),
                    next.assignee_id,
                    next.proof_id,
                    next.verification_id,
                    next.payout_id,
                    next.updated_at,
                    next.id,
                    transition.expected.as_str()
                ],
            )?;
            if changed != 1 {
                return Err(MarketError::InvalidStateTransition(format!(
                    "task {} is no longer {}",
                    transition.task_id, transition.expected
                )));
            }
            insert_event(tx, event)?;
            Ok(next)
        })
    }

    fn record_rejection(
        &self,
        verification: &Verification,
        event: &EventRecord,
    ) -> Result<Verification, MarketError> {
        self.with_write(|tx| {
            let task = load_task(tx, &verification.task_id)?;
            store::require_pending_rejection(&task, verification)?;
            insert_verification(tx, verification)?;
            insert_event(tx, event)?;
            Ok(verification.clone())
        })
    }

    fn get_proof(&self, id: &str) -> Result<Proof, MarketError> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT id, task_id, submitter_id, artifact_uri, artifact_hash, notes, created_at
                 FROM proofs WHERE id = ?1",
                [id],
                |row| {
                    Ok(Proof {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        submitter_id: row.get(2)?,
                        artifact_uri: row.get(3)?,
                        artifact_hash: row.get(4)?,
                        notes: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| not_found("proof", id))
        })
    }

    fn get_verification(&self, id: &str) -> Result<Verification, MarketError> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT id, task_id, verifier_id, approved, reason, created_at
                 FROM verifications WHERE id = ?1",
                [id],
                |row| {
                    Ok(Verification {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        verifier_id: row.get(2)?,
                        approved: row.get(3)?,
                        reason: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| not_found("verification", id))
        })
    }

    fn get_payout(&self, id: &str) -> Result<Payout, MarketError> {
        self.with_read(|conn| {
            conn.query_row(
                "SELECT id, task_id, recipient_id, amount, status, reference, created_at
                 FROM payouts WHERE id = ?1",
                [id],
                |row| {
                    Ok(Payout {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        recipient_id: row.get(2)?,
                        amount: amount_col(row, 3)?,
                        status: parsed_col(row, 4)?,
                        reference: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| not_found("payout", id))
        })
    }

    fn find_distribution(
        &self,
        task_id: &str,
        channel: &str,
    ) -> Result<Option<DistributionPost>, MarketError> {
        self.with_read(|conn| load_distribution(conn, task_id, channel))
    }

    fn claim_distribution(
        &self,
        post: &DistributionPost,
    ) -> Result<DistributionClaim, MarketError> {
        self.with_write(|tx| {
            if let Some(existing) = load_distribution(tx, &post.task_id, &post.channel)? {
                return Ok(DistributionClaim::Existing(existing));
            }
            load_task(tx, &post.task_id)?;
            require_absent(tx, "distribution_posts", "distribution", &post.id)?;
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO distribution_posts({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(task_id, channel) DO NOTHING",
                    DISTRIBUTION_COLUMNS
                ),
                params![
                    post.id,
                    post.foundup_id,
                    post.task_id,
                    post.channel,
                    post.content,
                    post.actor_id,
                    post.dedupe_key,
                    post.external_post_id,
                    post.created_at
                ],
            )?;
            if inserted == 0 {
                return load_distribution(tx, &post.task_id, &post.channel)?
                    .map(DistributionClaim::Existing)
                    .ok_or_else(|| not_found("distribution", &post.dedupe_key));
            }
            Ok(DistributionClaim::Claimed(post.clone()))
        })
    }

    fn complete_distribution(
        &self,
        post_id: &str,
        external_post_id: Option<&str>,
        event: &EventRecord,
    ) -> Result<DistributionPost, MarketError> {
        self.with_write(|tx| {
            let updated = tx.execute(
                "UPDATE distribution_posts SET external_post_id = ?2 WHERE id = ?1",
                params![post_id, external_post_id],
            )?;
            if updated != 1 {
                return Err(not_found("distribution", post_id));
            }
            insert_event(tx, event)?;
            tx.query_row(
                &format!(
                    "SELECT {} FROM distribution_posts WHERE id = ?1",
                    DISTRIBUTION_COLUMNS
                ),
                [post_id],
                distribution_from_row,
            )
            .map_err(MarketError::from)
        })
    }

    fn release_distribution(&self, post_id: &str) -> Result<(), MarketError> {
        self.with_write(|tx| {
            let deleted = tx.execute("DELETE FROM distribution_posts WHERE id = ?1", [post_id])?;
            if deleted != 1 {
                return Err(not_found("distribution", post_id));
            }
            Ok(())
        })
    }

    fn list_distributions(&self, task_id: &str) -> Result<Vec<DistributionPost>, MarketError> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM distribution_posts WHERE task_id = ?1 ORDER BY rowid ASC",
                DISTRIBUTION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([task_id], distribution_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn record_cabr_score(
        &self,
        score: &CabrScore,
        event: &EventRecord,
    ) -> Result<CabrScore, MarketError> {
        self.with_write(|tx| {
            require_foundup(tx, &score.foundup_id)?;
            require_absent(tx, "cabr_scores", "cabr score", &score.id)?;
            tx.execute(
                "INSERT INTO cabr_scores(id, foundup_id, score, payload, recorded_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    score.id,
                    score.foundup_id,
                    score.score,
                    serde_json::to_string(&score.payload)?,
                    score.recorded_at
                ],
            )?;
            insert_event(tx, event)?;
            Ok(score.clone())
        })
    }

    fn latest_cabr_score(&self, foundup_id: &str) -> Result<Option<CabrScore>, MarketError> {
        self.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, foundup_id, score, payload, recorded_at FROM cabr_scores
                     WHERE foundup_id = ?1 ORDER BY seq DESC LIMIT 1",
                    [foundup_id],
                    |row| {
                        Ok(CabrScore {
                            id: row.get(0)?,
                            foundup_id: row.get(1)?,
                            score: row.get(2)?,
                            payload: json_col(row, 3)?,
                            recorded_at: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn treasury_state(&self, foundup_id: &str) -> Result<TreasuryState, MarketError> {
        self.with_read(|conn| {
            require_foundup(conn, foundup_id)?;
            load_treasury(conn, foundup_id)
        })
    }

    fn deposit(
        &self,
        foundup_id: &str,
        amount: u64,
        event: &EventRecord,
    ) -> Result<TreasuryState, MarketError> {
        self.with_write(|tx| {
            require_foundup(tx, foundup_id)?;
            let next = load_treasury(tx, foundup_id)?.credited(amount, &event.created_at)?;
            write_treasury(tx, &next)?;
            insert_event(tx, &event.with_resulting_balance(next.balance))?;
            Ok(next)
        })
    }

    fn create_proposal(
        &self,
        proposal: &TreasuryProposal,
        event: &EventRecord,
    ) -> Result<TreasuryProposal, MarketError> {
        self.with_write(|tx| {
            require_foundup(tx, &proposal.foundup_id)?;
            require_absent(tx, "treasury_proposals", "proposal", &proposal.id)?;
            let next = load_treasury(tx, &proposal.foundup_id)?
                .reserved(proposal.amount, &event.created_at)?;
            tx.execute(
                &format!(
                    "INSERT INTO treasury_proposals({}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    PROPOSAL_COLUMNS
                ),
                params![
                    proposal.id,
                    proposal.foundup_id,
                    proposal.proposer_id,
                    sql_amount(proposal.amount)?,
                    proposal.reason,
                    proposal.status.as_str(),
                    serde_json::to_string(&proposal.approvals)?,
                    proposal.required_approvals,
                    proposal.execution_ref,
                    proposal.created_at,
                    proposal.executed_at
                ],
            )?;
            write_treasury(tx, &next)?;
            insert_event(tx, event)?;
            Ok(proposal.clone())
        })
    }

    fn get_proposal(&self, id: &str) -> Result<TreasuryProposal, MarketError> {
        self.with_read(|conn| load_proposal(conn, id))
    }

    fn list_proposals(&self, foundup_id: &str) -> Result<Vec<TreasuryProposal>, MarketError> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM treasury_proposals WHERE foundup_id = ?1 ORDER BY rowid ASC",
                PROPOSAL_COLUMNS
            ))?;
            let rows = stmt
                .query_map([foundup_id], proposal_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn update_proposal(
        &self,
        proposal: &TreasuryProposal,
        expected_status: ProposalStatus,
        expected_approvals: usize,
        event: &EventRecord,
    ) -> Result<TreasuryProposal, MarketError> {
        self.with_write(|tx| {
            let current = load_proposal(tx, &proposal.id)?;
            store::check_proposal_cas(&current, expected_status, expected_approvals)?;
            let changed = tx.execute(
                "UPDATE treasury_proposals
                 SET status = ?1, approvals = ?2, execution_ref = ?3, executed_at = ?4
                 WHERE id = ?5 AND status = ?6",
                params![
                    proposal.status.as_str(),
                    serde_json::to_string(&proposal.approvals)?,
                    proposal.execution_ref,
                    proposal.executed_at,
                    proposal.id,
                    expected_status.as_str()
                ],
            )?;
            if changed != 1 {
                return Err(MarketError::InvalidStateTransition(format!(
                    "proposal {} is no longer {}",
                    proposal.id, expected_status
                )));
            }
            insert_event(tx, event)?;
            Ok(proposal.clone())
        })
    }

    fn execute_proposal(
        &self,
        id: &str,
        execution_ref: &str,
        executed_at: &str,
        event: &EventRecord,
    ) -> Result<(TreasuryProposal, TreasuryState), MarketError> {
        self.with_write(|tx| {
            let current = load_proposal(tx, id)?;
            store::require_approved(&current)?;
            let next_state =
                load_treasury(tx, &current.foundup_id)?.debited(current.amount, executed_at)?;
            let changed = tx.execute(
                "UPDATE treasury_proposals SET status = ?1, execution_ref = ?2, executed_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    ProposalStatus::Executed.as_str(),
                    execution_ref,
                    executed_at,
                    id,
                    ProposalStatus::Approved.as_str()
                ],
            )?;
            if changed != 1 {
                return Err(MarketError::InvalidStateTransition(format!(
                    "proposal {} is no longer approved",
                    id
                )));
            }
            write_treasury(tx, &next_state)?;
            insert_event(tx, &event.with_resulting_balance(next_state.balance))?;
            let executed = TreasuryProposal {
                status: ProposalStatus::Executed,
                execution_ref: Some(execution_ref.to_string()),
                executed_at: Some(executed_at.to_string()),
                ..current
            };
            Ok((executed, next_state))
        })
    }

    fn append_event(&self, event: &EventRecord) -> Result<(), MarketError> {
        self.with_write(|tx| insert_event(tx, event))
    }

    fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, MarketError> {
        let mut sql = format!("SELECT {} FROM events WHERE 1 = 1", EVENT_COLUMNS);
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(foundup_id) = &filter.foundup_id {
            values.push(Box::new(foundup_id.clone()));
            sql.push_str(&format!(" AND foundup_id = ?{}", values.len()));
        }
        if let Some(task_id) = &filter.task_id {
            values.push(Box::new(task_id.clone()));
            sql.push_str(&format!(" AND task_id = ?{}", values.len()));
        }
        if let Some(event_type) = &filter.event_type {
            values.push(Box::new(event_type.clone()));
            sql.push_str(&format!(" AND event_type = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            values.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        self.with_read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), event_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
