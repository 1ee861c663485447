//! SQLite-backed persistence for flows, recipients, runs, audit events and
//! the queue-job view.
//!
//! Run rows are written with optimistic concurrency: every write bumps
//! `version`, and the executor only mutates a run it has claimed at a known
//! version. A claim also leases the row (`claimed_until`) so no other tick
//! or worker can pick it up until the claimant commits or the lease lapses.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use flowpost_core::{
    ContentResolver, FlowpostError, Recipient, RecipientStore, Result, SenderIdentity,
    SenderResolver,
};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::graph::{Flow, FlowDocument, FlowStore};
use crate::runs::{
    EventKind, JobStatus, NewEvent, QueueJob, Run, RunEvent, RunStatus, fmt_ts, parse_ts,
};

/// SQLite store for all scheduler state.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

const RUN_COLUMNS: &str = "id, owner_id, flow_id, recipient_id, status, current_node_id, \
     available_at, last_error, created_at, updated_at, version";

/// How long a claimed run stays invisible to other ticks and workers.
pub const RUN_LEASE_SECS: i64 = 300;

const JOB_COLUMNS: &str =
    "id, owner_id, flow_id, recipient_id, next_node_id, run_at, status, created_at, updated_at";

fn db_err(e: rusqlite::Error) -> FlowpostError {
    FlowpostError::Database(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.trim().as_bytes()))
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(4)?;
    let available_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Run {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        flow_id: row.get(2)?,
        recipient_id: row.get(3)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        current_node_id: row.get(5)?,
        available_at: available_at.as_deref().and_then(parse_ts),
        last_error: row.get(7)?,
        created_at: parse_ts(&created_at).unwrap_or_default(),
        updated_at: parse_ts(&updated_at).unwrap_or_default(),
        version: row.get(10)?,
    })
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueJob> {
    let run_at: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(QueueJob {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        flow_id: row.get(2)?,
        recipient_id: row.get(3)?,
        next_node_id: row.get(4)?,
        run_at: parse_ts(&run_at).unwrap_or_default(),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        created_at: parse_ts(&created_at).unwrap_or_default(),
        updated_at: parse_ts(&updated_at).unwrap_or_default(),
    })
}

fn insert_events(
    conn: &Connection,
    run_id: &str,
    events: &[NewEvent],
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let at = fmt_ts(now);
    for ev in events {
        conn.execute(
            "INSERT INTO run_events (run_id, node_id, kind, detail, at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, ev.node_id, ev.kind.as_str(), ev.detail, at],
        )?;
    }
    Ok(())
}

/// Node/status bucket from [`SchedulerDb::node_counts`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCount {
    pub node_id: Option<String>,
    pub status: RunStatus,
    pub count: usize,
}

/// Rows removed by [`SchedulerDb::reset_flow`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResetCounts {
    pub runs: usize,
    pub jobs: usize,
    pub events: usize,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowpostError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            -- Authored flow graphs (raw node/edge JSON)
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                nodes TEXT NOT NULL DEFAULT '[]',
                edges TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flows_owner ON flows(owner_id);

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                email TEXT,
                name TEXT,
                updated_at TEXT NOT NULL
            );

            -- Default From identity per owner account
            CREATE TABLE IF NOT EXISTS senders (
                owner_id TEXT PRIMARY KEY,
                from_email TEXT NOT NULL,
                from_name TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            -- Referenced email bodies (htmlRef)
            CREATE TABLE IF NOT EXISTS email_content (
                owner_id TEXT NOT NULL,
                ref TEXT NOT NULL,
                html TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (owner_id, ref)
            );

            -- Owner API credentials, stored as SHA-256 hex
            CREATE TABLE IF NOT EXISTS owner_tokens (
                token_hash TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',   -- active, done, failed
                current_node_id TEXT,
                available_at TEXT,
                last_error TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                claimed_until TEXT,                      -- step lease, NULL when free
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
                ON runs(flow_id, recipient_id, owner_id) WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_runs_ready ON runs(flow_id, status, updated_at);

            CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                node_id TEXT,
                kind TEXT NOT NULL,
                detail TEXT,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);

            CREATE TABLE IF NOT EXISTS queue_jobs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                next_node_id TEXT NOT NULL,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, running, done, failed
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_pending
                ON queue_jobs(flow_id, recipient_id, next_node_id) WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON queue_jobs(status, run_at);
            ",
        )
        .map_err(|e| FlowpostError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Flows ────────────────────────────────────────────────

    /// Insert or replace a flow. The document is validated first.
    pub fn upsert_flow(&self, doc: &FlowDocument, now: DateTime<Utc>) -> Result<Flow> {
        let flow = doc.normalize()?;
        let nodes = serde_json::to_string(&doc.nodes)?;
        let edges = serde_json::to_string(&doc.edges)?;
        let ts = fmt_ts(now);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO flows (id, owner_id, name, nodes, edges, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                nodes = excluded.nodes,
                edges = excluded.edges,
                updated_at = excluded.updated_at",
            params![doc.id, doc.owner_id, doc.name, nodes, edges, ts],
        )
        .map_err(db_err)?;
        Ok(flow)
    }

    pub fn get_flow_document(&self, flow_id: &str) -> Result<Option<FlowDocument>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, owner_id, name, nodes, edges FROM flows WHERE id = ?1",
                params![flow_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((id, owner_id, name, nodes, edges)) = row else {
            return Ok(None);
        };
        Ok(Some(FlowDocument {
            id,
            owner_id,
            name,
            nodes: serde_json::from_str(&nodes)?,
            edges: serde_json::from_str(&edges)?,
        }))
    }

    fn flow_ids_for_owner(&self, owner_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM flows WHERE owner_id = ?1 ORDER BY created_at ASC, id ASC")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![owner_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    // ─── Recipients, senders, content, tokens ─────────────────

    pub fn upsert_recipient(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recipients (id, owner_id, email, name, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                email = excluded.email,
                name = excluded.name,
                updated_at = excluded.updated_at",
            params![
                recipient.id,
                recipient.owner_id,
                recipient.email,
                recipient.name,
                fmt_ts(now)
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn set_sender(&self, owner_id: &str, sender: &SenderIdentity, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO senders (owner_id, from_email, from_name, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner_id, sender.from_email, sender.from_name, fmt_ts(now)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn put_content(&self, owner_id: &str, html_ref: &str, html: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO email_content (owner_id, ref, html, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner_id, html_ref, html, fmt_ts(now)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Issue a new owner credential. Only its digest is stored.
    pub fn issue_owner_token(&self, owner_id: &str, label: &str, now: DateTime<Utc>) -> Result<String> {
        let token = format!("fpk_{}", uuid::Uuid::new_v4().simple());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO owner_tokens (token_hash, owner_id, label, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![hash_token(&token), owner_id, label, fmt_ts(now)],
        )
        .map_err(db_err)?;
        Ok(token)
    }

    pub fn owner_for_token(&self, token: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT owner_id FROM owner_tokens WHERE token_hash = ?1",
            params![hash_token(token)],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(db_err)
    }

    // ─── Runs ─────────────────────────────────────────────────

    /// Insert a new run with an `entered` audit entry. Returns `false` when an
    /// active run already occupies the (flow, recipient, owner) slot.
    pub fn create_run(&self, run: &Run) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let inserted = tx.execute(
            &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                run.id,
                run.owner_id,
                run.flow_id,
                run.recipient_id,
                run.status.as_str(),
                run.current_node_id,
                run.available_at.map(fmt_ts),
                run.last_error,
                fmt_ts(run.created_at),
                fmt_ts(run.updated_at),
                run.version,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(false),
            Err(e) => return Err(db_err(e)),
        }
        insert_events(
            &tx,
            &run.id,
            &[NewEvent::new(EventKind::Entered, None, None)],
            run.created_at,
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![run_id],
            run_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn find_active_run(&self, flow_id: &str, recipient_id: &str, owner_id: &str) -> Result<Option<Run>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE flow_id = ?1 AND recipient_id = ?2 AND owner_id = ?3 AND status = 'active'"
            ),
            params![flow_id, recipient_id, owner_id],
            run_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Active runs of a flow that are due, oldest update first.
    pub fn ready_runs(&self, flow_id: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE flow_id = ?1 AND status = 'active'
                   AND (available_at IS NULL OR available_at <= ?2)
                   AND (claimed_until IS NULL OR claimed_until <= ?2)
                 ORDER BY updated_at ASC, id ASC
                 LIMIT ?3"
            ))
            .map_err(db_err)?;
        let runs = stmt
            .query_map(params![flow_id, fmt_ts(now), limit as i64], run_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(runs)
    }

    /// Runs of a flow, optionally filtered by status, oldest update first.
    pub fn list_runs(&self, flow_id: &str, status: Option<RunStatus>, limit: usize) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE flow_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY updated_at ASC, id ASC
                 LIMIT ?3"
            ))
            .map_err(db_err)?;
        let runs = stmt
            .query_map(
                params![flow_id, status.map(|s| s.as_str()), limit as i64],
                run_from_row,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(runs)
    }

    /// Flow ids with at least one due run, most stalled first.
    pub fn flows_with_ready_runs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT flow_id FROM runs
                 WHERE status = 'active' AND (available_at IS NULL OR available_at <= ?1)
                   AND (claimed_until IS NULL OR claimed_until <= ?1)
                 GROUP BY flow_id
                 ORDER BY MIN(updated_at) ASC
                 LIMIT ?2",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![fmt_ts(now), limit as i64], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Take ownership of an active run at `version` and lease it for
    /// [`RUN_LEASE_SECS`]. A `false` result means another writer got there
    /// first or still holds the lease.
    pub fn claim_run(&self, run_id: &str, version: i64, now: DateTime<Utc>) -> Result<bool> {
        let lease = now + chrono::Duration::seconds(RUN_LEASE_SECS);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET version = version + 1, updated_at = ?3, claimed_until = ?4
                 WHERE id = ?1 AND version = ?2 AND status = 'active'
                   AND (claimed_until IS NULL OR claimed_until <= ?3)",
                params![run_id, version, fmt_ts(now), fmt_ts(lease)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Write a claimed run's new state and its audit entries atomically.
    /// Returns `false` if the row moved past `claimed_version` meanwhile.
    pub fn commit_run(
        &self,
        run: &Run,
        claimed_version: i64,
        events: &[NewEvent],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE runs SET status = ?1, current_node_id = ?2, available_at = ?3,
                    last_error = ?4, updated_at = ?5, version = version + 1,
                    claimed_until = NULL
                 WHERE id = ?6 AND version = ?7",
                params![
                    run.status.as_str(),
                    run.current_node_id,
                    run.available_at.map(fmt_ts),
                    run.last_error,
                    fmt_ts(now),
                    run.id,
                    claimed_version,
                ],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Ok(false);
        }
        insert_events(&tx, &run.id, events, now).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Unconditionally fail an active run (used when processing blew up).
    pub fn force_fail_run(&self, run_id: &str, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE runs SET status = 'failed', last_error = ?2, updated_at = ?3,
                    version = version + 1, claimed_until = NULL
                 WHERE id = ?1 AND status = 'active'",
                params![run_id, error, fmt_ts(now)],
            )
            .map_err(db_err)?;
        if changed == 1 {
            insert_events(
                &tx,
                run_id,
                &[NewEvent::new(EventKind::Failed, None, Some(error.to_string()))],
                now,
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(changed == 1)
    }

    pub fn run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, node_id, kind, detail, at FROM run_events
                 WHERE run_id = ?1 ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let events = stmt
            .query_map(params![run_id], |row| {
                Ok(RunEvent {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    node_id: row.get(2)?,
                    kind: row.get(3)?,
                    detail: row.get(4)?,
                    at: row.get(5)?,
                })
            })
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    // ─── Operator writes ──────────────────────────────────────

    /// Ids of failed runs matching every given filter.
    pub fn failed_run_ids(
        &self,
        run_id: Option<&str>,
        flow_id: Option<&str>,
        recipient_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM runs
                 WHERE status = 'failed'
                   AND (?1 IS NULL OR id = ?1)
                   AND (?2 IS NULL OR flow_id = ?2)
                   AND (?3 IS NULL OR recipient_id = ?3)
                 ORDER BY updated_at ASC",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![run_id, flow_id, recipient_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Put a failed run back to active, due now. `false` if it is no longer
    /// failed or a newer active run holds its slot.
    pub fn requeue_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let ts = fmt_ts(now);
        let changed = match tx.execute(
            "UPDATE runs SET status = 'active', last_error = NULL, available_at = ?2,
                updated_at = ?2, version = version + 1, claimed_until = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![run_id, ts],
        ) {
            Ok(n) => n,
            Err(e) if is_unique_violation(&e) => return Ok(false),
            Err(e) => return Err(db_err(e)),
        };
        if changed == 1 {
            insert_events(&tx, run_id, &[NewEvent::new(EventKind::Requeued, None, None)], now)
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Make every active run (and pending job) of a flow due now.
    pub fn kick_flow(&self, flow_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let ts = fmt_ts(now);
        let conn = self.lock()?;
        let runs = conn
            .execute(
                "UPDATE runs SET available_at = ?2, updated_at = ?2, version = version + 1
                 WHERE flow_id = ?1 AND status = 'active'",
                params![flow_id, ts],
            )
            .map_err(db_err)?;
        conn.execute(
            "UPDATE queue_jobs SET run_at = ?2, updated_at = ?2
             WHERE flow_id = ?1 AND status = 'pending'",
            params![flow_id, ts],
        )
        .map_err(db_err)?;
        Ok(runs)
    }

    /// Terminate an active run and drop its pending jobs.
    pub fn cancel_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let ts = fmt_ts(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE runs SET status = 'done', last_error = 'CANCELLED', updated_at = ?2,
                    version = version + 1
                 WHERE id = ?1 AND status = 'active'",
                params![run_id, ts],
            )
            .map_err(db_err)?;
        if changed == 1 {
            tx.execute(
                "UPDATE queue_jobs SET status = 'done', updated_at = ?2
                 WHERE status = 'pending' AND (flow_id, recipient_id) =
                    (SELECT flow_id, recipient_id FROM runs WHERE id = ?1)",
                params![run_id, ts],
            )
            .map_err(db_err)?;
            insert_events(&tx, run_id, &[NewEvent::new(EventKind::Cancelled, None, None)], now)
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Delete every run, job and audit entry of a flow.
    pub fn reset_flow(&self, flow_id: &str) -> Result<ResetCounts> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let events = tx
            .execute(
                "DELETE FROM run_events WHERE run_id IN (SELECT id FROM runs WHERE flow_id = ?1)",
                params![flow_id],
            )
            .map_err(db_err)?;
        let jobs = tx
            .execute("DELETE FROM queue_jobs WHERE flow_id = ?1", params![flow_id])
            .map_err(db_err)?;
        let runs = tx
            .execute("DELETE FROM runs WHERE flow_id = ?1", params![flow_id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(ResetCounts { runs, jobs, events })
    }

    /// Run counts grouped by current node and status.
    pub fn node_counts(&self, flow_id: &str) -> Result<Vec<NodeCount>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT current_node_id, status, COUNT(*) FROM runs
                 WHERE flow_id = ?1 GROUP BY current_node_id, status",
            )
            .map_err(db_err)?;
        let counts = stmt
            .query_map(params![flow_id], |row| {
                let status: String = row.get(1)?;
                Ok(NodeCount {
                    node_id: row.get(0)?,
                    status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                    count: row.get::<_, i64>(2)? as usize,
                })
            })
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(counts)
    }

    // ─── Queue jobs ───────────────────────────────────────────

    pub fn pending_job_id(&self, flow_id: &str, recipient_id: &str, next_node_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id FROM queue_jobs
             WHERE flow_id = ?1 AND recipient_id = ?2 AND next_node_id = ?3 AND status = 'pending'",
            params![flow_id, recipient_id, next_node_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Insert a job. Returns `false` when the pending-slot unique index
    /// rejected it.
    pub fn insert_job(&self, job: &QueueJob) -> Result<bool> {
        let conn = self.lock()?;
        let res = conn.execute(
            &format!("INSERT INTO queue_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                job.id,
                job.owner_id,
                job.flow_id,
                job.recipient_id,
                job.next_node_id,
                fmt_ts(job.run_at),
                job.status.as_str(),
                fmt_ts(job.created_at),
                fmt_ts(job.updated_at),
            ],
        );
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM queue_jobs
                 WHERE status = 'pending' AND run_at <= ?1
                 ORDER BY run_at ASC, created_at ASC
                 LIMIT ?2"
            ))
            .map_err(db_err)?;
        let jobs = stmt
            .query_map(params![fmt_ts(now), limit as i64], job_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(jobs)
    }

    pub fn list_jobs(&self, flow_id: &str) -> Result<Vec<QueueJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE flow_id = ?1 ORDER BY created_at ASC"
            ))
            .map_err(db_err)?;
        let jobs = stmt
            .query_map(params![flow_id], job_from_row)
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(jobs)
    }

    /// pending → running. `false` if someone else took it.
    pub fn claim_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE queue_jobs SET status = 'running', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![job_id, fmt_ts(now)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    pub fn finish_job(&self, job_id: &str, status: JobStatus, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE queue_jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, status.as_str(), fmt_ts(now)],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl FlowStore for SchedulerDb {
    fn load_flow(&self, flow_id: &str) -> Result<Option<Flow>> {
        match self.get_flow_document(flow_id)? {
            Some(doc) => doc.normalize().map(Some),
            None => Ok(None),
        }
    }

    fn flows_for_owner(&self, owner_id: &str) -> Result<Vec<Flow>> {
        let mut flows = Vec::new();
        for id in self.flow_ids_for_owner(owner_id)? {
            match self.load_flow(&id) {
                Ok(Some(flow)) => flows.push(flow),
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Skipping flow {id}: {e}"),
            }
        }
        Ok(flows)
    }
}

impl RecipientStore for SchedulerDb {
    fn get_recipient(&self, id: &str) -> Result<Option<Recipient>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, owner_id, email, name FROM recipients WHERE id = ?1",
            params![id],
            |row| {
                Ok(Recipient {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    email: row.get(2)?,
                    name: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }
}

impl SenderResolver for SchedulerDb {
    fn sender_for(&self, owner_id: &str) -> Result<Option<SenderIdentity>> {
        let conn = self.lock()?;
        let sender = conn
            .query_row(
                "SELECT from_email, from_name FROM senders WHERE owner_id = ?1",
                params![owner_id],
                |row| {
                    Ok(SenderIdentity {
                        from_email: row.get(0)?,
                        from_name: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;
        Ok(sender.filter(|s| !s.from_email.trim().is_empty()))
    }
}

impl ContentResolver for SchedulerDb {
    fn resolve_html(&self, owner_id: &str, html_ref: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let html = conn
            .query_row(
                "SELECT html FROM email_content WHERE owner_id = ?1 AND ref = ?2",
                params![owner_id, html_ref],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(html.filter(|h| !h.trim().is_empty()))
    }
}

#[cfg(test)]
impl SchedulerDb {
    /// Raw SQL against the store, for arranging failure cases.
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql).map_err(db_err)
    }
}
