use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use chatflow_core::error::{ChatflowError, Result, StateError};
use chatflow_core::flow::{FlowDefinition, FlowStatus, FlowSummary};
use chatflow_core::state::ExecutionState;
use chatflow_core::traits::{FlowStore, StateStore};
use chatflow_core::types::{ContactId, FlowId, PairKey};

use crate::check_revision;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT NOT NULL,
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        channel_binding TEXT,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_flows_channel
        ON flows(channel_binding, status);

    CREATE TABLE IF NOT EXISTS run_states (
        flow_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        revision INTEGER NOT NULL,
        status TEXT NOT NULL,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (flow_id, contact_id)
    );

    CREATE INDEX IF NOT EXISTS idx_run_states_contact
        ON run_states(contact_id);

    CREATE TABLE IF NOT EXISTS archived_states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        status TEXT NOT NULL,
        state TEXT NOT NULL,
        closed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_archived_pair
        ON archived_states(flow_id, contact_id, id);";

fn db_err(e: impl std::fmt::Display) -> ChatflowError {
    ChatflowError::Storage(e.to_string())
}

fn status_str(status: FlowStatus) -> &'static str {
    match status {
        FlowStatus::Active => "active",
        FlowStatus::Inactive => "inactive",
    }
}

/// SQLite-backed flow catalog and run-state store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChatflowError::Storage(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL keeps readers off the writer's back
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }
}

/// Rebuild a definition from its JSON column, with the status column taking precedence.
fn decode_flow(definition: &str, status: &str) -> Result<FlowDefinition> {
    let mut flow: FlowDefinition = serde_json::from_str(definition)?;
    flow.status = if status == "active" {
        FlowStatus::Active
    } else {
        FlowStatus::Inactive
    };
    Ok(flow)
}

fn query_flow(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Option<FlowDefinition>> {
    let row: Option<(String, String)> = conn
        .query_row(sql, params, |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
        .map_err(db_err)?;
    row.map(|(def, status)| decode_flow(&def, &status)).transpose()
}

fn decode_state(json: &str) -> Result<ExecutionState> {
    serde_json::from_str(json).map_err(|e| ChatflowError::State(StateError::Corrupted(e.to_string())))
}

fn stored_revision(conn: &Connection, pair: &PairKey) -> Result<Option<u64>> {
    let rev: Option<i64> = conn
        .query_row(
            "SELECT revision FROM run_states WHERE flow_id = ?1 AND contact_id = ?2",
            params![pair.flow_id.0, pair.contact_id.0],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(rev.map(|r| r as u64))
}

/// Upsert the live row for the state's pair after the revision check.
fn write_live(conn: &Connection, state: &ExecutionState) -> Result<()> {
    let json = serde_json::to_string(state)?;
    let pair = state.pair();
    check_revision(state, stored_revision(conn, &pair)?)?;
    conn.execute(
        "INSERT INTO run_states (flow_id, contact_id, revision, status, state, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(flow_id, contact_id) DO UPDATE SET
            revision = excluded.revision,
            status = excluded.status,
            state = excluded.state,
            updated_at = excluded.updated_at",
        params![
            pair.flow_id.0,
            pair.contact_id.0,
            state.revision as i64,
            state.status.as_str(),
            json,
            state.updated_at.to_rfc3339(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Move the state's pair out of the live table into the archive.
fn write_archive(conn: &Connection, state: &ExecutionState) -> Result<()> {
    let json = serde_json::to_string(state)?;
    let pair = state.pair();
    check_revision(state, stored_revision(conn, &pair)?)?;
    conn.execute(
        "DELETE FROM run_states WHERE flow_id = ?1 AND contact_id = ?2",
        params![pair.flow_id.0, pair.contact_id.0],
    )
    .map_err(db_err)?;
    conn.execute(
        "INSERT INTO archived_states (flow_id, contact_id, status, state, closed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            pair.flow_id.0,
            pair.contact_id.0,
            state.status.as_str(),
            json,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn query_states(conn: &Connection, sql: &str, key: &str) -> Result<Vec<ExecutionState>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params![key], |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    let mut states = Vec::new();
    for row in rows {
        states.push(decode_state(&row.map_err(db_err)?)?);
    }
    Ok(states)
}

impl FlowStore for SqliteStore {
    fn create_flow(&self, mut flow: FlowDefinition) -> BoxFuture<'_, Result<FlowDefinition>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            let max: Option<i64> = tx
                .query_row(
                    "SELECT MAX(version) FROM flows WHERE id = ?1",
                    params![flow.id.0],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            flow.version = max.unwrap_or(0) as u32 + 1;
            flow.status = FlowStatus::Inactive;
            let definition = serde_json::to_string(&flow)?;
            tx.execute(
                "INSERT INTO flows (id, version, name, status, channel_binding, definition, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    flow.id.0,
                    flow.version,
                    flow.name,
                    status_str(flow.status),
                    flow.channel_binding,
                    definition,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            debug!(flow_id = %flow.id, version = flow.version, "Flow version stored");
            Ok(flow)
        })
    }

    fn get_flow(&self, id: &FlowId, version: u32) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            query_flow(
                &conn,
                "SELECT definition, status FROM flows WHERE id = ?1 AND version = ?2",
                params![id, version],
            )
        })
    }

    fn latest_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            query_flow(
                &conn,
                "SELECT definition, status FROM flows WHERE id = ?1 ORDER BY version DESC LIMIT 1",
                params![id],
            )
        })
    }

    fn active_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            query_flow(
                &conn,
                "SELECT definition, status FROM flows WHERE id = ?1 AND status = 'active' LIMIT 1",
                params![id],
            )
        })
    }

    fn active_for_channel(&self, channel: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let channel = channel.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            query_flow(
                &conn,
                "SELECT definition, status FROM flows
                 WHERE channel_binding = ?1 AND status = 'active'
                 ORDER BY id LIMIT 1",
                params![channel],
            )
        })
    }

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, version, status, channel_binding FROM flows
                     ORDER BY id, version",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let status: String = row.get(3)?;
                    Ok(FlowSummary {
                        id: FlowId(row.get(0)?),
                        name: row.get(1)?,
                        version: row.get(2)?,
                        status: if status == "active" {
                            FlowStatus::Active
                        } else {
                            FlowStatus::Inactive
                        },
                        channel_binding: row.get(4)?,
                    })
                })
                .map_err(db_err)?;
            let mut summaries = Vec::new();
            for row in rows {
                summaries.push(row.map_err(db_err)?);
            }
            Ok(summaries)
        })
    }

    fn set_status(&self, id: &FlowId, version: u32, status: FlowStatus) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            if status == FlowStatus::Active {
                tx.execute(
                    "UPDATE flows SET status = 'inactive' WHERE id = ?1 AND version != ?2",
                    params![id, version],
                )
                .map_err(db_err)?;
            }
            let changed = tx
                .execute(
                    "UPDATE flows SET status = ?3 WHERE id = ?1 AND version = ?2",
                    params![id, version, status_str(status)],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(ChatflowError::FlowNotFound(format!("{} v{}", id, version)));
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn delete_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<usize>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute("DELETE FROM flows WHERE id = ?1", params![id])
                .map_err(db_err)
        })
    }
}

impl StateStore for SqliteStore {
    fn load_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let pair = pair.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT state FROM run_states WHERE flow_id = ?1 AND contact_id = ?2",
                    params![pair.flow_id.0, pair.contact_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            json.as_deref().map(decode_state).transpose()
        })
    }

    fn save_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            write_live(&tx, &state)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn archive_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            write_archive(&tx, &state)?;
            tx.commit().map_err(db_err)?;
            debug!(pair = %state.pair(), status = %state.status, "Run archived");
            Ok(())
        })
    }

    fn commit_states(
        &self,
        closed: &[ExecutionState],
        live: Option<&ExecutionState>,
    ) -> BoxFuture<'_, Result<()>> {
        let closed = closed.to_vec();
        let live = live.cloned();
        Box::pin(async move {
            let mut conn = self.lock()?;
            // Dropping the transaction on an early return rolls every write back
            let tx = conn.transaction().map_err(db_err)?;
            for state in &closed {
                write_archive(&tx, state)?;
            }
            if let Some(state) = &live {
                write_live(&tx, state)?;
            }
            tx.commit().map_err(db_err)?;
            debug!(archived = closed.len(), saved = live.is_some(), "Run states committed");
            Ok(())
        })
    }

    fn last_archived(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let pair = pair.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT state FROM archived_states
                     WHERE flow_id = ?1 AND contact_id = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![pair.flow_id.0, pair.contact_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            json.as_deref().map(decode_state).transpose()
        })
    }

    fn delete_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<bool>> {
        let pair = pair.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let n = conn
                .execute(
                    "DELETE FROM run_states WHERE flow_id = ?1 AND contact_id = ?2",
                    params![pair.flow_id.0, pair.contact_id.0],
                )
                .map_err(db_err)?;
            Ok(n > 0)
        })
    }

    fn live_for_contact(&self, contact: &ContactId) -> BoxFuture<'_, Result<Vec<ExecutionState>>> {
        let contact = contact.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            query_states(
                &conn,
                "SELECT state FROM run_states WHERE contact_id = ?1 ORDER BY updated_at DESC",
                &contact,
            )
        })
    }

    fn list_live(&self, flow_id: &FlowId) -> BoxFuture<'_, Result<Vec<ExecutionState>>> {
        let flow_id = flow_id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            query_states(
                &conn,
                "SELECT state FROM run_states WHERE flow_id = ?1 ORDER BY contact_id",
                &flow_id,
            )
        })
    }
}
