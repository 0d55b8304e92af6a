//! SQLite-backed store for protocols, steps and set outputs.
//!
//! Writes that may race another process run inside `BEGIN IMMEDIATE`
//! transactions under the [`RetryPolicy`]. Updates are column-scoped: the
//! scheduler writes status columns and the GUI writes label and comment, so
//! neither clobbers the other's fields. Reads are not retried.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::PersistenceError;
use super::retry::RetryPolicy;
use crate::execution::JobHandle;
use crate::protocol::{
    Pointer, PointerError, Protocol, ProtocolStatus, Resolved, SetItem, SetOutput, Step, StepGraph,
    StreamState,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS protocols (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  label TEXT NOT NULL,
  comment TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  streaming INTEGER NOT NULL,
  more_input INTEGER NOT NULL,
  stop_requested INTEGER NOT NULL DEFAULT 0,
  run_mode TEXT NOT NULL,
  working_dir TEXT NOT NULL,
  stdout_log TEXT NOT NULL,
  stderr_log TEXT NOT NULL,
  params TEXT NOT NULL,
  inputs TEXT NOT NULL,
  possible_outputs TEXT NOT NULL,
  job TEXT,
  error TEXT,
  dispatch_counter INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL,
  started_at TEXT,
  ended_at TEXT,
  runtime_ms INTEGER
);

CREATE TABLE IF NOT EXISTS steps (
  protocol_id TEXT NOT NULL,
  step_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  command TEXT NOT NULL,
  prerequisites TEXT NOT NULL,
  outputs TEXT NOT NULL,
  output_set TEXT,
  status TEXT NOT NULL,
  job TEXT,
  executed_index INTEGER,
  unknown_polls INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  started_at TEXT,
  ended_at TEXT,
  PRIMARY KEY (protocol_id, step_id)
);

CREATE TABLE IF NOT EXISTS set_outputs (
  protocol_id TEXT NOT NULL,
  name TEXT NOT NULL,
  item_kind TEXT NOT NULL,
  stream_state TEXT NOT NULL,
  size INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (protocol_id, name)
);

CREATE TABLE IF NOT EXISTS set_items (
  protocol_id TEXT NOT NULL,
  set_name TEXT NOT NULL,
  key TEXT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (protocol_id, set_name, key)
);
"#;

const PROTOCOL_COLUMNS: &str = "id, kind, label, comment, status, streaming, more_input, \
     stop_requested, run_mode, working_dir, params, inputs, possible_outputs, job, error, \
     dispatch_counter, created_at, modified_at, started_at, ended_at, runtime_ms";

const STEP_COLUMNS: &str = "step_id, command, prerequisites, outputs, output_set, status, job, \
     executed_index, unknown_polls, error, started_at, ended_at";

const UPSERT_STEP: &str = "INSERT INTO steps (protocol_id, step_id, position, command, \
     prerequisites, outputs, output_set, status, job, executed_index, unknown_polls, error, \
     started_at, ended_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
     ON CONFLICT(protocol_id, step_id) DO UPDATE SET position = excluded.position, \
     command = excluded.command, prerequisites = excluded.prerequisites, \
     outputs = excluded.outputs, output_set = excluded.output_set, status = excluded.status, \
     job = excluded.job, executed_index = excluded.executed_index, \
     unknown_polls = excluded.unknown_polls, error = excluded.error, \
     started_at = excluded.started_at, ended_at = excluded.ended_at";

/// Handle on the shared protocol database.
pub struct Mapper {
    path: PathBuf,
    conn: Connection,
    retry: RetryPolicy,
}

impl Mapper {
    /// Opens (and creates if needed) the database at `path`.
    ///
    /// The busy timeout is zero: a locked database is reported to the retry
    /// policy straight away instead of blocking inside SQLite.
    pub fn open(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path).map_err(|source| PersistenceError::Open {
            path: path.clone(),
            source,
        })?;
        conn.busy_timeout(Duration::ZERO)
            .map_err(|e| PersistenceError::storage("configure database", e))?;

        let mapper = Self { path, conn, retry };
        mapper
            .retry
            .run("initialize schema", || mapper.conn.execute_batch(SCHEMA_SQL))?;
        debug!("Opened protocol database: {}", mapper.path.display());
        Ok(mapper)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs `body` in an IMMEDIATE transaction under the retry policy.
    fn write<T, F>(&self, name: &str, mut body: F) -> Result<T, PersistenceError>
    where
        F: FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        self.retry.run(name, || {
            let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
            let value = body(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    // ================================================================
    // Protocols
    // ================================================================

    /// Writes the whole protocol and its step graph.
    ///
    /// Label, comment and the stop flag of an existing row are left alone;
    /// they belong to [`Mapper::update_metadata`] and [`Mapper::request_stop`].
    /// A stored scheduler job is kept when `protocol.job` is `None`; use
    /// [`Mapper::record_job`] to clear it.
    pub fn save(&self, protocol: &Protocol) -> Result<(), PersistenceError> {
        let logs = protocol.log_paths()?;
        let params_json = to_json("params", &protocol.params)?;
        let inputs_json = to_json("inputs", &protocol.inputs)?;
        let outputs_json = to_json("possible outputs", &protocol.possible_outputs)?;
        let job_json = protocol.job.as_ref().map(|j| to_json("job", j)).transpose()?;
        let steps = protocol
            .graph
            .iter()
            .enumerate()
            .map(|(position, step)| StepRecord::encode(position, step))
            .collect::<Result<Vec<_>, _>>()?;
        let now = Utc::now().to_rfc3339();

        self.write("save protocol", |tx| {
            tx.execute(
                &format!(
                    "INSERT INTO protocols ({}, stdout_log, stderr_log) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23) \
                     ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, \
                     status = excluded.status, streaming = excluded.streaming, \
                     more_input = excluded.more_input, run_mode = excluded.run_mode, \
                     working_dir = excluded.working_dir, params = excluded.params, \
                     inputs = excluded.inputs, possible_outputs = excluded.possible_outputs, \
                     job = COALESCE(excluded.job, protocols.job), error = excluded.error, \
                     dispatch_counter = excluded.dispatch_counter, \
                     modified_at = excluded.modified_at, started_at = excluded.started_at, \
                     ended_at = excluded.ended_at, runtime_ms = excluded.runtime_ms, \
                     stdout_log = excluded.stdout_log, stderr_log = excluded.stderr_log",
                    PROTOCOL_COLUMNS
                ),
                params![
                    protocol.id,
                    protocol.kind,
                    protocol.label,
                    protocol.comment,
                    protocol.status.as_str(),
                    protocol.streaming,
                    protocol.more_input,
                    protocol.stop_requested,
                    protocol.run_mode.as_str(),
                    protocol.working_dir.to_string_lossy(),
                    params_json,
                    inputs_json,
                    outputs_json,
                    job_json,
                    protocol.error,
                    protocol.dispatch_counter as i64,
                    protocol.created_at.to_rfc3339(),
                    now,
                    protocol.started_at.map(|t| t.to_rfc3339()),
                    protocol.ended_at.map(|t| t.to_rfc3339()),
                    protocol.runtime_ms,
                    logs.stdout.to_string_lossy(),
                    logs.stderr.to_string_lossy(),
                ],
            )?;
            tx.execute(
                "DELETE FROM steps WHERE protocol_id = ?1",
                params![protocol.id],
            )?;
            for record in &steps {
                record.upsert(tx, &protocol.id)?;
            }
            Ok(())
        })?;

        debug!("Saved protocol '{}' ({} steps)", protocol.id, steps.len());
        Ok(())
    }

    /// Loads a protocol and its steps.
    pub fn load(&self, id: &str) -> Result<Protocol, PersistenceError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM protocols WHERE id = ?1", PROTOCOL_COLUMNS),
                params![id],
                ProtocolRow::from_row,
            )
            .optional()
            .map_err(|e| PersistenceError::storage("load protocol", e))?
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;

        let steps = self.load_steps(id)?;
        row.decode(steps)
    }

    fn load_steps(&self, protocol_id: &str) -> Result<Vec<Step>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM steps WHERE protocol_id = ?1 ORDER BY position",
                STEP_COLUMNS
            ))
            .map_err(|e| PersistenceError::storage("load steps", e))?;
        let rows = stmt
            .query_map(params![protocol_id], StepRow::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| PersistenceError::storage("load steps", e))?;

        rows.into_iter().map(|row| row.decode(protocol_id)).collect()
    }

    pub fn exists(&self, id: &str) -> Result<bool, PersistenceError> {
        self.conn
            .query_row(
                "SELECT 1 FROM protocols WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(|e| PersistenceError::storage("look up protocol", e))
    }

    /// Identifiers of every stored protocol, oldest first.
    pub fn protocol_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM protocols ORDER BY created_at, id")
            .map_err(|e| PersistenceError::storage("list protocols", e))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| PersistenceError::storage("list protocols", e))?;
        Ok(ids)
    }

    pub fn list(&self) -> Result<Vec<Protocol>, PersistenceError> {
        self.protocol_ids()?
            .iter()
            .map(|id| self.load(id))
            .collect()
    }

    /// Persists one step together with the protocol's dispatch counter.
    ///
    /// Used for every step transition so a crashed loop never loses a
    /// dispatch record.
    pub fn save_step(&self, protocol: &Protocol, step_id: &str) -> Result<(), PersistenceError> {
        let position = protocol
            .graph
            .position(step_id)
            .ok_or_else(|| PersistenceError::corrupt("step", step_id, "not in protocol graph"))?;
        let step = protocol
            .graph
            .get(step_id)
            .ok_or_else(|| PersistenceError::corrupt("step", step_id, "not in protocol graph"))?;
        let record = StepRecord::encode(position, step)?;
        let now = Utc::now().to_rfc3339();

        self.write("save step", |tx| {
            record.upsert(tx, &protocol.id)?;
            tx.execute(
                "UPDATE protocols SET dispatch_counter = ?1, modified_at = ?2 WHERE id = ?3",
                params![protocol.dispatch_counter as i64, now, protocol.id],
            )?;
            Ok(())
        })
    }

    /// Writes the scheduler-owned status columns of a protocol.
    pub fn save_status(&self, protocol: &Protocol) -> Result<(), PersistenceError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.write("save status", |tx| {
            tx.execute(
                "UPDATE protocols SET status = ?1, more_input = ?2, error = ?3, \
                 dispatch_counter = ?4, run_mode = ?5, started_at = ?6, ended_at = ?7, \
                 runtime_ms = ?8, modified_at = ?9 WHERE id = ?10",
                params![
                    protocol.status.as_str(),
                    protocol.more_input,
                    protocol.error,
                    protocol.dispatch_counter as i64,
                    protocol.run_mode.as_str(),
                    protocol.started_at.map(|t| t.to_rfc3339()),
                    protocol.ended_at.map(|t| t.to_rfc3339()),
                    protocol.runtime_ms,
                    now,
                    protocol.id,
                ],
            )
        })?;
        if updated == 0 {
            return Err(PersistenceError::NotFound(protocol.id.clone()));
        }
        Ok(())
    }

    /// Moves the protocol to `to` only if its stored status is one of `from`.
    ///
    /// Returns whether the row changed. Lets the GUI side act on a status it
    /// observed without overwriting a newer value written by the scheduler.
    pub fn transition_status(
        &self,
        id: &str,
        from: &[ProtocolStatus],
        to: ProtocolStatus,
        error: Option<&str>,
    ) -> Result<bool, PersistenceError> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE protocols SET status = ?1, error = COALESCE(?2, error), modified_at = ?3 \
             WHERE id = ?4 AND status IN ({})",
            status_list(from)
        );
        let now = Utc::now().to_rfc3339();

        let updated = self.write("transition status", |tx| {
            tx.execute(&sql, params![to.as_str(), error, now, id])
        })?;
        Ok(updated > 0)
    }

    /// Marks the protocol SCHEDULED if its status is one of `from`, clearing
    /// the previous scheduler handle and stop flag in the same update.
    ///
    /// Returns false, leaving the row untouched, when another process holds it.
    pub fn claim_for_scheduling(&self, id: &str, from: &[ProtocolStatus]) -> Result<bool, PersistenceError> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE protocols SET status = ?1, job = NULL, stop_requested = 0, modified_at = ?2 \
             WHERE id = ?3 AND status IN ({})",
            status_list(from)
        );
        let now = Utc::now().to_rfc3339();

        let updated = self.write("claim protocol", |tx| {
            tx.execute(&sql, params![ProtocolStatus::Scheduled.as_str(), now, id])
        })?;
        Ok(updated > 0)
    }

    /// Stores (or clears) the handle of the scheduler process.
    pub fn record_job(&self, id: &str, job: Option<&JobHandle>) -> Result<(), PersistenceError> {
        let job_json = job.map(|j| to_json("job", j)).transpose()?;
        let now = Utc::now().to_rfc3339();
        self.write("record job", |tx| {
            tx.execute(
                "UPDATE protocols SET job = ?1, modified_at = ?2 WHERE id = ?3",
                params![job_json, now, id],
            )
        })?;
        Ok(())
    }

    /// GUI-side edit of descriptive fields; never touches status columns.
    pub fn update_metadata(&self, id: &str, label: &str, comment: &str) -> Result<(), PersistenceError> {
        let now = Utc::now().to_rfc3339();
        let updated = self.write("update metadata", |tx| {
            tx.execute(
                "UPDATE protocols SET label = ?1, comment = ?2, modified_at = ?3 WHERE id = ?4",
                params![label, comment, now, id],
            )
        })?;
        if updated == 0 {
            return Err(PersistenceError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Sets or clears the stop flag observed by the scheduler loop.
    pub fn set_stop_requested(&self, id: &str, requested: bool) -> Result<(), PersistenceError> {
        let updated = self.write("request stop", |tx| {
            tx.execute(
                "UPDATE protocols SET stop_requested = ?1 WHERE id = ?2",
                params![requested, id],
            )
        })?;
        if updated == 0 {
            return Err(PersistenceError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn request_stop(&self, id: &str) -> Result<(), PersistenceError> {
        info!("Stop requested for protocol '{}'", id);
        self.set_stop_requested(id, true)
    }

    pub fn stop_requested(&self, id: &str) -> Result<bool, PersistenceError> {
        self.conn
            .query_row(
                "SELECT stop_requested FROM protocols WHERE id = ?1",
                params![id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map_err(|e| PersistenceError::storage("read stop flag", e))?
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    /// Deletes a protocol.
    ///
    /// Its sets are closed first so readers holding a pointer see a closed
    /// set rather than a half-deleted one; then steps, sets and items are
    /// removed and the log files deleted.
    pub fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        let protocol = self.load(id)?;

        self.set_stream_state_all(id, StreamState::Closed)?;
        self.write("delete protocol", |tx| {
            tx.execute("DELETE FROM set_items WHERE protocol_id = ?1", params![id])?;
            tx.execute("DELETE FROM set_outputs WHERE protocol_id = ?1", params![id])?;
            tx.execute("DELETE FROM steps WHERE protocol_id = ?1", params![id])?;
            tx.execute("DELETE FROM protocols WHERE id = ?1", params![id])?;
            Ok(())
        })?;

        let logs = protocol.log_paths()?;
        for path in [&logs.stdout, &logs.stderr] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed log file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove log file {}: {}", path.display(), e),
            }
        }

        info!("Deleted protocol '{}'", id);
        Ok(())
    }

    // ================================================================
    // Set outputs
    // ================================================================

    /// Creates the declared sets if missing and marks them all OPEN.
    pub fn open_sets(
        &self,
        protocol_id: &str,
        declarations: &[(String, String)],
    ) -> Result<(), PersistenceError> {
        self.write("open sets", |tx| {
            for (name, item_kind) in declarations {
                tx.execute(
                    "INSERT INTO set_outputs (protocol_id, name, item_kind, stream_state, size) \
                     VALUES (?1, ?2, ?3, ?4, 0) ON CONFLICT(protocol_id, name) DO UPDATE SET \
                     item_kind = excluded.item_kind, stream_state = excluded.stream_state",
                    params![protocol_id, name, item_kind, StreamState::Open.as_str()],
                )?;
            }
            Ok(())
        })
    }

    pub fn sets(&self, protocol_id: &str) -> Result<Vec<SetOutput>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT protocol_id, name, item_kind, stream_state, size FROM set_outputs \
                 WHERE protocol_id = ?1 ORDER BY name",
            )
            .map_err(|e| PersistenceError::storage("list sets", e))?;
        let rows = stmt
            .query_map(params![protocol_id], SetRow::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| PersistenceError::storage("list sets", e))?;
        rows.into_iter().map(SetRow::decode).collect()
    }

    pub fn set(&self, protocol_id: &str, name: &str) -> Result<Option<SetOutput>, PersistenceError> {
        self.conn
            .query_row(
                "SELECT protocol_id, name, item_kind, stream_state, size FROM set_outputs \
                 WHERE protocol_id = ?1 AND name = ?2",
                params![protocol_id, name],
                SetRow::from_row,
            )
            .optional()
            .map_err(|e| PersistenceError::storage("read set", e))?
            .map(SetRow::decode)
            .transpose()
    }

    /// Items of a set in insertion order.
    pub fn set_items(&self, protocol_id: &str, set_name: &str) -> Result<Vec<SetItem>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key, payload FROM set_items WHERE protocol_id = ?1 AND set_name = ?2 \
                 ORDER BY rowid",
            )
            .map_err(|e| PersistenceError::storage("read set items", e))?;
        let rows = stmt
            .query_map(params![protocol_id, set_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| PersistenceError::storage("read set items", e))?;

        rows.into_iter()
            .map(|(key, payload)| {
                let payload = from_json("set item", &key, &payload)?;
                Ok(SetItem { key, payload })
            })
            .collect()
    }

    /// Appends items to an open set and returns its new size.
    ///
    /// Items whose key already exists are skipped. The whole batch is one
    /// transaction: on an exhausted retry budget nothing is written.
    pub fn append_set_items(
        &self,
        protocol_id: &str,
        set_name: &str,
        items: &[SetItem],
    ) -> Result<u64, PersistenceError> {
        let payloads = items
            .iter()
            .map(|item| Ok((item.key.as_str(), to_json("set item", &item.payload)?)))
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        let size = self.write("append set items", |tx| {
            let state: Option<String> = tx
                .query_row(
                    "SELECT stream_state FROM set_outputs WHERE protocol_id = ?1 AND name = ?2",
                    params![protocol_id, set_name],
                    |row| row.get(0),
                )
                .optional()?;
            match state.as_deref() {
                Some("closed") => return Ok(None),
                Some(_) => {}
                None => {
                    tx.execute(
                        "INSERT INTO set_outputs (protocol_id, name, item_kind, stream_state, size) \
                         VALUES (?1, ?2, ?3, ?4, 0)",
                        params![
                            protocol_id,
                            set_name,
                            crate::protocol::DEFAULT_ITEM_KIND,
                            StreamState::Open.as_str()
                        ],
                    )?;
                }
            }

            for (key, payload) in &payloads {
                tx.execute(
                    "INSERT OR IGNORE INTO set_items (protocol_id, set_name, key, payload) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![protocol_id, set_name, key, payload],
                )?;
            }
            let size: i64 = tx.query_row(
                "SELECT COUNT(*) FROM set_items WHERE protocol_id = ?1 AND set_name = ?2",
                params![protocol_id, set_name],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE set_outputs SET size = ?1 WHERE protocol_id = ?2 AND name = ?3",
                params![size, protocol_id, set_name],
            )?;
            Ok(Some(size.max(0) as u64))
        })?;

        size.ok_or_else(|| PersistenceError::SetClosed {
            protocol: protocol_id.to_string(),
            set: set_name.to_string(),
        })
    }

    pub fn set_stream_state_all(&self, protocol_id: &str, state: StreamState) -> Result<(), PersistenceError> {
        self.write("set stream state", |tx| {
            tx.execute(
                "UPDATE set_outputs SET stream_state = ?1 WHERE protocol_id = ?2",
                params![state.as_str(), protocol_id],
            )
        })?;
        Ok(())
    }

    /// Empties every set of the protocol (restart).
    pub fn clear_sets(&self, protocol_id: &str) -> Result<(), PersistenceError> {
        self.write("clear sets", |tx| {
            tx.execute(
                "DELETE FROM set_items WHERE protocol_id = ?1",
                params![protocol_id],
            )?;
            tx.execute(
                "UPDATE set_outputs SET size = 0 WHERE protocol_id = ?1",
                params![protocol_id],
            )?;
            Ok(())
        })
    }

    // ================================================================
    // Pointers
    // ================================================================

    /// Looks up the target of a pointer.
    pub fn resolve(&self, pointer: &Pointer) -> Result<Resolved, PointerError> {
        let storage = |source| PointerError::Storage {
            pointer: pointer.clone(),
            source,
        };

        if !self.exists(&pointer.protocol_id).map_err(storage)? {
            return Err(PointerError::MissingProtocol {
                pointer: pointer.clone(),
            });
        }

        let set = self
            .set(&pointer.protocol_id, &pointer.output)
            .map_err(storage)?
            .ok_or_else(|| PointerError::MissingOutput {
                pointer: pointer.clone(),
            })?;

        if let Some(ref expected) = pointer.expects {
            if *expected != set.item_kind {
                return Err(PointerError::TypeMismatch {
                    pointer: pointer.clone(),
                    expected: expected.clone(),
                    found: set.item_kind.clone(),
                });
            }
        }

        let key = match pointer.extended {
            Some(ref key) => key,
            None => return Ok(Resolved::Set(set)),
        };

        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM set_items WHERE protocol_id = ?1 AND set_name = ?2 AND key = ?3",
                params![pointer.protocol_id, pointer.output, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage(PersistenceError::storage("resolve pointer", e)))?;

        match payload {
            Some(payload) => {
                let payload = from_json("set item", key, &payload).map_err(storage)?;
                Ok(Resolved::Item {
                    set,
                    item: SetItem::new(key.clone(), payload),
                })
            }
            None => Err(PointerError::MissingItem {
                pointer: pointer.clone(),
                key: key.clone(),
            }),
        }
    }
}

// ================================================================
// Row codecs
// ================================================================

/// Quoted, comma-separated status names for an `IN (...)` clause.
fn status_list(statuses: &[ProtocolStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_json<T: Serialize + ?Sized>(what: &'static str, value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|source| PersistenceError::Encode { what, source })
}

fn from_json<T: DeserializeOwned>(what: &'static str, id: &str, text: &str) -> Result<T, PersistenceError> {
    serde_json::from_str(text).map_err(|e| PersistenceError::corrupt(what, id, e))
}

fn parse_time(what: &'static str, id: &str, text: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::corrupt(what, id, e))
}

fn parse_optional_time(
    what: &'static str,
    id: &str,
    text: Option<String>,
) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    text.map(|t| parse_time(what, id, &t)).transpose()
}

struct StepRecord {
    step_id: String,
    position: i64,
    command: String,
    prerequisites: String,
    outputs: String,
    output_set: Option<String>,
    status: &'static str,
    job: Option<String>,
    executed_index: Option<i64>,
    unknown_polls: i64,
    error: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl StepRecord {
    fn encode(position: usize, step: &Step) -> Result<Self, PersistenceError> {
        Ok(Self {
            step_id: step.id.clone(),
            position: position as i64,
            command: step.command.clone(),
            prerequisites: to_json("prerequisites", &step.prerequisites)?,
            outputs: to_json("step outputs", &step.outputs)?,
            output_set: step.output_set.clone(),
            status: step.status.as_str(),
            job: step.job.as_ref().map(|j| to_json("job", j)).transpose()?,
            executed_index: step.executed_index.map(|i| i as i64),
            unknown_polls: i64::from(step.unknown_polls),
            error: step.error.clone(),
            started_at: step.started_at.map(|t| t.to_rfc3339()),
            ended_at: step.ended_at.map(|t| t.to_rfc3339()),
        })
    }

    fn upsert(&self, tx: &Transaction<'_>, protocol_id: &str) -> rusqlite::Result<usize> {
        tx.execute(
            UPSERT_STEP,
            params![
                protocol_id,
                self.step_id,
                self.position,
                self.command,
                self.prerequisites,
                self.outputs,
                self.output_set,
                self.status,
                self.job,
                self.executed_index,
                self.unknown_polls,
                self.error,
                self.started_at,
                self.ended_at,
            ],
        )
    }
}

struct StepRow {
    step_id: String,
    command: String,
    prerequisites: String,
    outputs: String,
    output_set: Option<String>,
    status: String,
    job: Option<String>,
    executed_index: Option<i64>,
    unknown_polls: i64,
    error: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            step_id: row.get(0)?,
            command: row.get(1)?,
            prerequisites: row.get(2)?,
            outputs: row.get(3)?,
            output_set: row.get(4)?,
            status: row.get(5)?,
            job: row.get(6)?,
            executed_index: row.get(7)?,
            unknown_polls: row.get(8)?,
            error: row.get(9)?,
            started_at: row.get(10)?,
            ended_at: row.get(11)?,
        })
    }

    fn decode(self, protocol_id: &str) -> Result<Step, PersistenceError> {
        let id = format!("{}/{}", protocol_id, self.step_id);
        let mut step = Step::new(self.step_id, self.command);
        step.prerequisites = from_json("step", &id, &self.prerequisites)?;
        step.outputs = from_json("step", &id, &self.outputs)?;
        step.output_set = self.output_set;
        step.status = self
            .status
            .parse()
            .map_err(|e| PersistenceError::corrupt("step", &id, e))?;
        step.job = self
            .job
            .map(|j| from_json::<JobHandle>("step", &id, &j))
            .transpose()?;
        step.executed_index = self.executed_index.map(|i| i.max(0) as u64);
        step.unknown_polls = u32::try_from(self.unknown_polls.max(0)).unwrap_or(u32::MAX);
        step.error = self.error;
        step.started_at = parse_optional_time("step", &id, self.started_at)?;
        step.ended_at = parse_optional_time("step", &id, self.ended_at)?;
        Ok(step)
    }
}

struct ProtocolRow {
    id: String,
    kind: String,
    label: String,
    comment: String,
    status: String,
    streaming: bool,
    more_input: bool,
    stop_requested: bool,
    run_mode: String,
    working_dir: String,
    params: String,
    inputs: String,
    possible_outputs: String,
    job: Option<String>,
    error: Option<String>,
    dispatch_counter: i64,
    created_at: String,
    modified_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    runtime_ms: Option<i64>,
}

impl ProtocolRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            label: row.get(2)?,
            comment: row.get(3)?,
            status: row.get(4)?,
            streaming: row.get(5)?,
            more_input: row.get(6)?,
            stop_requested: row.get(7)?,
            run_mode: row.get(8)?,
            working_dir: row.get(9)?,
            params: row.get(10)?,
            inputs: row.get(11)?,
            possible_outputs: row.get(12)?,
            job: row.get(13)?,
            error: row.get(14)?,
            dispatch_counter: row.get(15)?,
            created_at: row.get(16)?,
            modified_at: row.get(17)?,
            started_at: row.get(18)?,
            ended_at: row.get(19)?,
            runtime_ms: row.get(20)?,
        })
    }

    fn decode(self, steps: Vec<Step>) -> Result<Protocol, PersistenceError> {
        let id = self.id;
        let mut protocol = Protocol::new(&id, self.kind, self.working_dir);
        protocol.label = self.label;
        protocol.comment = self.comment;
        protocol.status = self
            .status
            .parse::<ProtocolStatus>()
            .map_err(|e| PersistenceError::corrupt("protocol", &id, e))?;
        protocol.streaming = self.streaming;
        protocol.more_input = self.more_input;
        protocol.stop_requested = self.stop_requested;
        protocol.run_mode = self
            .run_mode
            .parse()
            .map_err(|e| PersistenceError::corrupt("protocol", &id, e))?;
        protocol.params = from_json("protocol", &id, &self.params)?;
        protocol.inputs = from_json("protocol", &id, &self.inputs)?;
        protocol.possible_outputs = from_json("protocol", &id, &self.possible_outputs)?;
        protocol.job = self
            .job
            .map(|j| from_json::<JobHandle>("protocol", &id, &j))
            .transpose()?;
        protocol.error = self.error;
        protocol.dispatch_counter = self.dispatch_counter.max(0) as u64;
        protocol.created_at = parse_time("protocol", &id, &self.created_at)?;
        protocol.modified_at = parse_time("protocol", &id, &self.modified_at)?;
        protocol.started_at = parse_optional_time("protocol", &id, self.started_at)?;
        protocol.ended_at = parse_optional_time("protocol", &id, self.ended_at)?;
        protocol.runtime_ms = self.runtime_ms;
        protocol.graph =
            StepGraph::from_steps(steps).map_err(|e| PersistenceError::corrupt("protocol", &id, e))?;
        Ok(protocol)
    }
}

struct SetRow {
    protocol_id: String,
    name: String,
    item_kind: String,
    stream_state: String,
    size: i64,
}

impl SetRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            protocol_id: row.get(0)?,
            name: row.get(1)?,
            item_kind: row.get(2)?,
            stream_state: row.get(3)?,
            size: row.get(4)?,
        })
    }

    fn decode(self) -> Result<SetOutput, PersistenceError> {
        let stream_state = self
            .stream_state
            .parse()
            .map_err(|e| PersistenceError::corrupt("set", &self.name, e))?;
        Ok(SetOutput {
            protocol_id: self.protocol_id,
            name: self.name,
            item_kind: self.item_kind,
            stream_state,
            size: self.size.max(0) as u64,
        })
    }
}
