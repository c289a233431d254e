use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::lock::{self, LockMode};
use crate::state::{
    log_action_for_checkin, LogAction, StoreState, TaskState, ALL_TASK_STATES,
    CHECKOUT_ELIGIBLE_STATES, RUNTIME_RESET_ACTIONS, VALID_CHECKIN_ACTIONS,
};
use crate::time::diff_timestamps;

/// Session-scoped tunables persisted into `INFO.CONFIG` at creation time and
/// overridable per-open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreConfig {
    pub timeout: f64,
    pub task_checkout_delay: f64,
    pub task_checkout_num_tries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            timeout: 10.0,
            task_checkout_delay: 1.0,
            task_checkout_num_tries: 10,
        }
    }
}

impl StoreConfig {
    fn merge_overrides(mut self, overrides: &StoreConfig) -> Self {
        self.timeout = overrides.timeout;
        self.task_checkout_delay = overrides.task_checkout_delay;
        self.task_checkout_num_tries = overrides.task_checkout_num_tries;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task_id: String,
    pub cmd: String,
    pub state: TaskState,
    pub priority: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub log_id: i64,
    pub task_id: String,
    pub action: LogAction,
    pub time: String,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: StoreState,
    pub num_clients: i64,
    pub num_tasks: i64,
    pub per_state: Vec<(TaskState, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeExtremum {
    pub task_id_index: usize,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeReport {
    pub total_seconds: f64,
    pub num_succeeded: i64,
    pub mean_seconds: f64,
    pub min: Option<(String, f64)>,
    pub max: Option<(String, f64)>,
}

/// A handle on the persistent, lock-coordinated task store.
///
/// The store file is the single source of truth; this handle owns only its
/// own `CLIENTS` row and a local connection.
pub struct Store {
    conn: Connection,
    client_id: String,
    timeout: Duration,
    task_checkout_delay: Duration,
    task_checkout_num_tries: u32,
    closed: Cell<bool>,
}

impl Store {
    /// Create the file if absent, or attach to an existing one. Registers a
    /// new client row either way.
    pub fn open(path: impl AsRef<Path>, overrides: StoreConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        let existed = path.exists();

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        apply_pragmas(&conn, Duration::from_secs_f64(overrides.timeout))?;

        let config = if existed {
            Self::attach(&conn, overrides)?
        } else {
            Self::create(&conn, overrides)?
        };

        let store = Store {
            conn,
            client_id: Uuid::new_v4().simple().to_string(),
            timeout: Duration::from_secs_f64(config.timeout),
            task_checkout_delay: Duration::from_secs_f64(config.task_checkout_delay),
            task_checkout_num_tries: config.task_checkout_num_tries,
            closed: Cell::new(false),
        };
        store.add_client()?;
        Ok(store)
    }

    fn create(conn: &Connection, overrides: StoreConfig) -> StoreResult<StoreConfig> {
        let config = StoreConfig::default().merge_overrides(&overrides);
        if !lock::acquire(conn, LockMode::Exclusive, Duration::from_secs_f64(config.timeout)) {
            return Err(StoreError::LockFailure {
                timeout: config.timeout,
                msg: "create".into(),
            });
        }
        let result: StoreResult<()> = (|| {
            conn.execute_batch(SCHEMA_DDL)?;
            let blob = serde_json::to_string(&config)?;
            conn.execute(
                "INSERT INTO INFO (STATE, CONFIG) VALUES (?1, ?2)",
                params![StoreState::PAUSED.to_string(), blob],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                lock::release(conn)?;
                Ok(config)
            }
            Err(e) => {
                lock::rollback(conn);
                Err(e)
            }
        }
    }

    fn attach(conn: &Connection, overrides: StoreConfig) -> StoreResult<StoreConfig> {
        let init_timeout = StoreConfig::default().timeout;
        if !lock::acquire(conn, LockMode::Exclusive, Duration::from_secs_f64(init_timeout)) {
            return Err(StoreError::LockFailure {
                timeout: init_timeout,
                msg: "init setup".into(),
            });
        }
        let persisted: StoreResult<String> = (|| {
            let blob: String = conn.query_row("SELECT CONFIG FROM INFO", [], |r| r.get(0))?;
            Ok(blob)
        })();
        match persisted {
            Ok(blob) => {
                lock::release(conn)?;
                let persisted: StoreConfig = serde_json::from_str(&blob)?;
                Ok(persisted.merge_overrides(&overrides))
            }
            Err(e) => {
                lock::rollback(conn);
                Err(e)
            }
        }
    }

    fn add_client(&self) -> StoreResult<()> {
        self.with_lock(LockMode::Transaction, "add client", |conn| {
            conn.execute(
                "INSERT INTO CLIENTS (CLIENT_ID) VALUES (?1)",
                params![self.client_id],
            )?;
            Ok(())
        })
    }

    /// Remove this client's row; if it was the last client, force the store
    /// back to PAUSED. The only path that transitions the store to PAUSED
    /// on shutdown.
    pub fn close(self) -> StoreResult<()> {
        self.with_lock(LockMode::Exclusive, "close", |conn| {
            let num_clients: i64 = conn.query_row("SELECT COUNT(*) FROM CLIENTS", [], |r| r.get(0))?;
            conn.execute(
                "DELETE FROM CLIENTS WHERE CLIENT_ID = ?1",
                params![self.client_id],
            )?;
            if num_clients == 1 {
                conn.execute(
                    "UPDATE INFO SET STATE = ?1",
                    params![StoreState::PAUSED.to_string()],
                )?;
            }
            Ok(())
        })?;
        self.closed.set(true);
        Ok(())
    }

    /// Run `body` under `mode`, committing on success and rolling back (then
    /// converting to a `StoreError`) on failure.
    fn with_lock<T>(
        &self,
        mode: LockMode,
        msg: &str,
        body: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if !lock::acquire(&self.conn, mode, self.timeout) {
            return Err(StoreError::LockFailure {
                timeout: self.timeout.as_secs_f64(),
                msg: msg.into(),
            });
        }
        match body(&self.conn) {
            Ok(v) => {
                lock::release(&self.conn)?;
                Ok(v)
            }
            Err(e) => {
                lock::rollback(&self.conn);
                Err(e)
            }
        }
    }

    fn write_log(conn: &Connection, task_id: &str, action: LogAction, info: &str) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO LOGS (ACTION, TASK_ID, INFO) VALUES (?1, ?2, ?3)",
            params![action.to_string(), task_id, info],
        )?;
        Ok(())
    }

    /// Insert a single task in state QUEUED_NO_DEP with an ADDED log entry.
    pub fn add(&self, cmd: &str, id: Option<String>, priority: Option<f64>) -> StoreResult<String> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let priority = priority.unwrap_or(0.0);

        self.with_lock(LockMode::Exclusive, "add", |conn| {
            let exists: i64 =
                conn.query_row("SELECT COUNT(*) FROM TASKS WHERE TASK_ID = ?1", params![id], |r| {
                    r.get(0)
                })?;
            if exists != 0 {
                return Err(StoreError::IntegrityFailure(format!(
                    "task '{id}' already exists"
                )));
            }
            conn.execute(
                "INSERT INTO TASKS (CMD, STATE, TASK_ID, PRIORITY) VALUES (?1, ?2, ?3, ?4)",
                params![cmd, TaskState::QUEUED_NO_DEP.to_string(), id, priority],
            )?;
            Self::write_log(conn, &id, LogAction::ADDED, "")?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Atomic batch insert with one priority applied to every task.
    pub fn add_multiple(
        &self,
        cmds: &[String],
        ids: Option<Vec<String>>,
        priority: f64,
    ) -> StoreResult<Vec<String>> {
        let priorities = vec![priority; cmds.len()];
        self.add_multiple_with_priorities(cmds, ids, priorities)
    }

    /// Atomic batch insert with a per-task priority sequence. `priorities`
    /// must be the same length as `cmds`.
    pub fn add_multiple_with_priorities(
        &self,
        cmds: &[String],
        ids: Option<Vec<String>>,
        priorities: Vec<f64>,
    ) -> StoreResult<Vec<String>> {
        if priorities.len() != cmds.len() {
            return Err(StoreError::InvalidArgument(
                "priorities length must match cmds length".into(),
            ));
        }
        let ids = ids.unwrap_or_else(|| {
            (0..cmds.len())
                .map(|_| Uuid::new_v4().simple().to_string())
                .collect()
        });
        if ids.len() != cmds.len() {
            return Err(StoreError::InvalidArgument(
                "ids length must match cmds length".into(),
            ));
        }

        self.with_lock(LockMode::Exclusive, "add multiple", |conn| {
            let existing: std::collections::HashSet<String> = conn
                .prepare("SELECT TASK_ID FROM TASKS")?
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<_, _>>()?;
            if ids.iter().any(|id| existing.contains(id)) {
                return Err(StoreError::IntegrityFailure(
                    "duplicate task id in batch".into(),
                ));
            }
            let mut insert_task =
                conn.prepare_cached("INSERT INTO TASKS (CMD, STATE, TASK_ID, PRIORITY) VALUES (?1, ?2, ?3, ?4)")?;
            let mut insert_log =
                conn.prepare_cached("INSERT INTO LOGS (ACTION, TASK_ID, INFO) VALUES (?1, ?2, ?3)")?;
            for ((cmd, id), priority) in cmds.iter().zip(ids.iter()).zip(priorities.iter()) {
                insert_task.execute(params![cmd, TaskState::QUEUED_NO_DEP.to_string(), id, priority])?;
                insert_log.execute(params![LogAction::ADDED.to_string(), id, ""])?;
            }
            Ok(())
        })?;
        Ok(ids)
    }

    /// Field-wise update; every provided field contributes a clause to a
    /// single human-readable `info` string on one UPDATED log entry.
    pub fn update(
        &self,
        id: &str,
        task: Option<&str>,
        priority: Option<f64>,
        state: Option<TaskState>,
    ) -> StoreResult<()> {
        self.with_lock(LockMode::Exclusive, "update", |conn| {
            let mut info = String::new();

            if let Some(priority) = priority {
                let old: f64 =
                    conn.query_row("SELECT PRIORITY FROM TASKS WHERE TASK_ID = ?1", params![id], |r| {
                        r.get(0)
                    })?;
                conn.execute(
                    "UPDATE TASKS SET PRIORITY = ?1 WHERE TASK_ID = ?2",
                    params![priority, id],
                )?;
                info += &format!("set PRIORITY to {priority} from {old}; ");
            }

            if let Some(state) = state {
                let old: String =
                    conn.query_row("SELECT STATE FROM TASKS WHERE TASK_ID = ?1", params![id], |r| {
                        r.get(0)
                    })?;
                conn.execute(
                    "UPDATE TASKS SET STATE = ?1 WHERE TASK_ID = ?2",
                    params![state.to_string(), id],
                )?;
                info += &format!("set STATE to {state} from {old}; ");
            }

            if let Some(task) = task {
                let old: String =
                    conn.query_row("SELECT CMD FROM TASKS WHERE TASK_ID = ?1", params![id], |r| {
                        r.get(0)
                    })?;
                conn.execute("UPDATE TASKS SET CMD = ?1 WHERE TASK_ID = ?2", params![task, id])?;
                info += &format!("set CMD to \"{task}\" from \"{old}\"; ");
            }

            Self::write_log(conn, id, LogAction::UPDATED, &info)?;
            Ok(())
        })
    }

    /// Logical (default) or physical (`remove=true`) removal. The DELETED
    /// log entry is always written, even for physical removal.
    pub fn delete(&self, id: &str, remove: bool) -> StoreResult<()> {
        self.with_lock(LockMode::Exclusive, "delete", |conn| {
            if remove {
                conn.execute("DELETE FROM TASKS WHERE TASK_ID = ?1", params![id])?;
            } else {
                conn.execute(
                    "UPDATE TASKS SET STATE = ?1 WHERE TASK_ID = ?2",
                    params![TaskState::DELETED.to_string(), id],
                )?;
            }
            Self::write_log(conn, id, LogAction::DELETED, "")?;
            Ok(())
        })
    }

    /// Reclaim everything: every non-DELETED task gets a RESET log entry and
    /// returns to QUEUED_NO_DEP; every client but the caller's is dropped;
    /// the store is forced PAUSED.
    pub fn reset(&self) -> StoreResult<()> {
        self.with_lock(LockMode::Exclusive, "reset", |conn| {
            let ids: Vec<String> = conn
                .prepare("SELECT TASK_ID FROM TASKS WHERE STATE != ?1")?
                .query_map(params![TaskState::DELETED.to_string()], |r| r.get(0))?
                .collect::<Result<_, _>>()?;

            let mut insert_log =
                conn.prepare_cached("INSERT INTO LOGS (ACTION, TASK_ID, INFO) VALUES (?1, ?2, ?3)")?;
            for id in &ids {
                insert_log.execute(params![LogAction::RESET.to_string(), id, ""])?;
            }

            conn.execute(
                "UPDATE TASKS SET STATE = ?1 WHERE STATE != ?2",
                params![TaskState::QUEUED_NO_DEP.to_string(), TaskState::DELETED.to_string()],
            )?;
            conn.execute(
                "DELETE FROM CLIENTS WHERE CLIENT_ID != ?1",
                params![self.client_id],
            )?;
            conn.execute(
                "UPDATE INFO SET STATE = ?1",
                params![StoreState::PAUSED.to_string()],
            )?;
            Ok(())
        })
    }

    /// Offline repair: every RUNNING task is marked KILLED (with a CLEANED
    /// log entry) and the store is forced PAUSED; used after an ungraceful
    /// exit left tasks stranded RUNNING.
    pub fn cleanup(&self) -> StoreResult<()> {
        self.with_lock(LockMode::Exclusive, "cleanup", |conn| {
            let ids: Vec<String> = conn
                .prepare("SELECT TASK_ID FROM TASKS WHERE STATE = ?1")?
                .query_map(params![TaskState::RUNNING.to_string()], |r| r.get(0))?
                .collect::<Result<_, _>>()?;

            let mut insert_log =
                conn.prepare_cached("INSERT INTO LOGS (ACTION, TASK_ID, INFO) VALUES (?1, ?2, ?3)")?;
            for id in &ids {
                insert_log.execute(params![LogAction::CLEANED.to_string(), id, ""])?;
            }

            conn.execute(
                "UPDATE INFO SET STATE = ?1",
                params![StoreState::PAUSED.to_string()],
            )?;
            conn.execute(
                "DELETE FROM CLIENTS WHERE CLIENT_ID != ?1",
                params![self.client_id],
            )?;
            conn.execute(
                "UPDATE TASKS SET STATE = ?1 WHERE STATE = ?2",
                params![TaskState::KILLED.to_string(), TaskState::RUNNING.to_string()],
            )?;
            Ok(())
        })
    }

    /// Atomically claim the next eligible task. Retries on transient lock
    /// failure up to `task_checkout_num_tries` times, sleeping
    /// `task_checkout_delay` in between; exhaustion yields `Ok(None)`, not
    /// an error.
    pub fn checkout(&self, state: Option<TaskState>) -> StoreResult<Option<(String, String)>> {
        for attempt in 0..self.task_checkout_num_tries {
            if attempt > 0 {
                std::thread::sleep(self.task_checkout_delay);
            }

            let outcome = self.with_lock(LockMode::Exclusive, "checkout", |conn| {
                let row: Option<(String, String, TaskState)> = match state {
                    None => {
                        let states: Vec<String> =
                            CHECKOUT_ELIGIBLE_STATES.iter().map(|s| s.to_string()).collect();
                        conn.query_row(
                            &format!(
                                "SELECT CMD, TASK_ID, STATE FROM TASKS \
                                 WHERE STATE IN ({}) ORDER BY PRIORITY DESC LIMIT 1",
                                states.iter().map(|_| "?").collect::<Vec<_>>().join(",")
                            ),
                            rusqlite::params_from_iter(states.iter()),
                            |r| {
                                let s: String = r.get(2)?;
                                Ok((r.get(0)?, r.get(1)?, TaskState::from_str(&s).unwrap()))
                            },
                        )
                        .ok()
                    }
                    Some(state) => conn
                        .query_row(
                            "SELECT CMD, TASK_ID, STATE FROM TASKS WHERE STATE = ?1 \
                             ORDER BY PRIORITY DESC LIMIT 1",
                            params![state.to_string()],
                            |r| {
                                let s: String = r.get(2)?;
                                Ok((r.get(0)?, r.get(1)?, TaskState::from_str(&s).unwrap()))
                            },
                        )
                        .ok(),
                };

                let Some((cmd, id, prev_state)) = row else {
                    return Ok(None);
                };

                conn.execute(
                    "UPDATE TASKS SET STATE = ?1 WHERE TASK_ID = ?2",
                    params![TaskState::RUNNING.to_string(), id],
                )?;
                let log_action = if prev_state == TaskState::CHECKPOINTED {
                    LogAction::RAN_FROM_CHECKPOINT
                } else {
                    LogAction::RAN
                };
                Self::write_log(conn, &id, log_action, "")?;

                Ok(Some((cmd, id)))
            });

            match outcome {
                Ok(result) => return Ok(result),
                Err(StoreError::LockFailure { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Validate `state` up front if the caller passed one; mirrors the
    /// precondition `checkout` itself enforces.
    pub fn validate_state(state: &str) -> StoreResult<TaskState> {
        let parsed = TaskState::from_str(state)?;
        if !ALL_TASK_STATES.contains(&parsed) {
            return Err(StoreError::InvalidArgument(format!(
                "'{state}' is not a valid task state"
            )));
        }
        Ok(parsed)
    }

    /// Transition a RUNNING task to a terminal state with a matching log
    /// entry. `outcome` must be one of FAILED, SUCCEEDED, CHECKPOINTED,
    /// KILLED.
    pub fn checkin(&self, task_id: &str, outcome: TaskState, info: &str) -> StoreResult<()> {
        let action = log_action_for_checkin(outcome).ok_or_else(|| {
            StoreError::InvalidArgument(format!("'{outcome}' is not a valid checkin outcome"))
        })?;
        debug_assert!(VALID_CHECKIN_ACTIONS.contains(&action));

        self.with_lock(LockMode::Exclusive, "checkin", |conn| {
            conn.execute(
                "UPDATE TASKS SET STATE = ?1 WHERE TASK_ID = ?2",
                params![outcome.to_string(), task_id],
            )?;
            Self::write_log(conn, task_id, action, info)?;
            Ok(())
        })
    }

    /// All tasks (optionally filtered by state), ordered by descending
    /// priority. A stale read; does not take the store lock.
    pub fn list(&self, state: Option<TaskState>) -> StoreResult<Vec<TaskRow>> {
        let rows = match state {
            None => self.conn.prepare(
                "SELECT TASK_ID, STATE, CMD, PRIORITY FROM TASKS ORDER BY PRIORITY DESC",
            )?
            .query_map([], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()?,
            Some(state) => self
                .conn
                .prepare(
                    "SELECT TASK_ID, STATE, CMD, PRIORITY FROM TASKS \
                     WHERE STATE = ?1 ORDER BY PRIORITY DESC",
                )?
                .query_map(params![state.to_string()], Self::row_to_task)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    fn row_to_task(r: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
        let state: String = r.get(1)?;
        Ok(TaskRow {
            task_id: r.get(0)?,
            state: TaskState::from_str(&state).unwrap_or(TaskState::QUEUED_NO_DEP),
            cmd: r.get(2)?,
            priority: r.get(3)?,
        })
    }

    /// The task's header and its full chronological log. A stale read; does
    /// not take the store lock.
    pub fn log(&self, task_id: &str) -> StoreResult<(TaskRow, Vec<LogRow>)> {
        let logs = self.logs_for(task_id)?;
        let task = self
            .conn
            .query_row(
                "SELECT TASK_ID, STATE, CMD, PRIORITY FROM TASKS WHERE TASK_ID = ?1",
                params![task_id],
                Self::row_to_task,
            )
            .map_err(|_| StoreError::IntegrityFailure(format!("unknown task id '{task_id}'")))?;
        Ok((task, logs))
    }

    fn logs_for(&self, task_id: &str) -> StoreResult<Vec<LogRow>> {
        let logs = self
            .conn
            .prepare(
                "SELECT LOG_ID, TASK_ID, ACTION, TIME, INFO FROM LOGS \
                 WHERE TASK_ID = ?1 ORDER BY LOG_ID ASC",
            )?
            .query_map(params![task_id], |r| {
                let action: String = r.get(2)?;
                Ok(LogRow {
                    log_id: r.get(0)?,
                    task_id: r.get(1)?,
                    action: LogAction::from_str(&action).unwrap_or(LogAction::ADDED),
                    time: r.get(3)?,
                    info: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// The wall-clock difference between a task's most recent RAN and most
    /// recent SUCCEEDED entries, scanning newest-first and bailing out as
    /// soon as a disqualifying ADDED/RESET/DELETED/KILLED/UPDATED entry is
    /// seen (see the runtime invariant in the data model).
    fn extract_runtime(logs: &[LogRow]) -> Option<f64> {
        let mut succ_time: Option<&str> = None;
        let mut ran_time: Option<&str> = None;
        for log in logs.iter().rev() {
            if log.action == LogAction::SUCCEEDED && succ_time.is_none() {
                succ_time = Some(&log.time);
            }
            if log.action == LogAction::RAN && ran_time.is_none() {
                ran_time = Some(&log.time);
            }
            if RUNTIME_RESET_ACTIONS.contains(&log.action) {
                break;
            }
            if succ_time.is_some() && ran_time.is_some() {
                break;
            }
        }
        diff_timestamps(ran_time?, succ_time?)
    }

    /// Store state, client count, total non-DELETED task count, and
    /// per-state counts.
    pub fn status(&self) -> StoreResult<StatusReport> {
        let state: String = self.conn.query_row("SELECT STATE FROM INFO", [], |r| r.get(0))?;
        let num_clients: i64 = self.conn.query_row("SELECT COUNT(*) FROM CLIENTS", [], |r| r.get(0))?;
        let num_tasks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM TASKS WHERE STATE != ?1",
            params![TaskState::DELETED.to_string()],
            |r| r.get(0),
        )?;

        let mut per_state = Vec::with_capacity(ALL_TASK_STATES.len());
        for state in ALL_TASK_STATES {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM TASKS WHERE STATE = ?1",
                params![state.to_string()],
                |r| r.get(0),
            )?;
            per_state.push((state, n));
        }

        Ok(StatusReport {
            state: StoreState::from_str(&state)?,
            num_clients,
            num_tasks,
            per_state,
        })
    }

    /// Read `StoreInfo.state`.
    pub fn state(&self) -> StoreResult<StoreState> {
        let state: String = self.conn.query_row("SELECT STATE FROM INFO", [], |r| r.get(0))?;
        StoreState::from_str(&state)
    }

    fn set_state(&self, state: StoreState) -> StoreResult<()> {
        self.with_lock(LockMode::Exclusive, "set store state", |conn| {
            conn.execute("UPDATE INFO SET STATE = ?1", params![state.to_string()])?;
            Ok(())
        })
    }

    pub fn pause(&self) -> StoreResult<()> {
        self.set_state(StoreState::PAUSED)
    }

    pub fn run(&self) -> StoreResult<()> {
        self.set_state(StoreState::RUNNING)
    }

    /// Aggregate per-task runtimes over all SUCCEEDED tasks.
    pub fn runtime(&self) -> StoreResult<RuntimeReport> {
        let succeeded_ids: Vec<String> = self
            .conn
            .prepare("SELECT TASK_ID FROM TASKS WHERE STATE = ?1")?
            .query_map(params![TaskState::SUCCEEDED.to_string()], |r| r.get(0))?
            .collect::<Result<_, _>>()?;

        let mut total = 0.0;
        let mut count = 0i64;
        let mut min: Option<(String, f64)> = None;
        let mut max: Option<(String, f64)> = None;

        for id in succeeded_ids {
            let logs = self.logs_for(&id)?;
            if let Some(seconds) = Self::extract_runtime(&logs) {
                total += seconds;
                count += 1;
                if min.as_ref().map_or(true, |(_, m)| seconds < *m) {
                    min = Some((id.clone(), seconds));
                }
                if max.as_ref().map_or(true, |(_, m)| seconds > *m) {
                    max = Some((id.clone(), seconds));
                }
            }
        }

        let mean = if count > 0 { total / count as f64 } else { 0.0 };
        Ok(RuntimeReport {
            total_seconds: total,
            num_succeeded: count,
            mean_seconds: mean,
            min,
            max,
        })
    }

    /// Escape hatch used primarily by tests; gated behind this explicit
    /// method name rather than exposed on the main contract so the call
    /// site is always auditable.
    pub fn unsafe_query(&self, sql: &str) -> StoreResult<Vec<Vec<String>>> {
        self.with_lock(LockMode::Exclusive, "query", |conn| {
            let mut stmt = conn.prepare(sql)?;
            let n = stmt.column_count();
            let rows = stmt
                .query_map([], |r| {
                    (0..n)
                        .map(|i| r.get::<_, Option<String>>(i).map(|v| v.unwrap_or_default()))
                        .collect::<rusqlite::Result<Vec<_>>>()
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.get() {
            tracing::warn!(
                client_id = %self.client_id,
                "store handle dropped without calling close(); client row may be stranded"
            );
        }
    }
}

/// Applies per-connection pragmas. Deliberately leaves `locking_mode` at its
/// default (`NORMAL`): cake's whole premise is multiple cooperating clients
/// sharing one database file, each serializing through `BEGIN EXCLUSIVE`
/// transactions that release on commit — `EXCLUSIVE` locking mode would have
/// the first connection retain the file lock for its entire lifetime and
/// lock every other client out permanently. `busy_timeout` gives SQLite's own
/// retry instead, underneath `lock::acquire`'s polling loop.
fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = {};\n\
         PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;",
        busy_timeout.as_millis()
    ))?;
    Ok(())
}

const SCHEMA_DDL: &str = "\
CREATE TABLE TASKS(
    TASK_ID TEXT PRIMARY KEY NOT NULL,
    CMD TEXT DEFAULT '',
    STATE TEXT DEFAULT 'QUEUED_NO_DEP',
    PRIORITY REAL DEFAULT 0
);
CREATE TABLE LOGS(
    LOG_ID INTEGER PRIMARY KEY AUTOINCREMENT,
    ACTION TEXT DEFAULT 'ADDED',
    INFO TEXT DEFAULT '',
    TIME TIMESTAMP DEFAULT (STRFTIME('%Y-%m-%d %H:%M:%f', 'NOW')),
    TASK_ID TEXT,
    FOREIGN KEY(TASK_ID) REFERENCES TASKS(TASK_ID)
);
CREATE TABLE INFO(
    STATE TEXT DEFAULT 'PAUSED',
    CONFIG TEXT
);
CREATE TABLE CLIENTS(
    CLIENT_ID TEXT PRIMARY KEY NOT NULL
);";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir, name: &str) -> Store {
        Store::open(dir.path().join(name), StoreConfig::default()).unwrap()
    }

    #[test]
    fn create_then_reopen_merges_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let s1 = Store::open(&path, StoreConfig::default()).unwrap();
        s1.close().unwrap();

        let overrides = StoreConfig {
            timeout: 2.0,
            ..StoreConfig::default()
        };
        let s2 = Store::open(&path, overrides).unwrap();
        assert_eq!(s2.timeout.as_secs_f64(), 2.0);
        s2.close().unwrap();
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("t1".into()), None).unwrap();
        let err = s.add("echo 2", Some("t1".into()), None).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityFailure(_)));
        // no partial insert: task still has the original command
        let (task, _) = s.log("t1").unwrap();
        assert_eq!(task.cmd, "echo 1");
    }

    #[test]
    fn add_multiple_fails_atomically_on_collision() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("dup".into()), None).unwrap();

        let cmds = vec!["echo a".to_string(), "echo b".to_string()];
        let ids = vec!["dup".to_string(), "fresh".to_string()];
        let err = s.add_multiple(&cmds, Some(ids), 0.0).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityFailure(_)));
        assert!(s.log("fresh").is_err());
    }

    #[test]
    fn checkout_selects_highest_priority_and_marks_running() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo low", Some("low".into()), Some(1.0)).unwrap();
        s.add("echo high", Some("high".into()), Some(5.0)).unwrap();

        let (cmd, id) = s.checkout(None).unwrap().unwrap();
        assert_eq!(id, "high");
        assert_eq!(cmd, "echo high");

        let (task, logs) = s.log("high").unwrap();
        assert_eq!(task.state, TaskState::RUNNING);
        assert_eq!(logs.last().unwrap().action, LogAction::RAN);
    }

    #[test]
    fn checkout_on_empty_queue_returns_none() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        assert_eq!(s.checkout(Some(TaskState::FAILED)).unwrap(), None);
    }

    #[test]
    fn checkin_rejects_illegal_outcome() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("t1".into()), None).unwrap();
        s.checkout(None).unwrap();
        let err = s.checkin("t1", TaskState::QUEUED_NO_DEP, "").unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn checkpointed_checkout_writes_ran_from_checkpoint() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("t1".into()), None).unwrap();
        s.checkout(None).unwrap();
        s.checkin("t1", TaskState::CHECKPOINTED, "").unwrap();

        let (_, id) = s.checkout(None).unwrap().unwrap();
        assert_eq!(id, "t1");
        let (_, logs) = s.log("t1").unwrap();
        assert_eq!(logs.last().unwrap().action, LogAction::RAN_FROM_CHECKPOINT);
    }

    #[test]
    fn reset_requeues_all_non_deleted_and_drops_other_clients() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let s = Store::open(&path, StoreConfig::default()).unwrap();
        let _other = Store::open(&path, StoreConfig::default()).unwrap();

        s.add("echo 1", Some("t1".into()), None).unwrap();
        s.add("echo 2", Some("t2".into()), None).unwrap();
        s.delete("t2", false).unwrap();
        s.checkout(None).unwrap();

        s.reset().unwrap();

        let rows = s.list(None).unwrap();
        let t1 = rows.iter().find(|r| r.task_id == "t1").unwrap();
        assert_eq!(t1.state, TaskState::QUEUED_NO_DEP);
        let t2 = rows.iter().find(|r| r.task_id == "t2").unwrap();
        assert_eq!(t2.state, TaskState::DELETED);

        let report = s.status().unwrap();
        assert_eq!(report.num_clients, 1);
    }

    #[test]
    fn cleanup_marks_running_tasks_killed() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("t1".into()), None).unwrap();
        s.checkout(None).unwrap();

        s.cleanup().unwrap();

        let (task, logs) = s.log("t1").unwrap();
        assert_eq!(task.state, TaskState::KILLED);
        assert_eq!(logs.last().unwrap().action, LogAction::CLEANED);
        assert_eq!(s.state().unwrap(), StoreState::PAUSED);
    }

    #[test]
    fn close_by_last_client_forces_paused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let s = Store::open(&path, StoreConfig::default()).unwrap();
        s.run().unwrap();
        assert_eq!(s.state().unwrap(), StoreState::RUNNING);
        s.close().unwrap();

        let s2 = Store::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(s2.state().unwrap(), StoreState::PAUSED);
        s2.close().unwrap();
    }

    #[test]
    fn runtime_report_reflects_ran_to_succeeded_span() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("t1".into()), None).unwrap();
        s.checkout(None).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        s.checkin("t1", TaskState::SUCCEEDED, "").unwrap();

        let report = s.runtime().unwrap();
        assert_eq!(report.num_succeeded, 1);
        assert!(report.total_seconds >= 0.0);
        assert_eq!(report.min.as_ref().unwrap().0, "t1");
    }

    #[test]
    fn runtime_ignores_tasks_reset_after_run() {
        let dir = tempdir().unwrap();
        let s = open(&dir, "db.sqlite");
        s.add("echo 1", Some("t1".into()), None).unwrap();
        s.checkout(None).unwrap();
        s.checkin("t1", TaskState::SUCCEEDED, "").unwrap();
        s.update("t1", None, None, Some(TaskState::SUCCEEDED)).unwrap();

        let (_, logs) = s.log("t1").unwrap();
        assert!(Store::extract_runtime(&logs).is_none());
    }
}
