//! In-memory fake backend for exercising routing, executors, and the
//! transaction coordinator without a real database.

use crate::adapter::{
    Adapter, BackendConnection, BackendTransaction, ExecResult, Rows, TxOptions,
};
use crate::config::DatabaseConfig;
use crate::environment::Environment;
use crate::error::ShardError;
use crate::value::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct FakeState {
    statements: Mutex<HashMap<String, Vec<(String, Vec<Value>)>>>,
    chronological: Mutex<Vec<(String, String)>>,
    scripted_rows: Mutex<HashMap<String, VecDeque<Rows>>>,
    sequences: Mutex<HashMap<String, i64>>,
    exec_insert_ids: Mutex<HashMap<String, i64>>,
    fail_commit: Mutex<HashSet<String>>,
    closed: AtomicUsize,
    last_query_string: Mutex<Option<String>>,
}

impl FakeState {
    fn record(&self, dsn: &str, sql: &str, args: &[Value]) {
        self.statements
            .lock()
            .unwrap()
            .entry(dsn.to_string())
            .or_default()
            .push((sql.to_string(), args.to_vec()));
        self.chronological
            .lock()
            .unwrap()
            .push((dsn.to_string(), sql.to_string()));
    }

    fn next_rows(&self, dsn: &str) -> Rows {
        self.scripted_rows
            .lock()
            .unwrap()
            .get_mut(dsn)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default()
    }

    fn exec_insert_id(&self, dsn: &str) -> i64 {
        self.exec_insert_ids
            .lock()
            .unwrap()
            .get(dsn)
            .copied()
            .unwrap_or(0)
    }
}

/// Shared inspection handle for everything the fake backends saw.
#[derive(Clone)]
pub(crate) struct FakeHandle(Arc<FakeState>);

impl FakeHandle {
    /// Every statement executed against `dsn`, transactional or not, in
    /// execution order.
    pub(crate) fn statements(&self, dsn: &str) -> Vec<String> {
        self.0
            .statements
            .lock()
            .unwrap()
            .get(dsn)
            .map(|log| log.iter().map(|(sql, _)| sql.clone()).collect())
            .unwrap_or_default()
    }

    /// Every `(dsn, sql)` pair in chronological order across all backends.
    pub(crate) fn chronological(&self) -> Vec<(String, String)> {
        self.0.chronological.lock().unwrap().clone()
    }

    pub(crate) fn args_of_last(&self, dsn: &str) -> Option<Vec<Value>> {
        self.0
            .statements
            .lock()
            .unwrap()
            .get(dsn)
            .and_then(|log| log.last().map(|(_, args)| args.clone()))
    }

    /// Queue a row set to be returned by the next query against `dsn`.
    pub(crate) fn push_rows(&self, dsn: &str, rows: Rows) {
        self.0
            .scripted_rows
            .lock()
            .unwrap()
            .entry(dsn.to_string())
            .or_default()
            .push_back(rows);
    }

    /// Set the sequencer so that the next allocation returns `last + 1`.
    pub(crate) fn set_sequence(&self, dsn: &str, last: i64) {
        self.0
            .sequences
            .lock()
            .unwrap()
            .insert(dsn.to_string(), last);
    }

    /// Script the driver-reported last-insert-id for plain exec calls.
    pub(crate) fn set_exec_insert_id(&self, dsn: &str, id: i64) {
        self.0
            .exec_insert_ids
            .lock()
            .unwrap()
            .insert(dsn.to_string(), id);
    }

    /// Make every commit against `dsn` fail.
    pub(crate) fn fail_commit_on(&self, dsn: &str) {
        self.0.fail_commit.lock().unwrap().insert(dsn.to_string());
    }

    pub(crate) fn closed_count(&self) -> usize {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn last_query_string(&self) -> Option<String> {
        self.0.last_query_string.lock().unwrap().clone()
    }
}

pub(crate) struct FakeAdapter {
    state: Arc<FakeState>,
}

impl std::fmt::Debug for FakeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeAdapter").finish_non_exhaustive()
    }
}

impl FakeAdapter {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
        }
    }

    pub(crate) fn handle(&self) -> FakeHandle {
        FakeHandle(self.state.clone())
    }
}

impl Adapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open_connection(
        &self,
        config: &DatabaseConfig,
        query_string: &str,
    ) -> Result<Box<dyn BackendConnection>, ShardError> {
        *self.state.last_query_string.lock().unwrap() = if query_string.is_empty() {
            None
        } else {
            Some(query_string.to_string())
        };
        Ok(Box::new(FakeConnection {
            dsn: config.database.clone(),
            state: self.state.clone(),
        }))
    }

    fn exec_ddl(&self, _config: &DatabaseConfig) -> Result<(), ShardError> {
        Ok(())
    }

    fn current_sequence_id(
        &self,
        conn: &dyn BackendConnection,
        _table: &str,
    ) -> Result<i64, ShardError> {
        Ok(self
            .state
            .sequences
            .lock()
            .unwrap()
            .get(conn.dsn())
            .copied()
            .unwrap_or(0))
    }

    fn next_sequence_id(
        &self,
        conn: &dyn BackendConnection,
        _table: &str,
    ) -> Result<i64, ShardError> {
        let mut sequences = self.state.sequences.lock().unwrap();
        let next = sequences.get(conn.dsn()).copied().unwrap_or(0) + 1;
        sequences.insert(conn.dsn().to_string(), next);
        Ok(next)
    }

    fn create_sequencer_table_if_not_exists(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<(), ShardError> {
        conn.exec(
            &format!("CREATE TABLE IF NOT EXISTS {table}_ids (id INTEGER)"),
            &[],
        )?;
        Ok(())
    }

    fn insert_row_to_sequencer_if_not_exists(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<(), ShardError> {
        conn.exec(&format!("INSERT INTO {table}_ids (id) VALUES (0)"), &[])?;
        Ok(())
    }
}

struct FakeConnection {
    dsn: String,
    state: Arc<FakeState>,
}

impl BackendConnection for FakeConnection {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, ShardError> {
        self.state.record(&self.dsn, sql, args);
        Ok(ExecResult::new(self.state.exec_insert_id(&self.dsn), 1))
    }

    fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, ShardError> {
        self.state.record(&self.dsn, sql, args);
        Ok(self.state.next_rows(&self.dsn))
    }

    fn begin(&self, _options: &TxOptions) -> Result<Box<dyn BackendTransaction>, ShardError> {
        self.state.record(&self.dsn, "BEGIN", &[]);
        Ok(Box::new(FakeTransaction {
            dsn: self.dsn.clone(),
            state: self.state.clone(),
            finished: false,
        }))
    }

    fn close(&self) -> Result<(), ShardError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeTransaction {
    dsn: String,
    state: Arc<FakeState>,
    finished: bool,
}

impl BackendTransaction for FakeTransaction {
    fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult, ShardError> {
        self.state.record(&self.dsn, sql, args);
        Ok(ExecResult::new(self.state.exec_insert_id(&self.dsn), 1))
    }

    fn query(&mut self, sql: &str, args: &[Value]) -> Result<Rows, ShardError> {
        self.state.record(&self.dsn, sql, args);
        Ok(self.state.next_rows(&self.dsn))
    }

    fn commit(&mut self) -> Result<(), ShardError> {
        if self.finished {
            return Ok(());
        }
        if self.state.fail_commit.lock().unwrap().contains(&self.dsn) {
            return Err(ShardError::backend(format!(
                "scripted commit failure on {}",
                self.dsn
            )));
        }
        self.finished = true;
        self.state.record(&self.dsn, "COMMIT", &[]);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ShardError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.state.record(&self.dsn, "ROLLBACK", &[]);
        Ok(())
    }
}

/// Fresh environment with the fake adapter registered, plus its inspection
/// handle.
pub(crate) fn test_env() -> (Arc<Environment>, FakeHandle) {
    let env = Arc::new(Environment::new());
    let adapter = FakeAdapter::new();
    let handle = adapter.handle();
    env.register_adapter(Arc::new(adapter));
    (env, handle)
}
