use crate::config::DatabaseConfig;
use crate::error::ShardError;
use crate::value::Value;
use std::time::Duration;

/// Result of a mutating statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

impl ExecResult {
    pub fn new(last_insert_id: i64, rows_affected: u64) -> Self {
        Self {
            last_insert_id,
            rows_affected,
        }
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Row set returned by a read statement.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Rows {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append another row set, keeping this set's column metadata when the
    /// other carries none. Used by scatter reads to concatenate per-shard
    /// results in shard order.
    pub fn extend(&mut self, other: Rows) {
        if self.columns.is_empty() {
            self.columns = other.columns;
        }
        self.rows.extend(other.rows);
    }

    /// The first cell of the first row coerced to an integer, for
    /// `SELECT COUNT(*)`-shaped queries.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self.rows.first().and_then(|row| row.first()) {
            Some(Value::Int(i)) => Some(*i),
            Some(Value::UInt(u)) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

/// Pool settings forwarded to every opened backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolOptions {
    pub max_idle_conns: Option<u32>,
    pub max_open_conns: Option<u32>,
    pub conn_max_lifetime: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for `begin_with_options`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

/// An open handle to one physical backend.
///
/// Implementations must be thread-safe; the middleware calls them from any
/// thread. `begin` opens a dedicated physical connection for the local
/// transaction so that statements executed outside the transaction (scatter
/// reads in particular) do not land inside it.
pub trait BackendConnection: Send + Sync {
    /// Stable DSN identifying this backend. Transaction enlistment and
    /// commit ordering key off this string.
    fn dsn(&self) -> &str;

    /// Execute a mutating statement with `?` placeholder binding.
    fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, ShardError>;

    /// Execute a read statement with `?` placeholder binding.
    fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, ShardError>;

    /// Open a local transaction on a dedicated connection.
    fn begin(&self, options: &TxOptions) -> Result<Box<dyn BackendTransaction>, ShardError>;

    /// Apply pool settings. Drivers without a pool acknowledge and log.
    fn set_pool_options(&self, _options: &PoolOptions) -> Result<(), ShardError> {
        Ok(())
    }

    /// Cancel the in-flight statement, when the backend supports it.
    fn cancel_active(&self) -> Result<(), ShardError> {
        Err(ShardError::NotSupported(
            "statement cancellation not supported by this backend".to_string(),
        ))
    }

    fn close(&self) -> Result<(), ShardError>;
}

/// A local transaction on one backend.
///
/// Single-owner: the coordinator drives it from one thread through `&mut`.
/// `commit` and `rollback` are idempotent once the transaction is finished.
pub trait BackendTransaction: Send {
    fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult, ShardError>;

    fn query(&mut self, sql: &str, args: &[Value]) -> Result<Rows, ShardError>;

    fn commit(&mut self) -> Result<(), ShardError>;

    fn rollback(&mut self) -> Result<(), ShardError>;
}

/// Backend driver: connection factory plus the sequencer contract.
///
/// Implementations are registered by name in the [`Environment`] and looked
/// up through the `adapter` key of each table configuration.
///
/// [`Environment`]: crate::Environment
pub trait Adapter: Send + Sync + std::fmt::Debug {
    /// Registry key (e.g. `mysql`, `sqlite`).
    fn name(&self) -> &'static str;

    /// Build a DSN from the config and open a single connection handle.
    /// `query_string` is the application-supplied DSN fragment, forwarded
    /// unchanged (e.g. `parseTime=true`).
    fn open_connection(
        &self,
        config: &DatabaseConfig,
        query_string: &str,
    ) -> Result<Box<dyn BackendConnection>, ShardError>;

    /// Create the database if necessary. No-op on file-backed engines.
    fn exec_ddl(&self, config: &DatabaseConfig) -> Result<(), ShardError>;

    /// Read the current identifier from the per-table sequencer row.
    fn current_sequence_id(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<i64, ShardError>;

    /// Atomically allocate and return the next identifier.
    fn next_sequence_id(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<i64, ShardError>;

    /// Bootstrap the sequencer table on first run.
    fn create_sequencer_table_if_not_exists(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<(), ShardError>;

    /// Seed the sequencer row on first run.
    fn insert_row_to_sequencer_if_not_exists(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<(), ShardError>;
}
