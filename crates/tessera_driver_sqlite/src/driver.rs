use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, InterruptHandle};
use std::sync::{Arc, Mutex};
use tessera_core::{
    Adapter, BackendConnection, BackendTransaction, DatabaseConfig, ExecResult, PoolOptions,
    Rows, ShardError, TxOptions, Value,
};

/// SQLite adapter: file-backed, one `rusqlite` connection per backend.
#[derive(Debug)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the adapter in the process-wide environment.
pub fn register() {
    tessera_core::global().register_adapter(Arc::new(SqliteAdapter::new()));
}

impl Adapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn open_connection(
        &self,
        config: &DatabaseConfig,
        query_string: &str,
    ) -> Result<Box<dyn BackendConnection>, ShardError> {
        let path = config.database.clone();
        if path.is_empty() {
            return Err(ShardError::invalid_config(
                "sqlite backend requires a database file path",
            ));
        }
        let conn = RusqliteConnection::open(&path).map_err(ShardError::backend)?;
        let interrupt_handle = conn.get_interrupt_handle();
        let dsn = if query_string.is_empty() {
            path.clone()
        } else {
            format!("{path}?{query_string}")
        };
        Ok(Box::new(SqliteConnection {
            path,
            dsn,
            conn: Mutex::new(conn),
            interrupt_handle,
        }))
    }

    /// No-op: the database file is created on open.
    fn exec_ddl(&self, _config: &DatabaseConfig) -> Result<(), ShardError> {
        Ok(())
    }

    fn current_sequence_id(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<i64, ShardError> {
        let rows = conn.query(
            &format!("SELECT seq_id FROM {table}_ids WHERE id = 0"),
            &[],
        )?;
        rows.scalar_i64()
            .ok_or_else(|| ShardError::backend(format!("sequencer row for {table} is missing")))
    }

    fn next_sequence_id(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<i64, ShardError> {
        conn.exec(
            &format!("UPDATE {table}_ids SET seq_id = seq_id + 1 WHERE id = 0"),
            &[],
        )?;
        self.current_sequence_id(conn, table)
    }

    fn create_sequencer_table_if_not_exists(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<(), ShardError> {
        conn.exec(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table}_ids \
                 (id INTEGER PRIMARY KEY AUTOINCREMENT, seq_id INTEGER NOT NULL)"
            ),
            &[],
        )?;
        Ok(())
    }

    fn insert_row_to_sequencer_if_not_exists(
        &self,
        conn: &dyn BackendConnection,
        table: &str,
    ) -> Result<(), ShardError> {
        conn.exec(
            &format!(
                "INSERT INTO {table}_ids (id, seq_id) SELECT 0, 1 \
                 WHERE NOT EXISTS (SELECT 1 FROM {table}_ids WHERE id = 0)"
            ),
            &[],
        )?;
        Ok(())
    }
}

pub struct SqliteConnection {
    path: String,
    dsn: String,
    conn: Mutex<RusqliteConnection>,
    interrupt_handle: InterruptHandle,
}

impl BackendConnection for SqliteConnection {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, ShardError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ShardError::backend(format!("connection lock poisoned: {e}")))?;
        run_exec(&conn, sql, args)
    }

    fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, ShardError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ShardError::backend(format!("connection lock poisoned: {e}")))?;
        run_query(&conn, sql, args)
    }

    /// Open a dedicated connection to the same file; statements executed
    /// outside the transaction keep using the primary connection and stay
    /// invisible to it.
    fn begin(&self, options: &TxOptions) -> Result<Box<dyn BackendTransaction>, ShardError> {
        let conn = RusqliteConnection::open(&self.path).map_err(ShardError::backend)?;
        // SQLite transactions are always serializable; the isolation option
        // has nothing to map to.
        let begin = if options.read_only {
            "BEGIN; PRAGMA query_only = ON"
        } else {
            "BEGIN"
        };
        conn.execute_batch(begin).map_err(ShardError::backend)?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }

    fn set_pool_options(&self, options: &PoolOptions) -> Result<(), ShardError> {
        // One connection per backend file; nothing to resize.
        log::debug!("[POOL] sqlite backend {} ignores {options:?}", self.dsn);
        Ok(())
    }

    fn cancel_active(&self) -> Result<(), ShardError> {
        self.interrupt_handle.interrupt();
        log::debug!("[CANCEL] interrupt sent to {}", self.dsn);
        Ok(())
    }

    fn close(&self) -> Result<(), ShardError> {
        Ok(())
    }
}

struct SqliteTransaction {
    conn: RusqliteConnection,
    finished: bool,
}

impl BackendTransaction for SqliteTransaction {
    fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult, ShardError> {
        run_exec(&self.conn, sql, args)
    }

    fn query(&mut self, sql: &str, args: &[Value]) -> Result<Rows, ShardError> {
        run_query(&self.conn, sql, args)
    }

    fn commit(&mut self) -> Result<(), ShardError> {
        if self.finished {
            return Ok(());
        }
        self.conn
            .execute_batch("COMMIT")
            .map_err(ShardError::backend)?;
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ShardError> {
        if self.finished {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(ShardError::backend)?;
        self.finished = true;
        Ok(())
    }
}

/// Borrowed bridge from the middleware value type to `rusqlite` binding.
struct SqlValue<'a>(&'a Value);

impl rusqlite::ToSql for SqlValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::ToSqlOutput;
        use rusqlite::types::Value as SqliteValue;
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(if *b { 1 } else { 0 })),
            Value::Int(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            Value::UInt(u) => ToSqlOutput::Owned(SqliteValue::Integer(*u as i64)),
            Value::Float(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Owned(SqliteValue::Text(s.clone())),
            Value::Bytes(b) => ToSqlOutput::Owned(SqliteValue::Blob(b.clone())),
            Value::DateTime(dt) => ToSqlOutput::Owned(SqliteValue::Text(
                dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            )),
        })
    }
}

fn run_exec(
    conn: &RusqliteConnection,
    sql: &str,
    args: &[Value],
) -> Result<ExecResult, ShardError> {
    let params = rusqlite::params_from_iter(args.iter().map(SqlValue));
    let affected = conn.execute(sql, params).map_err(ShardError::backend)?;
    Ok(ExecResult::new(conn.last_insert_rowid(), affected as u64))
}

fn run_query(conn: &RusqliteConnection, sql: &str, args: &[Value]) -> Result<Rows, ShardError> {
    let mut stmt = conn.prepare(sql).map_err(ShardError::backend)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let params = rusqlite::params_from_iter(args.iter().map(SqlValue));
    let mut result_rows = stmt.query(params).map_err(ShardError::backend)?;

    let mut rows = Vec::new();
    while let Some(row) = result_rows.next().map_err(ShardError::backend)? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get_ref(i).map_err(ShardError::backend)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::Int(i),
                ValueRef::Real(f) => Value::Float(f),
                ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            };
            values.push(value);
        }
        rows.push(values);
    }
    Ok(Rows { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str) -> Box<dyn BackendConnection> {
        let config = DatabaseConfig {
            database: dir.path().join(name).to_string_lossy().into_owned(),
            adapter: "sqlite".to_string(),
            ..Default::default()
        };
        SqliteAdapter::new().open_connection(&config, "").unwrap()
    }

    #[test]
    fn exec_and_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir, "rt.db");
        conn.exec("CREATE TABLE t (id integer, name text)", &[])
            .unwrap();
        let result = conn
            .exec(
                "INSERT INTO t (id, name) VALUES (?, ?)",
                &[Value::Int(1), Value::Text("alice".to_string())],
            )
            .unwrap();
        assert_eq!(result.rows_affected, 1);

        let rows = conn
            .query("SELECT name FROM t WHERE id = ?", &[Value::Int(1)])
            .unwrap();
        assert_eq!(rows.columns, vec!["name".to_string()]);
        assert_eq!(rows.rows, vec![vec![Value::Text("alice".to_string())]]);
    }

    #[test]
    fn sequencer_allocates_monotonically() {
        let dir = TempDir::new().unwrap();
        let adapter = SqliteAdapter::new();
        let conn = open(&dir, "seq.db");
        adapter
            .create_sequencer_table_if_not_exists(conn.as_ref(), "users")
            .unwrap();
        adapter
            .insert_row_to_sequencer_if_not_exists(conn.as_ref(), "users")
            .unwrap();
        // Seeding twice must not reset the counter.
        adapter
            .insert_row_to_sequencer_if_not_exists(conn.as_ref(), "users")
            .unwrap();

        let first = adapter.next_sequence_id(conn.as_ref(), "users").unwrap();
        let second = adapter.next_sequence_id(conn.as_ref(), "users").unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(
            adapter.current_sequence_id(conn.as_ref(), "users").unwrap(),
            second
        );
    }

    #[test]
    fn transaction_commit_makes_writes_visible() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir, "tx.db");
        conn.exec("CREATE TABLE t (id integer)", &[]).unwrap();

        let mut tx = conn.begin(&TxOptions::default()).unwrap();
        tx.exec("INSERT INTO t (id) VALUES (1)", &[]).unwrap();

        // Uncommitted writes are invisible to the primary connection.
        let rows = conn.query("SELECT id FROM t", &[]).unwrap();
        assert!(rows.is_empty());

        tx.commit().unwrap();
        let rows = conn.query("SELECT id FROM t", &[]).unwrap();
        assert_eq!(rows.rows.len(), 1);
    }

    #[test]
    fn transaction_rollback_discards_writes() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir, "rb.db");
        conn.exec("CREATE TABLE t (id integer)", &[]).unwrap();

        let mut tx = conn.begin(&TxOptions::default()).unwrap();
        tx.exec("INSERT INTO t (id) VALUES (1)", &[]).unwrap();
        tx.rollback().unwrap();
        tx.rollback().unwrap();

        let rows = conn.query("SELECT id FROM t", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn query_string_lands_in_the_dsn() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            database: dir.path().join("qs.db").to_string_lossy().into_owned(),
            adapter: "sqlite".to_string(),
            ..Default::default()
        };
        let conn = SqliteAdapter::new()
            .open_connection(&config, "cache=shared")
            .unwrap();
        assert!(conn.dsn().ends_with("qs.db?cache=shared"));
    }
}
