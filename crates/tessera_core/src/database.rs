use crate::adapter::{ExecResult, Row, Rows, TxOptions};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::environment::{self, Environment};
use crate::error::ShardError;
use crate::executor;
use crate::parser::Parser;
use crate::transaction::Transaction;
use crate::value::Value;
use std::sync::Arc;
use std::time::Duration;

/// A prepared statement.
///
/// Preparation is deferred: the statement keeps its original text and is
/// parsed per execution, when the bound arguments (and therefore the shard
/// key) are known. Keeping the text is also what lets transactional
/// statement executions land in the write/read log.
#[derive(Debug, Clone)]
pub struct Stmt {
    query: String,
}

impl Stmt {
    pub(crate) fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }
}

/// The logical database: one handle over every configured table and shard.
///
/// Cheap to clone; clones share the connection manager. Safe to use from
/// multiple threads. Statements outside a transaction route directly to
/// their shard(s); [`Database::begin`] returns a single-owner
/// [`Transaction`] for multi-statement work.
#[derive(Clone)]
pub struct Database {
    manager: Arc<ConnectionManager>,
    parser: Parser,
    env: Arc<Environment>,
}

impl Database {
    /// Open against the process-wide environment.
    pub fn open(config: Config) -> Result<Self, ShardError> {
        Self::open_with_dsn(config, "")
    }

    /// Open with an application DSN whose optional `?key=value` fragment is
    /// forwarded unchanged to every adapter.
    pub fn open_with_dsn(config: Config, dsn: &str) -> Result<Self, ShardError> {
        Self::open_with_env(environment::global(), config, dsn)
    }

    /// Open against an isolated environment (tests, embedding).
    pub fn open_with_env(
        env: Arc<Environment>,
        config: Config,
        dsn: &str,
    ) -> Result<Self, ShardError> {
        let manager = Arc::new(ConnectionManager::new(env.clone(), config, dsn)?);
        let parser = Parser::new(manager.config());
        Ok(Self {
            manager,
            parser,
            env,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub(crate) fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Execute a mutating statement, routing it to its shard(s).
    pub fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, ShardError> {
        let parsed = self.parser.parse(query, args)?;
        let conn = self.manager.connection_by_table(parsed.table())?;
        executor::exec(&conn, parsed, None)
    }

    /// Execute a read statement. Without a resolved shard key the read
    /// scatters to every shard and concatenates the row sets in shard
    /// order.
    pub fn query(&self, query: &str, args: &[Value]) -> Result<Rows, ShardError> {
        let parsed = self.parser.parse(query, args)?;
        let conn = self.manager.connection_by_table(parsed.table())?;
        executor::query(&conn, parsed, None)
    }

    /// Execute a read statement expected to yield at most one row.
    pub fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>, ShardError> {
        let parsed = self.parser.parse(query, args)?;
        let conn = self.manager.connection_by_table(parsed.table())?;
        executor::query_row(&conn, parsed, None)
    }

    pub fn prepare(&self, query: &str) -> Result<Stmt, ShardError> {
        self.parser.check(query)?;
        Ok(Stmt::new(query))
    }

    pub fn exec_stmt(&self, stmt: &Stmt, args: &[Value]) -> Result<ExecResult, ShardError> {
        self.exec(stmt.query_text(), args)
    }

    pub fn query_stmt(&self, stmt: &Stmt, args: &[Value]) -> Result<Rows, ShardError> {
        self.query(stmt.query_text(), args)
    }

    pub fn query_row_stmt(&self, stmt: &Stmt, args: &[Value]) -> Result<Option<Row>, ShardError> {
        self.query_row(stmt.query_text(), args)
    }

    /// Start a logical transaction. No local transaction opens until the
    /// first statement touches a shard.
    pub fn begin(&self) -> Transaction {
        self.begin_with_options(TxOptions::default())
    }

    pub fn begin_with_options(&self, options: TxOptions) -> Transaction {
        Transaction::new(self.manager.clone(), self.env.clone(), options)
    }

    // --- Pool tuning ---

    pub fn set_max_idle_conns(&self, n: u32) -> Result<(), ShardError> {
        let mut options = self.manager.pool_options();
        options.max_idle_conns = Some(n);
        self.manager.set_pool_options(options)
    }

    pub fn set_max_open_conns(&self, n: u32) -> Result<(), ShardError> {
        let mut options = self.manager.pool_options();
        options.max_open_conns = Some(n);
        self.manager.set_pool_options(options)
    }

    pub fn set_conn_max_lifetime(&self, lifetime: Duration) -> Result<(), ShardError> {
        let mut options = self.manager.pool_options();
        options.conn_max_lifetime = Some(lifetime);
        self.manager.set_pool_options(options)
    }

    /// Close every backend handle, aggregating errors.
    pub fn close(&self) -> Result<(), ShardError> {
        self.manager.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_env;

    fn database() -> (Database, crate::testutil::FakeHandle) {
        let (env, fake) = test_env();
        let config = Config::from_str(
            r#"
tables:
  user_items:
    adapter: fake
    shard: true
    shard_key: user_id
    shards:
      - items_a:
          adapter: fake
          database: items_a
      - items_b:
          adapter: fake
          database: items_b
"#,
        )
        .unwrap();
        let db = Database::open_with_env(env, config, "").unwrap();
        (db, fake)
    }

    #[test]
    fn exec_routes_through_the_parser() {
        let (db, fake) = database();
        db.exec(
            "UPDATE user_items SET item = ? WHERE user_id = ?",
            &[Value::Text("axe".to_string()), Value::Int(2)],
        )
        .unwrap();
        assert_eq!(fake.statements("items_a").len(), 1);
        assert_eq!(
            fake.args_of_last("items_a").unwrap(),
            vec![Value::Text("axe".to_string()), Value::Int(2)]
        );
    }

    #[test]
    fn prepared_statement_round_trips() {
        let (db, fake) = database();
        let stmt = db
            .prepare("SELECT * FROM user_items WHERE user_id = ?")
            .unwrap();
        db.query_stmt(&stmt, &[Value::Int(3)]).unwrap();
        assert_eq!(fake.statements("items_b").len(), 1);
    }

    #[test]
    fn prepare_rejects_malformed_sql() {
        let (db, _fake) = database();
        assert!(db.prepare("SELEKT broken").is_err());
    }

    #[test]
    fn unknown_table_surfaces_from_routing() {
        let (db, _fake) = database();
        let err = db.query("SELECT * FROM ghosts", &[]).unwrap_err();
        assert!(matches!(err, ShardError::UnknownTable(_)));
    }

    #[test]
    fn pool_settings_propagate_to_open_backends() {
        let (db, _fake) = database();
        db.query("SELECT * FROM user_items", &[]).unwrap();
        db.set_max_open_conns(8).unwrap();
        assert_eq!(db.manager().pool_options().max_open_conns, Some(8));
    }
}
