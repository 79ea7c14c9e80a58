use crate::adapter::{BackendTransaction, ExecResult, Row, Rows, TxOptions};
use crate::connection::{ConnectionManager, ShardBackend, TableConnection};
use crate::database::Stmt;
use crate::environment::Environment;
use crate::error::{join_errors, ShardError};
use crate::executor;
use crate::parser::Parser;
use crate::value::Value;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One captured statement: enough to replay the write against a clean
/// backend after a critical commit failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteQuery {
    pub query: String,
    pub args: Vec<Value>,
    pub last_insert_id: i64,
}

/// Coordinator state: enlisted local transactions, their first-use order,
/// and the write/read logs.
pub(crate) struct TxState {
    options: TxOptions,
    distributed: bool,
    /// DSNs in first-use order; this is the commit order.
    dsn_order: Vec<String>,
    handles: HashMap<String, Box<dyn BackendTransaction>>,
    /// Write entries per enlisted handle, keyed by DSN.
    handle_writes: HashMap<String, Vec<WriteQuery>>,
    write_log: Vec<WriteQuery>,
    read_log: Vec<WriteQuery>,
    /// Identity of the first logical connection touched; the legacy guard
    /// when distributed transactions are disabled.
    first_connection: Option<Arc<TableConnection>>,
    finished: bool,
}

impl TxState {
    pub(crate) fn new(options: TxOptions, distributed: bool) -> Self {
        Self {
            options,
            distributed,
            dsn_order: Vec::new(),
            handles: HashMap::new(),
            handle_writes: HashMap::new(),
            write_log: Vec::new(),
            read_log: Vec::new(),
            first_connection: None,
            finished: false,
        }
    }

    /// The local transaction handle for `shard`, beginning one lazily on
    /// first touch.
    pub(crate) fn handle_for(
        &mut self,
        conn: &Arc<TableConnection>,
        shard: &ShardBackend,
    ) -> Result<&mut Box<dyn BackendTransaction>, ShardError> {
        if self.finished {
            return Err(ShardError::backend("transaction is already finished"));
        }

        if !self.distributed {
            match &self.first_connection {
                Some(first) if **first != **conn => {
                    return Err(ShardError::CrossShardTxForbidden(shard.dsn.clone()));
                }
                Some(_) => {}
                None => self.first_connection = Some(conn.clone()),
            }
        }

        if !self.handles.contains_key(&shard.dsn) {
            if !self.distributed && !self.dsn_order.is_empty() {
                return Err(ShardError::CrossShardTxForbidden(shard.dsn.clone()));
            }
            let handle = shard.connection.begin(&self.options)?;
            debug!("[TX] began local transaction on {}", shard.dsn);
            self.dsn_order.push(shard.dsn.clone());
            self.handles.insert(shard.dsn.clone(), handle);
        }
        self.handles
            .get_mut(&shard.dsn)
            .ok_or_else(|| ShardError::backend("missing local transaction handle"))
    }

    pub(crate) fn log_write(
        &mut self,
        dsn: String,
        query: String,
        args: Vec<Value>,
        last_insert_id: i64,
    ) {
        let entry = WriteQuery {
            query,
            args,
            last_insert_id,
        };
        self.handle_writes
            .entry(dsn)
            .or_default()
            .push(entry.clone());
        self.write_log.push(entry);
    }

    pub(crate) fn log_read(&mut self, query: String, args: Vec<Value>) {
        self.read_log.push(WriteQuery {
            query,
            args,
            last_insert_id: 0,
        });
    }

    pub(crate) fn write_log(&self) -> &[WriteQuery] {
        &self.write_log
    }

    pub(crate) fn read_log(&self) -> &[WriteQuery] {
        &self.read_log
    }

    /// Commit every enlisted shard in first-use order.
    ///
    /// Phase 1 runs the before-commit hook against the full write log; an
    /// error aborts with nothing committed. Phase 2 commits shard by shard,
    /// counting committed write entries: a failure with the counter at zero
    /// aborts recoverably, a failure after that is critical and the
    /// remaining shards are still attempted. Phase 3 dispatches the
    /// success/failure hook; a hook error takes precedence over the joined
    /// commit errors.
    pub(crate) fn commit(&mut self, env: &Environment) -> Result<(), ShardError> {
        if self.finished {
            return Err(ShardError::backend("transaction is already finished"));
        }

        if let Some(hook) = env.before_commit_hook() {
            hook(&self.write_log)?;
        }

        let mut committed_writes = 0usize;
        let mut failed: Vec<WriteQuery> = Vec::new();
        let mut errors: Vec<ShardError> = Vec::new();

        for dsn in self.dsn_order.clone() {
            let handle = match self.handles.get_mut(&dsn) {
                Some(handle) => handle,
                None => continue,
            };
            match handle.commit() {
                Ok(()) => {
                    committed_writes += self
                        .handle_writes
                        .get(&dsn)
                        .map(|writes| writes.len())
                        .unwrap_or(0);
                }
                Err(e) if committed_writes == 0 => {
                    // Nothing committed yet: the caller may roll back and
                    // retry.
                    return Err(ShardError::CommitRecoverable(e.to_string()));
                }
                Err(e) => {
                    warn!("[COMMIT] critical failure on {dsn}: {e}");
                    if let Some(writes) = self.handle_writes.get(&dsn) {
                        failed.extend(writes.iter().cloned());
                    }
                    errors.push(e);
                }
            }
        }

        self.finished = true;

        if failed.is_empty() {
            if let Some(hook) = env.after_commit_success_hook() {
                hook()?;
            }
            return Ok(());
        }

        if let Some(hook) = env.after_commit_failure_hook() {
            hook(true, &failed)?;
        }
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(":");
        Err(ShardError::CommitCritical {
            committed: committed_writes,
            message,
        })
    }

    /// Roll back every enlisted handle, aggregating errors. Idempotent.
    pub(crate) fn rollback(&mut self) -> Result<(), ShardError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut errors = Vec::new();
        for (dsn, handle) in self.handles.iter_mut() {
            if let Err(e) = handle.rollback() {
                warn!("[ROLLBACK] failed on {dsn}: {e}");
                errors.push(e);
            }
        }
        join_errors(errors)
    }
}

/// One logical transaction spanning any number of shards.
///
/// Not safe for concurrent use: a transaction is single-owner and drives
/// its local handles serially. Local transactions begin lazily on the
/// first statement against each shard, and commit in exactly the order the
/// shards were first used.
pub struct Transaction {
    manager: Arc<ConnectionManager>,
    parser: Parser,
    env: Arc<Environment>,
    state: TxState,
}

impl Transaction {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        env: Arc<Environment>,
        options: TxOptions,
    ) -> Self {
        let distributed = manager.config().distributed_transaction;
        let parser = Parser::new(manager.config());
        Self {
            manager,
            parser,
            env,
            state: TxState::new(options, distributed),
        }
    }

    /// Execute a mutating statement inside this transaction.
    pub fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult, ShardError> {
        let parsed = self.parser.parse(query, args)?;
        let conn = self.manager.connection_by_table(parsed.table())?;
        executor::exec(&conn, parsed, Some(&mut self.state))
    }

    /// Execute a read statement inside this transaction. A scatter read
    /// (no shard key) escapes the transaction by design.
    pub fn query(&mut self, query: &str, args: &[Value]) -> Result<Rows, ShardError> {
        let parsed = self.parser.parse(query, args)?;
        let conn = self.manager.connection_by_table(parsed.table())?;
        executor::query(&conn, parsed, Some(&mut self.state))
    }

    pub fn query_row(&mut self, query: &str, args: &[Value]) -> Result<Option<Row>, ShardError> {
        let parsed = self.parser.parse(query, args)?;
        let conn = self.manager.connection_by_table(parsed.table())?;
        executor::query_row(&conn, parsed, Some(&mut self.state))
    }

    /// Prepare a statement bound to this transaction's lifetime. The
    /// statement keeps its original text so later exec/query calls land in
    /// the write/read log.
    pub fn prepare(&self, query: &str) -> Result<Stmt, ShardError> {
        self.parser.check(query)?;
        Ok(Stmt::new(query))
    }

    pub fn exec_stmt(&mut self, stmt: &Stmt, args: &[Value]) -> Result<ExecResult, ShardError> {
        self.exec(stmt.query_text(), args)
    }

    pub fn query_stmt(&mut self, stmt: &Stmt, args: &[Value]) -> Result<Rows, ShardError> {
        self.query(stmt.query_text(), args)
    }

    /// Commit every enlisted shard in first-use order. See [`TxState::commit`]
    /// for the recoverable/critical classification.
    pub fn commit(&mut self) -> Result<(), ShardError> {
        self.state.commit(&self.env)
    }

    /// Roll back every enlisted shard. Idempotent; a no-op when nothing was
    /// enlisted or the transaction already finished.
    pub fn rollback(&mut self) -> Result<(), ShardError> {
        self.state.rollback()
    }

    /// Every write executed under this transaction, in execution order.
    pub fn write_queries(&self) -> &[WriteQuery] {
        self.state.write_log()
    }

    /// Every read executed under this transaction (observability only).
    pub fn read_queries(&self) -> &[WriteQuery] {
        self.state.read_log()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::{test_env, FakeHandle};
    use std::sync::Mutex;

    fn config(distributed: bool) -> Config {
        Config::from_str(&format!(
            r#"
distributed_transaction: {distributed}
tables:
  users:
    adapter: fake
    shard: true
    shard_column: id
    sequencer:
      adapter: fake
      database: users_seq
    shards:
      - users_a:
          adapter: fake
          database: users_a
      - users_b:
          adapter: fake
          database: users_b
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
"#
        ))
        .unwrap()
    }

    fn setup(distributed: bool) -> (Arc<Environment>, Transaction, FakeHandle) {
        let (env, fake) = test_env();
        let manager =
            Arc::new(ConnectionManager::new(env.clone(), config(distributed), "").unwrap());
        let tx = Transaction::new(manager, env.clone(), TxOptions::default());
        (env, tx, fake)
    }

    fn commits_in_order(fake: &FakeHandle) -> Vec<String> {
        fake.chronological()
            .into_iter()
            .filter(|(_, sql)| sql == "COMMIT")
            .map(|(dsn, _)| dsn)
            .collect()
    }

    #[test]
    fn commit_order_follows_first_use() {
        let (_env, mut tx, fake) = setup(true);
        fake.set_sequence("users_seq", 0);

        // users id=1 -> users_b; user_items user_id=4 -> items_a.
        tx.exec("INSERT INTO users(id, name) VALUES(null, 'a')", &[])
            .unwrap();
        tx.exec(
            "INSERT INTO user_items(user_id, item) VALUES(?, 'x')",
            &[Value::Int(4)],
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(
            commits_in_order(&fake),
            vec!["users_b".to_string(), "items_a".to_string()]
        );
    }

    #[test]
    fn write_log_aggregates_in_execution_order() {
        let (_env, mut tx, fake) = setup(true);
        fake.set_sequence("users_seq", 6);

        tx.exec("INSERT INTO users(id, name) VALUES(null, 'a')", &[])
            .unwrap();
        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 4",
            &[],
        )
        .unwrap();

        let log = tx.write_queries();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].last_insert_id, 7);
        assert!(log[0].query.contains("INSERT INTO users"));
        assert!(log[1].query.contains("UPDATE user_items"));
    }

    #[test]
    fn reads_land_in_the_read_log_not_the_write_log() {
        let (_env, mut tx, _fake) = setup(true);
        tx.query("SELECT * FROM user_items WHERE user_id = 2", &[])
            .unwrap();
        assert_eq!(tx.write_queries().len(), 0);
        assert_eq!(tx.read_queries().len(), 1);
    }

    #[test]
    fn scatter_read_does_not_enlist_shards() {
        let (_env, mut tx, fake) = setup(true);
        tx.query("SELECT * FROM user_items", &[]).unwrap();
        let begins: Vec<_> = fake
            .chronological()
            .into_iter()
            .filter(|(_, sql)| sql == "BEGIN")
            .collect();
        assert!(begins.is_empty());
        tx.commit().unwrap();
    }

    #[test]
    fn second_dsn_is_forbidden_without_distributed_transactions() {
        let (_env, mut tx, _fake) = setup(false);
        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 4",
            &[],
        )
        .unwrap();
        let err = tx
            .exec(
                "UPDATE user_items SET item = 'y' WHERE user_id = 3",
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, ShardError::CrossShardTxForbidden(_)));
    }

    #[test]
    fn before_commit_hook_error_aborts_without_committing() {
        let (env, mut tx, fake) = setup(true);
        env.set_before_commit_hook(Arc::new(|_writes| {
            Err(ShardError::backend("vetoed by hook"))
        }));

        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 4",
            &[],
        )
        .unwrap();
        let err = tx.commit().unwrap_err();
        assert!(err.to_string().contains("vetoed by hook"));
        assert!(commits_in_order(&fake).is_empty());

        // The object is still live; rollback releases the shard.
        tx.rollback().unwrap();
        let rollbacks: Vec<_> = fake
            .chronological()
            .into_iter()
            .filter(|(_, sql)| sql == "ROLLBACK")
            .collect();
        assert_eq!(rollbacks.len(), 1);
    }

    #[test]
    fn first_shard_commit_failure_is_recoverable() {
        let (_env, mut tx, fake) = setup(true);
        fake.fail_commit_on("items_a");

        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 4",
            &[],
        )
        .unwrap();
        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 3",
            &[],
        )
        .unwrap();

        let err = tx.commit().unwrap_err();
        assert!(err.is_recoverable_commit());
        assert!(commits_in_order(&fake).is_empty());
        tx.rollback().unwrap();
    }

    #[test]
    fn later_shard_commit_failure_is_critical_and_reports_failed_writes() {
        let (env, mut tx, fake) = setup(true);
        fake.fail_commit_on("items_b");

        let captured: Arc<Mutex<Option<(bool, Vec<WriteQuery>)>>> =
            Arc::new(Mutex::new(None));
        let sink = captured.clone();
        env.set_after_commit_failure_hook(Arc::new(move |is_critical, failed| {
            *sink.lock().unwrap() = Some((is_critical, failed.to_vec()));
            Ok(())
        }));

        // user_id=4 -> items_a (commits first), user_id=3 -> items_b (fails).
        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 4",
            &[],
        )
        .unwrap();
        tx.exec(
            "UPDATE user_items SET item = 'z' WHERE user_id = 3",
            &[],
        )
        .unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, ShardError::CommitCritical { .. }));

        let (is_critical, failed) = captured.lock().unwrap().clone().unwrap();
        assert!(is_critical);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].query.contains("'z'"));
        assert_eq!(commits_in_order(&fake), vec!["items_a".to_string()]);
    }

    #[test]
    fn success_hooks_fire_once() {
        let (env, mut tx, _fake) = setup(true);
        let before_count = Arc::new(Mutex::new(0usize));
        let success_count = Arc::new(Mutex::new(0usize));
        let before_sink = before_count.clone();
        let success_sink = success_count.clone();
        env.set_before_commit_hook(Arc::new(move |writes| {
            assert_eq!(writes.len(), 1);
            *before_sink.lock().unwrap() += 1;
            Ok(())
        }));
        env.set_after_commit_success_hook(Arc::new(move || {
            *success_sink.lock().unwrap() += 1;
            Ok(())
        }));

        tx.exec(
            "UPDATE user_items SET item = 'y' WHERE user_id = 4",
            &[],
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(*before_count.lock().unwrap(), 1);
        assert_eq!(*success_count.lock().unwrap(), 1);
    }

    #[test]
    fn rollback_is_idempotent() {
        let (_env, mut tx, _fake) = setup(true);
        tx.rollback().unwrap();
        tx.rollback().unwrap();
    }
}
