use crate::adapter::{Adapter, BackendConnection, PoolOptions};
use crate::algorithm::ShardingAlgorithm;
use crate::config::{Config, TableConfig};
use crate::environment::Environment;
use crate::error::{join_errors, ShardError};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One physical shard backend: a stable name, a stable DSN, and the open
/// handle.
pub struct ShardBackend {
    pub name: String,
    pub dsn: String,
    pub connection: Arc<dyn BackendConnection>,
}

/// Runtime connection for one logical table.
///
/// A non-sharded table owns a single backend; a sharded table owns an
/// ordered list of shard backends, an optional sequencer handle, and the
/// resolved algorithm instance.
pub struct TableConnection {
    table: String,
    config: TableConfig,
    shards: Vec<ShardBackend>,
    sequencer: Option<Arc<dyn BackendConnection>>,
    algorithm: Option<Box<dyn ShardingAlgorithm>>,
    adapter: Arc<dyn Adapter>,
}

impl std::fmt::Debug for TableConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableConnection")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl TableConnection {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_shard(&self) -> bool {
        self.config.shard
    }

    pub fn shard_column(&self) -> Option<&str> {
        self.config.shard_column()
    }

    pub fn shard_key_column(&self) -> Option<&str> {
        self.config.shard_key_column()
    }

    /// Every backend of this table, in declaration order. For a non-sharded
    /// table this is the single backend.
    pub fn shards(&self) -> &[ShardBackend] {
        &self.shards
    }

    /// The single backend of a non-sharded table.
    pub fn single(&self) -> Result<&ShardBackend, ShardError> {
        self.shards
            .first()
            .ok_or_else(|| ShardError::backend("table connection has no backend"))
    }

    pub fn sequencer(&self) -> Option<&Arc<dyn BackendConnection>> {
        self.sequencer.as_ref()
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// The backend owning `key`, per the table's sharding algorithm.
    pub fn shard_for_key(&self, key: i64) -> Result<&ShardBackend, ShardError> {
        let algorithm = self.algorithm.as_ref().ok_or_else(|| {
            ShardError::backend(format!("table {} has no sharding algorithm", self.table))
        })?;
        let index = algorithm.shard_index(self.shards.len(), key)?;
        self.shards.get(index).ok_or_else(|| {
            ShardError::backend(format!(
                "algorithm selected shard {index} of {}",
                self.shards.len()
            ))
        })
    }

    fn close(&self) -> Vec<ShardError> {
        let mut errors = Vec::new();
        for shard in &self.shards {
            if let Err(e) = shard.connection.close() {
                errors.push(e);
            }
        }
        errors
    }
}

/// Connection identity: two logical connections are the same when they point
/// at the same backends. The legacy (non-distributed) transaction guard uses
/// this to reject cross-connection statements.
impl PartialEq for TableConnection {
    fn eq(&self, other: &Self) -> bool {
        if self.config.backend.database != other.config.backend.database
            || self.config.backend.master != other.config.backend.master
            || self.config.shard != other.config.shard
        {
            return false;
        }
        if self.config.shards.len() != other.config.shards.len() {
            return false;
        }
        self.config
            .shards
            .iter()
            .zip(&other.config.shards)
            .all(|(a, b)| {
                a.name == b.name
                    && a.config.database == b.config.database
                    && a.config.master == b.config.master
            })
    }
}

/// Owns the map from table name to its logical connection.
///
/// Connections open lazily on first lookup and live until `close`. The map
/// is reader/writer locked and safe to use from any thread. Sequencers are
/// bootstrapped eagerly when the manager is built.
pub struct ConnectionManager {
    env: Arc<Environment>,
    config: Arc<Config>,
    query_string: String,
    connections: RwLock<HashMap<String, Arc<TableConnection>>>,
    sequencers: RwLock<HashMap<String, Arc<dyn BackendConnection>>>,
    pool_options: RwLock<PoolOptions>,
}

impl ConnectionManager {
    /// Validate the configuration, bootstrap every sequencer, and return a
    /// manager ready to serve lookups. `dsn` is the application-supplied
    /// DSN; its optional `?key=value` fragment is forwarded unchanged to
    /// adapters.
    pub fn new(env: Arc<Environment>, config: Config, dsn: &str) -> Result<Self, ShardError> {
        config.validate()?;
        let query_string = dsn.split_once('?').map(|(_, qs)| qs).unwrap_or("").to_string();

        let manager = Self {
            env,
            config: Arc::new(config),
            query_string,
            connections: RwLock::new(HashMap::new()),
            sequencers: RwLock::new(HashMap::new()),
            pool_options: RwLock::new(PoolOptions::default()),
        };
        manager.bootstrap_sequencers()?;
        Ok(manager)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn environment(&self) -> Arc<Environment> {
        self.env.clone()
    }

    pub fn is_shard_table(&self, table: &str) -> bool {
        self.config.is_shard_table(table)
    }

    pub fn shard_column(&self, table: &str) -> Option<String> {
        self.config
            .table(table)
            .and_then(|t| t.shard_column())
            .map(str::to_owned)
    }

    pub fn shard_key_column(&self, table: &str) -> Option<String> {
        self.config
            .table(table)
            .and_then(|t| t.shard_key_column())
            .map(str::to_owned)
    }

    /// The logical connection for `table`, opening it on first use.
    pub fn connection_by_table(&self, table: &str) -> Result<Arc<TableConnection>, ShardError> {
        if let Some(conn) = self
            .connections
            .read()
            .expect("connection map poisoned")
            .get(table)
        {
            return Ok(conn.clone());
        }

        let built = Arc::new(self.open_table(table)?);
        let mut connections = self.connections.write().expect("connection map poisoned");
        // Another thread may have raced the open; first insert wins.
        Ok(connections
            .entry(table.to_string())
            .or_insert(built)
            .clone())
    }

    /// The bootstrapped sequencer handle for `table`, when one is
    /// configured.
    pub fn sequencer_by_table(&self, table: &str) -> Option<Arc<dyn BackendConnection>> {
        self.sequencers
            .read()
            .expect("sequencer map poisoned")
            .get(table)
            .cloned()
    }

    pub fn pool_options(&self) -> PoolOptions {
        *self.pool_options.read().expect("pool options poisoned")
    }

    /// Apply pool settings to every backend opened from now on and to every
    /// backend already open.
    pub fn set_pool_options(&self, options: PoolOptions) -> Result<(), ShardError> {
        *self.pool_options.write().expect("pool options poisoned") = options;
        let connections = self.connections.read().expect("connection map poisoned");
        let mut errors = Vec::new();
        for conn in connections.values() {
            for shard in conn.shards() {
                if let Err(e) = shard.connection.set_pool_options(&options) {
                    errors.push(e);
                }
            }
        }
        join_errors(errors)
    }

    /// Close every backend handle, aggregating errors.
    pub fn close(&self) -> Result<(), ShardError> {
        let mut errors = Vec::new();

        let connections: Vec<_> = {
            let mut map = self.connections.write().expect("connection map poisoned");
            map.drain().collect()
        };
        for (table, conn) in connections {
            let table_errors = conn.close();
            if table_errors.is_empty() {
                debug!("[CLOSE] closed connections for table {table}");
            }
            errors.extend(table_errors);
        }

        let sequencers: Vec<_> = {
            let mut map = self.sequencers.write().expect("sequencer map poisoned");
            map.drain().collect()
        };
        for (table, sequencer) in sequencers {
            if let Err(e) = sequencer.close() {
                errors.push(e);
            } else {
                debug!("[CLOSE] closed sequencer for table {table}");
            }
        }

        info!("[CLOSE] connection manager shut down");
        join_errors(errors)
    }

    fn bootstrap_sequencers(&self) -> Result<(), ShardError> {
        for (table, table_config) in &self.config.tables {
            let Some(sequencer_config) = &table_config.sequencer else {
                continue;
            };
            if !table_config.shard {
                continue;
            }
            let adapter = self.env.adapter(&sequencer_config.adapter)?;
            adapter.exec_ddl(sequencer_config)?;
            let conn = adapter.open_connection(sequencer_config, &self.query_string)?;
            adapter.create_sequencer_table_if_not_exists(conn.as_ref(), table)?;
            adapter.insert_row_to_sequencer_if_not_exists(conn.as_ref(), table)?;
            info!("[SEQUENCER] bootstrapped sequencer for table {table}");
            self.sequencers
                .write()
                .expect("sequencer map poisoned")
                .insert(table.clone(), Arc::from(conn));
        }
        Ok(())
    }

    fn open_table(&self, table: &str) -> Result<TableConnection, ShardError> {
        let table_config = self
            .config
            .table(table)
            .ok_or_else(|| ShardError::UnknownTable(table.to_string()))?;
        let pool_options = *self.pool_options.read().expect("pool options poisoned");

        if !table_config.shard {
            let adapter = self.env.adapter(&table_config.backend.adapter)?;
            adapter.exec_ddl(&table_config.backend)?;
            let conn = adapter.open_connection(&table_config.backend, &self.query_string)?;
            conn.set_pool_options(&pool_options)?;
            let backend = ShardBackend {
                name: table.to_string(),
                dsn: conn.dsn().to_string(),
                connection: Arc::from(conn),
            };
            debug!("[OPEN] table {table} -> {}", backend.dsn);
            return Ok(TableConnection {
                table: table.to_string(),
                config: table_config.clone(),
                shards: vec![backend],
                sequencer: None,
                algorithm: None,
                adapter,
            });
        }

        let mut shards = Vec::with_capacity(table_config.shards.len());
        let mut adapter = None;
        for entry in &table_config.shards {
            let shard_adapter = self.env.adapter(&entry.config.adapter)?;
            shard_adapter.exec_ddl(&entry.config)?;
            let conn = shard_adapter.open_connection(&entry.config, &self.query_string)?;
            conn.set_pool_options(&pool_options)?;
            let backend = ShardBackend {
                name: entry.name.clone(),
                dsn: conn.dsn().to_string(),
                connection: Arc::from(conn),
            };
            debug!("[OPEN] table {table}, shard {} -> {}", entry.name, backend.dsn);
            shards.push(backend);
            adapter.get_or_insert(shard_adapter);
        }
        let adapter =
            adapter.ok_or_else(|| ShardError::invalid_config("sharded table has no shards"))?;

        let mut algorithm = self.env.new_algorithm(&table_config.algorithm)?;
        algorithm.init(shards.len())?;

        Ok(TableConnection {
            table: table.to_string(),
            config: table_config.clone(),
            shards,
            sequencer: self.sequencer_by_table(table),
            algorithm: Some(algorithm),
            adapter,
        })
    }
}
