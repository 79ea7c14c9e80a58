//! Tessera: horizontal-sharding middleware for relational databases.
//!
//! Presents a single logical database over a set of backend SQL servers,
//! routing each statement to the correct shard, allocating globally unique
//! identifiers through sequencers, and coordinating writes that span
//! multiple shards within one logical transaction.
//!
//! ```no_run
//! use tessera::{Config, Database, Value};
//!
//! # fn main() -> Result<(), tessera::ShardError> {
//! tessera::register_builtin_adapters();
//! let config = Config::from_path("databases.yml")?;
//! let db = Database::open(config)?;
//! db.exec(
//!     "INSERT INTO users(id, name) VALUES(null, ?)",
//!     &[Value::from("alice")],
//! )?;
//! # Ok(())
//! # }
//! ```

pub use tessera_core::*;
pub use tessera_driver_mysql::MysqlAdapter;
pub use tessera_driver_sqlite::SqliteAdapter;

/// Register the built-in adapters (mysql, sqlite) in the process-wide
/// environment. Call once before opening a database; registering twice is
/// harmless.
pub fn register_builtin_adapters() {
    tessera_driver_mysql::register();
    tessera_driver_sqlite::register();
    log::debug!("[REGISTRY] built-in adapters registered");
}
