//! Core of the Tessera sharding middleware: statement parsing and
//! shard-key extraction, routing algorithms, per-kind query executors, the
//! connection manager, and the distributed transaction coordinator.
//!
//! Backend drivers live in their own crates (`tessera_driver_mysql`,
//! `tessera_driver_sqlite`) and plug in through the [`Adapter`] trait.

mod adapter;
mod algorithm;
mod config;
mod connection;
mod database;
mod debug;
mod environment;
mod error;
mod executor;
mod parser;
mod query;
mod replay;
mod transaction;
mod value;

#[cfg(test)]
pub(crate) mod testutil;

pub use adapter::{
    Adapter, BackendConnection, BackendTransaction, ExecResult, IsolationLevel, PoolOptions, Row,
    Rows, TxOptions,
};
pub use algorithm::{HashSlot, Modulo, ShardingAlgorithm, HASH_SLOT_COUNT};
pub use config::{Config, DatabaseConfig, ShardEntry, TableConfig};
pub use connection::{ConnectionManager, ShardBackend, TableConnection};
pub use database::{Database, Stmt};
pub use debug::verbose;
pub use environment::{
    global, AfterCommitFailureHook, AfterCommitSuccessHook, AlgorithmFactory, BeforeCommitHook,
    Environment,
};
pub use error::{join_errors, ShardError};
pub use parser::Parser;
pub use query::{DeleteQuery, InsertQuery, ParsedQuery, QueryBase, QueryKind, ValueProvider};
pub use transaction::{Transaction, WriteQuery};
pub use value::{escape_string, Value};
