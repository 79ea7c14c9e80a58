use crate::adapter::Adapter;
use crate::algorithm::{HashSlot, Modulo, ShardingAlgorithm};
use crate::error::ShardError;
use crate::transaction::WriteQuery;
use log::warn;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type AlgorithmFactory = Arc<dyn Fn() -> Box<dyn ShardingAlgorithm> + Send + Sync>;

/// Invoked with the full write log before any shard commits; an error
/// aborts the commit with no shard touched.
pub type BeforeCommitHook = Arc<dyn Fn(&[WriteQuery]) -> Result<(), ShardError> + Send + Sync>;

/// Invoked once after every enlisted shard committed.
pub type AfterCommitSuccessHook = Arc<dyn Fn() -> Result<(), ShardError> + Send + Sync>;

/// Invoked when commit failed; receives `is_critical` and the write entries
/// of the shards that failed to commit.
pub type AfterCommitFailureHook =
    Arc<dyn Fn(bool, &[WriteQuery]) -> Result<(), ShardError> + Send + Sync>;

/// Process-wide middleware state: the adapter registry, the algorithm
/// registry, and the commit-hook slots.
///
/// All registries are reader/writer locked; registration happens during
/// startup, before any statement runs. Most callers use [`global`], but an
/// isolated `Environment` can be built for tests or embedding.
pub struct Environment {
    adapters: RwLock<HashMap<String, Arc<dyn Adapter>>>,
    algorithms: RwLock<HashMap<String, AlgorithmFactory>>,
    before_commit: RwLock<Option<BeforeCommitHook>>,
    after_commit_success: RwLock<Option<AfterCommitSuccessHook>>,
    after_commit_failure: RwLock<Option<AfterCommitFailureHook>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// An environment with the built-in algorithms (modulo, hashmap)
    /// registered and no adapters.
    pub fn new() -> Self {
        let mut algorithms: HashMap<String, AlgorithmFactory> = HashMap::new();
        algorithms.insert(
            "modulo".to_string(),
            Arc::new(|| Box::new(Modulo) as Box<dyn ShardingAlgorithm>),
        );
        algorithms.insert(
            "hashmap".to_string(),
            Arc::new(|| Box::new(HashSlot::default()) as Box<dyn ShardingAlgorithm>),
        );

        Self {
            adapters: RwLock::new(HashMap::new()),
            algorithms: RwLock::new(algorithms),
            before_commit: RwLock::new(None),
            after_commit_success: RwLock::new(None),
            after_commit_failure: RwLock::new(None),
        }
    }

    /// Register a backend adapter under its name.
    ///
    /// Duplicate registration is logged and ignored (plugins may be loaded
    /// twice); the first registration wins.
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let name = adapter.name().to_string();
        let mut adapters = self.adapters.write().expect("adapter registry poisoned");
        if adapters.contains_key(&name) {
            warn!("[REGISTRY] adapter {name} is already registered, keeping the first");
            return;
        }
        adapters.insert(name, adapter);
    }

    /// Look up an adapter by its registry name.
    pub fn adapter(&self, name: &str) -> Result<Arc<dyn Adapter>, ShardError> {
        self.adapters
            .read()
            .expect("adapter registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                ShardError::invalid_config(format!("adapter {name} is not registered"))
            })
    }

    /// Register a sharding algorithm factory under `name`.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration; two algorithms under one name is a
    /// programmer error.
    pub fn register_algorithm(&self, name: &str, factory: AlgorithmFactory) {
        let mut algorithms = self
            .algorithms
            .write()
            .expect("algorithm registry poisoned");
        if algorithms.contains_key(name) {
            panic!("sharding algorithm {name} is already registered");
        }
        algorithms.insert(name.to_string(), factory);
    }

    /// Build a fresh algorithm instance. The empty name aliases the default
    /// (modulo).
    pub fn new_algorithm(&self, name: &str) -> Result<Box<dyn ShardingAlgorithm>, ShardError> {
        let name = if name.is_empty() { "modulo" } else { name };
        let algorithms = self.algorithms.read().expect("algorithm registry poisoned");
        let factory = algorithms.get(name).ok_or_else(|| {
            ShardError::invalid_config(format!("sharding algorithm {name} is not registered"))
        })?;
        Ok(factory())
    }

    // --- Commit hooks ---

    pub fn set_before_commit_hook(&self, hook: BeforeCommitHook) {
        *self.before_commit.write().expect("hook slot poisoned") = Some(hook);
    }

    pub fn set_after_commit_success_hook(&self, hook: AfterCommitSuccessHook) {
        *self
            .after_commit_success
            .write()
            .expect("hook slot poisoned") = Some(hook);
    }

    pub fn set_after_commit_failure_hook(&self, hook: AfterCommitFailureHook) {
        *self
            .after_commit_failure
            .write()
            .expect("hook slot poisoned") = Some(hook);
    }

    pub(crate) fn before_commit_hook(&self) -> Option<BeforeCommitHook> {
        self.before_commit.read().expect("hook slot poisoned").clone()
    }

    pub(crate) fn after_commit_success_hook(&self) -> Option<AfterCommitSuccessHook> {
        self.after_commit_success
            .read()
            .expect("hook slot poisoned")
            .clone()
    }

    pub(crate) fn after_commit_failure_hook(&self) -> Option<AfterCommitFailureHook> {
        self.after_commit_failure
            .read()
            .expect("hook slot poisoned")
            .clone()
    }
}

static GLOBAL: Lazy<Arc<Environment>> = Lazy::new(|| Arc::new(Environment::new()));

/// The process-wide environment used by the convenience constructors.
pub fn global() -> Arc<Environment> {
    GLOBAL.clone()
}
