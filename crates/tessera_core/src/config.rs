use crate::error::ShardError;
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::Read;
use std::path::Path;

/// One physical backend: a server-hosted database or an embedded file.
///
/// The same shape describes table-level backends, shard backends, and
/// sequencer backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database name (server-backed) or file path (embedded).
    #[serde(default)]
    pub database: String,
    /// Adapter registry key (e.g. `mysql`, `sqlite`).
    #[serde(default)]
    pub adapter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoding: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Master DSNs. Currently exactly one is permitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub master: Vec<String>,
    /// Accepted, not used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slave: Vec<String>,
    /// Accepted, not used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup: Vec<String>,
}

impl DatabaseConfig {
    fn validate(&self, context: &str) -> Result<(), ShardError> {
        if self.adapter.is_empty() {
            return Err(ShardError::invalid_config(format!(
                "{context}: adapter is required"
            )));
        }
        if self.master.len() > 1 {
            return Err(ShardError::invalid_config(format!(
                "{context}: exactly one master is permitted, found {}",
                self.master.len()
            )));
        }
        Ok(())
    }
}

/// A named shard backend. Serialized as a single-entry map keyed by the
/// shard name, preserving the declaration order of the `shards` list.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardEntry {
    pub name: String,
    pub config: DatabaseConfig,
}

impl Serialize for ShardEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = IndexMap::with_capacity(1);
        map.insert(self.name.clone(), self.config.clone());
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShardEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = IndexMap::<String, DatabaseConfig>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom(
                "shard entry must be a map with exactly one shard name",
            ));
        }
        let (name, config) = map.into_iter().next().expect("length checked above");
        Ok(ShardEntry { name, config })
    }
}

/// Declarative configuration of one logical table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(flatten)]
    pub backend: DatabaseConfig,
    /// Whether this table is horizontally partitioned.
    #[serde(default)]
    pub shard: bool,
    /// Column receiving a sequencer-allocated unique id at INSERT time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_column: Option<String>,
    /// Column whose value is fed to the sharding algorithm. Defaults to
    /// `shard_column` when omitted.
    #[serde(
        default,
        rename = "shard_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub shard_key_column: Option<String>,
    /// Sharding algorithm name; empty selects the default (modulo).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub algorithm: String,
    /// Embedded backend allocating `shard_column` values. Required iff
    /// `shard_column` is set on a sharded table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<DatabaseConfig>,
    /// Ordered list of shard backends.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<ShardEntry>,
}

impl TableConfig {
    /// The column fed to the sharding algorithm, falling back to the
    /// sequencer column when `shard_key` is not set.
    pub fn shard_key_column(&self) -> Option<&str> {
        self.shard_key_column
            .as_deref()
            .or(self.shard_column.as_deref())
    }

    pub fn shard_column(&self) -> Option<&str> {
        self.shard_column.as_deref()
    }

    fn validate(&self, table: &str) -> Result<(), ShardError> {
        if !self.shard {
            return self.backend.validate(table);
        }

        if self.shards.is_empty() {
            return Err(ShardError::invalid_config(format!(
                "table {table}: sharded table declares no shards"
            )));
        }
        for entry in &self.shards {
            entry
                .config
                .validate(&format!("table {table}, shard {}", entry.name))?;
        }

        let has_sequenced_column = self.shard_column.is_some();
        let has_key_column = self.shard_key_column.is_some();
        if !has_sequenced_column && !has_key_column {
            return Err(ShardError::invalid_config(format!(
                "table {table}: sharded table requires shard_column or shard_key"
            )));
        }
        if has_sequenced_column && self.sequencer.is_none() {
            return Err(ShardError::invalid_config(format!(
                "table {table}: shard_column requires a sequencer"
            )));
        }
        if let Some(sequencer) = &self.sequencer {
            sequencer.validate(&format!("table {table}, sequencer"))?;
        }
        Ok(())
    }
}

/// Whole-cluster configuration: the distributed-transaction toggle plus one
/// entry per logical table. Table order is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_true")]
    pub distributed_transaction: bool,
    #[serde(default)]
    pub tables: IndexMap<String, TableConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            distributed_transaction: true,
            tables: IndexMap::new(),
        }
    }
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ShardError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Load and validate YAML configuration from a reader.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, ShardError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::from_str(&text)
    }

    /// Parse and validate YAML configuration text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ShardError> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| ShardError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the load-time invariants for every table.
    pub fn validate(&self) -> Result<(), ShardError> {
        for (name, table) in &self.tables {
            table.validate(name)?;
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name)
    }

    pub fn is_shard_table(&self, name: &str) -> bool {
        self.tables.get(name).map(|t| t.shard).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARDED_YAML: &str = r#"
distributed_transaction: true
tables:
  users:
    adapter: sqlite
    shard: true
    shard_column: id
    algorithm: modulo
    sequencer:
      adapter: sqlite
      database: /tmp/users_seq.db
    shards:
      - users_a:
          adapter: sqlite
          database: /tmp/users_a.db
      - users_b:
          adapter: sqlite
          database: /tmp/users_b.db
  settings:
    adapter: sqlite
    database: /tmp/settings.db
"#;

    #[test]
    fn parses_sharded_yaml_preserving_shard_order() {
        let config = Config::from_str(SHARDED_YAML).unwrap();
        assert!(config.distributed_transaction);
        assert!(config.is_shard_table("users"));
        assert!(!config.is_shard_table("settings"));

        let users = config.table("users").unwrap();
        let names: Vec<&str> = users.shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["users_a", "users_b"]);
        assert_eq!(users.shard_key_column(), Some("id"));
    }

    #[test]
    fn distributed_transaction_defaults_to_true() {
        let config = Config::from_str("tables: {}").unwrap();
        assert!(config.distributed_transaction);
    }

    #[test]
    fn shard_column_without_sequencer_is_rejected() {
        let yaml = r#"
tables:
  users:
    adapter: sqlite
    shard: true
    shard_column: id
    shards:
      - a:
          adapter: sqlite
          database: a.db
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(matches!(err, ShardError::InvalidConfig(_)));
        assert!(err.to_string().contains("sequencer"));
    }

    #[test]
    fn sharded_table_without_any_key_column_is_rejected() {
        let yaml = r#"
tables:
  users:
    adapter: sqlite
    shard: true
    shards:
      - a:
          adapter: sqlite
          database: a.db
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(matches!(err, ShardError::InvalidConfig(_)));
    }

    #[test]
    fn shard_key_without_sequencer_is_accepted() {
        let yaml = r#"
tables:
  user_items:
    adapter: sqlite
    shard: true
    shard_key: user_id
    shards:
      - a:
          adapter: sqlite
          database: a.db
"#;
        let config = Config::from_str(yaml).unwrap();
        let table = config.table("user_items").unwrap();
        assert_eq!(table.shard_key_column(), Some("user_id"));
        assert_eq!(table.shard_column(), None);
    }

    #[test]
    fn multiple_masters_are_rejected() {
        let yaml = r#"
tables:
  users:
    adapter: mysql
    database: app
    master:
      - host1:3306
      - host2:3306
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("master"));
    }
}
