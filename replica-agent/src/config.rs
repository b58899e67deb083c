//! Configuration management for the replica agent.
//!
//! Loads an optional TOML file and layers `REPLICA__`-prefixed environment
//! variables over it (`REPLICA__MASTER__URL=http://...`). Every field has a
//! default, so an empty file is a valid configuration.

use crate::replication::process::DEFAULT_PERMIT_BUDGET;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub master: MasterConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
    pub indexes: Vec<IndexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier, used in logs
    pub id: String,

    /// Control API port
    pub port: u16,

    /// Parent directory of index roots that are not set explicitly
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Base URL of the replica-master service
    pub url: String,

    /// Ask the master for zstd-compressed file bodies
    pub compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Semaphore permits shared by concurrent downloads of one round
    pub permit_budget: u32,

    /// Progress sampling period in milliseconds
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Index name, as known to the master
    pub name: String,

    /// Local index root; defaults to `<data_dir>/<name>`
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Six-field cron expression (`sec min hour day month weekday`)
    #[serde(default)]
    pub schedule: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "replica-01".to_string()),
            port: 9410,
            data_dir: PathBuf::from("/var/lib/replica"),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9400".to_string(),
            compression: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            permit_budget: DEFAULT_PERMIT_BUDGET,
            progress_interval_ms: 250,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("REPLICA")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly, without environment overrides
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn index_root(&self, index: &IndexConfig) -> PathBuf {
        index
            .root
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join(&index.name))
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() {
                anyhow::bail!("index name must not be empty");
            }
            if !seen.insert(index.name.as_str()) {
                anyhow::bail!("index {} is configured twice", index.name);
            }
        }
        if self.transfer.permit_budget == 0 {
            anyhow::bail!("transfer.permit_budget must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.node.port, 9410);
        assert_eq!(config.master.url, "http://localhost:9400");
        assert!(config.master.compression);
        assert_eq!(config.transfer.permit_budget, 64);
        assert_eq!(config.log.level, "info");
        assert!(config.indexes.is_empty());
    }

    #[test]
    fn test_indexes() {
        let config = Config::from_toml(
            r#"
            [node]
            data_dir = "/srv/replica"

            [master]
            url = "http://master:9400"
            compression = false

            [[indexes]]
            name = "books"
            schedule = "0 */5 * * * *"

            [[indexes]]
            name = "music"
            root = "/mnt/music"
            "#,
        )
        .unwrap();

        assert_eq!(config.indexes.len(), 2);
        assert_eq!(config.index_root(&config.indexes[0]), PathBuf::from("/srv/replica/books"));
        assert_eq!(config.index_root(&config.indexes[1]), PathBuf::from("/mnt/music"));
        assert_eq!(config.indexes[0].schedule.as_deref(), Some("0 */5 * * * *"));
        assert!(!config.master.compression);
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let err = Config::from_toml(
            r#"
            [[indexes]]
            name = "books"
            [[indexes]]
            name = "books"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("replica.toml");
        std::fs::write(&path, "[transfer]\npermit_budget = 8\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.transfer.permit_budget, 8);
        assert_eq!(config.transfer.progress_interval_ms, 250);
    }
}
