//! Configuration management for the ledger.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum number of transactions per block.
    pub block_capacity: usize,
    /// Directory of the key-value store.
    pub store_path: PathBuf,
    /// Append-only block log.
    pub log_path: PathBuf,
    /// Committed blocks that may wait for the log writer.
    pub pipeline_capacity: usize,
    pub handoff_timeout_ms: u64,
    /// Extra attempts after a failed log append.
    pub append_retries: u32,
    pub retry_backoff_ms: u64,
    /// Number of `SIM<n>` keys written at startup.
    pub seed_keys: u64,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            block_capacity: 3,
            store_path: PathBuf::from("ledger_db"),
            log_path: PathBuf::from("ledger.txt"),
            pipeline_capacity: 1,
            handoff_timeout_ms: 5_000,
            append_retries: 2,
            retry_backoff_ms: 50,
            seed_keys: 1_000,
            log_filter: "info".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Defaults, overlaid by the file at `path` when it exists, then by
    /// `LEDGER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config: LedgerConfig = builder
            .add_source(Environment::with_prefix("LEDGER").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_capacity == 0 {
            return Err(LedgerError::InvalidConfig(
                "block_capacity must be at least 1".to_string(),
            ));
        }
        if self.pipeline_capacity == 0 {
            return Err(LedgerError::InvalidConfig(
                "pipeline_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig::load(Some(dir.path().join("absent.toml").as_path())).unwrap();
        assert_eq!(config.block_capacity, 3);
        assert_eq!(config.pipeline_capacity, 1);
        assert_eq!(config.log_path, PathBuf::from("ledger.txt"));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "block_capacity = 5\nlog_path = \"blocks.log\"\nappend_retries = 0").unwrap();

        let config = LedgerConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.block_capacity, 5);
        assert_eq!(config.log_path, PathBuf::from("blocks.log"));
        assert_eq!(config.append_retries, 0);
        assert_eq!(config.handoff_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "block_capacity = 0\n").unwrap();

        let err = LedgerConfig::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidConfig(_)));
    }
}
