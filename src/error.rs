//! Error types for the ledger.

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Store(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("entry {key} declares a non-finite version")]
    InvalidVersion { key: String },
    #[error("block {block_number} is full ({capacity} transactions)")]
    BlockFull { block_number: u64, capacity: usize },
    #[error("block {block_number} has no transactions to commit")]
    EmptyBlock { block_number: u64 },
    #[error("block {block_number} is already committed")]
    BlockSealed { block_number: u64 },
    #[error("timed out after {timeout:?} handing block {block_number} to the persistence pipeline")]
    HandoffTimeout { block_number: u64, timeout: Duration },
    #[error("persistence pipeline closed before block {block_number} was handed off")]
    PipelineClosed { block_number: u64 },
    #[error("persistence task failed: {0}")]
    PipelineTask(#[from] tokio::task::JoinError),
    #[error("malformed ledger record at line {line}")]
    Decode { line: usize },
    #[error("ledger index lock poisoned")]
    IndexPoisoned,
}

pub type Result<T> = std::result::Result<T, LedgerError>;
