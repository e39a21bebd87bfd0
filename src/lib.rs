//! Single-writer ledger: transactions are version-checked against a key-value
//! store, batched into fixed-capacity blocks chained by hash, and committed
//! blocks are appended to a log by a background task.
//!
//! - [`validator`] - version checks against the store
//! - [`chain`] - block assembly and commit
//! - [`pipeline`] - ordered handoff to the append-only log
//! - [`ledger`] - reading the log back

#![forbid(unsafe_code)]

pub mod block;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod store;
pub mod tx;
pub mod validator;

pub use block::{Block, BlockStatus, GENESIS_PREV_HASH};
pub use chain::{AddOutcome, Blockchain, SharedBlockchain};
pub use error::{LedgerError, Result};
pub use tx::{Payload, Rejection, SubPayload, Transaction};
