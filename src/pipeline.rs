//! Ordered handoff of committed blocks to the append-only log.
//!
//! Committers push blocks into a bounded channel through a [`BlockHandoff`];
//! a single background task drains it and appends each block to a
//! [`BlockSink`], so records land in the log in commit order.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::block::Block;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::LedgerIndex;

/// Destination of committed blocks.
pub trait BlockSink: Send + 'static {
    /// Appends one record and returns the byte offset it starts at.
    fn append(&mut self, block: &Block) -> Result<u64>;
}

/// Newline-delimited JSON log, one block per line.
pub struct LogWriter {
    path: PathBuf,
    file: File,
}

impl LogWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockSink for LogWriter {
    fn append(&mut self, block: &Block) -> Result<u64> {
        let mut record = serde_json::to_vec(block)?;
        record.push(b'\n');

        let offset = self.file.metadata()?.len();
        if let Err(err) = self.file.write_all(&record).and_then(|_| self.file.sync_data()) {
            // Drop whatever part of the record made it out.
            if let Err(trunc) = self.file.set_len(offset) {
                warn!(path = %self.path.display(), %trunc, "could not trim partial record");
            }
            return Err(err.into());
        }
        Ok(offset)
    }
}

/// Sending half of the pipeline, held by the committer.
#[derive(Clone)]
pub struct BlockHandoff {
    sender: mpsc::Sender<Block>,
    timeout: Duration,
}

impl BlockHandoff {
    /// Waits for room in the channel, at most the configured timeout.
    pub async fn send(&self, block: Block) -> Result<()> {
        let block_number = block.block_number;
        match tokio::time::timeout(self.timeout, self.sender.send(block)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LedgerError::PipelineClosed { block_number }),
            Err(_) => Err(LedgerError::HandoffTimeout {
                block_number,
                timeout: self.timeout,
            }),
        }
    }
}

/// What the persistence task did before the channel closed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Blocks written to the log, in log order.
    pub persisted: Vec<u64>,
    /// Committed blocks that never reached the log and need reconciliation.
    pub unpersisted: Vec<u64>,
}

pub struct PipelineHandle {
    task: JoinHandle<PipelineReport>,
    index: LedgerIndex,
}

impl PipelineHandle {
    /// Offsets of the records written so far.
    pub fn index(&self) -> LedgerIndex {
        self.index.clone()
    }

    /// Waits for the channel to drain. Every [`BlockHandoff`] must be dropped
    /// first or this never returns.
    pub async fn join(self) -> Result<PipelineReport> {
        Ok(self.task.await?)
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    backoff: Duration,
}

/// Starts the persistence task on the current runtime.
pub fn spawn_pipeline<S: BlockSink>(
    sink: S,
    index: LedgerIndex,
    config: &LedgerConfig,
) -> (BlockHandoff, PipelineHandle) {
    let (sender, receiver) = mpsc::channel(config.pipeline_capacity.max(1));
    let policy = RetryPolicy {
        retries: config.append_retries,
        backoff: config.retry_backoff(),
    };
    let task = tokio::spawn(persist_blocks(sink, receiver, index.clone(), policy));

    let handoff = BlockHandoff {
        sender,
        timeout: config.handoff_timeout(),
    };
    (handoff, PipelineHandle { task, index })
}

async fn persist_blocks<S: BlockSink>(
    mut sink: S,
    mut receiver: mpsc::Receiver<Block>,
    index: LedgerIndex,
    policy: RetryPolicy,
) -> PipelineReport {
    let mut report = PipelineReport::default();

    while let Some(block) = receiver.recv().await {
        let block_number = block.block_number;
        match append_with_retry(&mut sink, &block, policy).await {
            Ok(offset) => {
                if let Err(err) = index.record(block_number, offset) {
                    warn!(block_number, %err, "could not index block");
                }
                info!(block_number, offset, "block written to ledger");
                report.persisted.push(block_number);
            }
            Err(err) => {
                error!(block_number, %err, "block committed but not written to ledger");
                report.unpersisted.push(block_number);
            }
        }
    }

    info!(
        persisted = report.persisted.len(),
        unpersisted = report.unpersisted.len(),
        "persistence pipeline drained"
    );
    report
}

async fn append_with_retry<S: BlockSink>(
    sink: &mut S,
    block: &Block,
    policy: RetryPolicy,
) -> Result<u64> {
    let mut attempt = 0;
    loop {
        match sink.append(block) {
            Ok(offset) => return Ok(offset),
            Err(err) if attempt < policy.retries => {
                attempt += 1;
                warn!(block_number = block.block_number, attempt, %err, "ledger append failed, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}
