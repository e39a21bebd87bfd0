//! Block assembly and commit.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::block::{first_broken_link, Block, GENESIS_PREV_HASH};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::pipeline::BlockHandoff;
use crate::store::KvStore;
use crate::tx::{Payload, Transaction};
use crate::validator::check_version;

/// A chain shared by several producers. The lock covers a whole
/// `add_transaction` call, handoff included.
pub type SharedBlockchain = Arc<Mutex<Blockchain>>;

/// What one call did to the chain.
#[derive(Debug, Default)]
pub struct AddOutcome {
    /// Ids of the transactions appended, valid or not.
    pub transaction_ids: Vec<String>,
    /// Blocks committed during the call, in commit order.
    pub committed: Vec<u64>,
    /// Committed blocks the persistence pipeline did not accept.
    pub handoff_failures: Vec<LedgerError>,
}

pub struct Blockchain {
    blocks: Vec<Block>,
    store: Arc<dyn KvStore>,
    handoff: Option<BlockHandoff>,
    block_capacity: usize,
    unhanded: Vec<u64>,
}

impl Blockchain {
    pub fn new(store: Arc<dyn KvStore>, handoff: BlockHandoff, config: &LedgerConfig) -> Self {
        Self {
            blocks: Vec::new(),
            store,
            handoff: Some(handoff),
            block_capacity: config.block_capacity.max(1),
            unhanded: Vec::new(),
        }
    }

    pub fn into_shared(self) -> SharedBlockchain {
        Arc::new(Mutex::new(self))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn latest_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Committed blocks that never made it into the persistence pipeline.
    pub fn unhanded_blocks(&self) -> &[u64] {
        &self.unhanded
    }

    /// Validates each entry of `payload`, appends it to the open block and
    /// commits the block as soon as it is full. Entries go in key order and
    /// may spill into a fresh block.
    ///
    /// A payload with an entry that cannot be recorded is refused whole,
    /// before any block is opened or modified.
    pub async fn add_transaction(&mut self, payload: Payload) -> Result<AddOutcome> {
        let entries = payload
            .into_iter()
            .map(|(key, tx_data)| Transaction::new(&key, tx_data))
            .collect::<Result<Vec<_>>>()?;

        let mut outcome = AddOutcome::default();
        for mut tx in entries {
            if self.blocks.last().map_or(true, |b| b.is_full() || b.is_committed()) {
                self.create_new_block();
            }

            check_version(self.store.as_ref(), &mut tx);
            outcome.transaction_ids.push(tx.id.clone());

            let Some(block) = self.blocks.last_mut() else {
                continue;
            };
            block.push(tx)?;
            if block.is_full() {
                self.commit_latest(&mut outcome).await?;
            }
        }

        Ok(outcome)
    }

    /// Re-derives every hash and link held in memory.
    pub fn verify_chain(&self) -> Result<Option<u64>> {
        first_broken_link(&self.blocks)
    }

    /// Commits a non-empty trailing block, flushes the store and releases the
    /// pipeline so it can drain. Later commits report `PipelineClosed`.
    pub async fn shutdown(&mut self) -> Result<AddOutcome> {
        let mut outcome = AddOutcome::default();
        let trailing = self
            .blocks
            .last()
            .is_some_and(|b| !b.is_committed() && !b.is_empty());
        if trailing {
            self.commit_latest(&mut outcome).await?;
        }

        self.store.flush()?;
        self.handoff = None;
        info!(blocks = self.blocks.len(), "blockchain shut down");
        Ok(outcome)
    }

    fn create_new_block(&mut self) {
        let prev_block_hash = match self.blocks.last() {
            Some(latest) => latest.block_hash.clone(),
            None => GENESIS_PREV_HASH.to_string(),
        };
        let block_number = self.blocks.len() as u64 + 1;
        debug!(block_number, %prev_block_hash, "new block");
        self.blocks
            .push(Block::new(block_number, prev_block_hash, self.block_capacity));
    }

    /// Seals the latest block, applies its valid transactions to the store and
    /// hands it to the persistence pipeline.
    async fn commit_latest(&mut self, outcome: &mut AddOutcome) -> Result<()> {
        let started = Instant::now();
        let Some(block) = self.blocks.last_mut() else {
            return Ok(());
        };
        block.commit()?;
        let block_number = block.block_number;

        for tx in block.valid_transactions() {
            let applied = tx
                .store_value()
                .and_then(|value| self.store.put(tx.id.as_bytes(), &value));
            if let Err(err) = applied {
                warn!(block_number, tx = %tx.id, %err, "could not apply transaction to store");
            }
        }

        let sealed = block.clone();
        let handed = match &self.handoff {
            Some(handoff) => handoff.send(sealed).await,
            None => Err(LedgerError::PipelineClosed { block_number }),
        };
        if let Err(err) = handed {
            error!(block_number, %err, "committed block not handed to persistence");
            self.unhanded.push(block_number);
            outcome.handoff_failures.push(err);
        }

        info!(block_number, elapsed = ?started.elapsed(), "block processing time");
        outcome.committed.push(block_number);
        Ok(())
    }
}
