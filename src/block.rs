use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};
use crate::tx::Transaction;

/// Previous-hash placeholder carried by block 1.
pub const GENESIS_PREV_HASH: &str = "0x000";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Pending,
    Committed,
}

/// A fixed-capacity batch of transactions, chained to its predecessor by hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// 1-based position in the chain.
    pub block_number: u64,
    /// Transactions in arrival order.
    pub transactions: Vec<Transaction>,
    pub timestamp: DateTime<Utc>,
    pub status: BlockStatus,
    /// Maximum number of transactions, fixed at creation.
    pub capacity: usize,
    pub prev_block_hash: String,
    /// Empty until the block is committed.
    pub block_hash: String,
}

/// Every block field except its own hash, in the shape that gets digested.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashableBlockData<'a> {
    block_number: u64,
    transactions: &'a [Transaction],
    timestamp: &'a DateTime<Utc>,
    status: BlockStatus,
    capacity: usize,
    prev_block_hash: &'a str,
}

impl<'a> From<&'a Block> for HashableBlockData<'a> {
    fn from(block: &'a Block) -> Self {
        Self {
            block_number: block.block_number,
            transactions: &block.transactions,
            timestamp: &block.timestamp,
            status: block.status,
            capacity: block.capacity,
            prev_block_hash: &block.prev_block_hash,
        }
    }
}

impl Block {
    pub fn new(block_number: u64, prev_block_hash: String, capacity: usize) -> Self {
        Self {
            block_number,
            transactions: Vec::with_capacity(capacity),
            timestamp: Utc::now(),
            status: BlockStatus::Pending,
            capacity,
            prev_block_hash,
            block_hash: String::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.transactions.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_committed(&self) -> bool {
        self.status == BlockStatus::Committed
    }

    /// Appends a transaction, refusing once the block is committed or full.
    pub fn push(&mut self, tx: Transaction) -> Result<()> {
        if self.is_committed() {
            return Err(LedgerError::BlockSealed {
                block_number: self.block_number,
            });
        }
        if self.is_full() {
            return Err(LedgerError::BlockFull {
                block_number: self.block_number,
                capacity: self.capacity,
            });
        }
        self.transactions.push(tx);
        Ok(())
    }

    /// Hex SHA-256 over the block's content, `prev_block_hash` included.
    pub fn calculate_hash(&self) -> Result<String> {
        let serialized = serde_json::to_vec(&HashableBlockData::from(self))?;
        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Seals the block: flips the status and fixes `block_hash`.
    pub fn commit(&mut self) -> Result<&str> {
        if self.is_committed() {
            return Err(LedgerError::BlockSealed {
                block_number: self.block_number,
            });
        }
        if self.is_empty() {
            return Err(LedgerError::EmptyBlock {
                block_number: self.block_number,
            });
        }
        self.status = BlockStatus::Committed;
        self.block_hash = self.calculate_hash()?;
        Ok(&self.block_hash)
    }

    pub fn valid_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| tx.valid)
    }

    /// True when a committed block's stored hash matches its content.
    pub fn verify_hash(&self) -> Result<bool> {
        if !self.is_committed() {
            return Ok(self.block_hash.is_empty());
        }
        Ok(!self.block_hash.is_empty() && self.calculate_hash()? == self.block_hash)
    }
}

/// Walks a run of blocks and returns the number of the first one whose
/// numbering, hash or link to its predecessor does not hold.
pub fn first_broken_link(blocks: &[Block]) -> Result<Option<u64>> {
    let mut prev: Option<&Block> = None;
    for block in blocks {
        let linked = match prev {
            None if block.block_number == 1 => block.prev_block_hash == GENESIS_PREV_HASH,
            None => true,
            Some(p) => {
                block.block_number == p.block_number + 1
                    && p.is_committed()
                    && block.prev_block_hash == p.block_hash
            }
        };
        if !linked || !block.verify_hash()? {
            return Ok(Some(block.block_number));
        }
        prev = Some(block);
    }
    Ok(None)
}
