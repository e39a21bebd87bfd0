//! Read side of the append-only block log.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::block::Block;
use crate::error::{LedgerError, Result};

/// Block number to byte offset of its record in the log.
///
/// Filled by the persistence task as records are appended, shared with readers.
#[derive(Clone, Default, Debug)]
pub struct LedgerIndex {
    offsets: Arc<RwLock<BTreeMap<u64, u64>>>,
}

impl LedgerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, block_number: u64, offset: u64) -> Result<()> {
        let mut offsets = self.offsets.write().map_err(|_| LedgerError::IndexPoisoned)?;
        offsets.insert(block_number, offset);
        Ok(())
    }

    pub fn offset_of(&self, block_number: u64) -> Result<Option<u64>> {
        let offsets = self.offsets.read().map_err(|_| LedgerError::IndexPoisoned)?;
        Ok(offsets.get(&block_number).copied())
    }

    pub fn len(&self) -> usize {
        self.offsets.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LedgerReader {
    path: PathBuf,
    index: Option<LedgerIndex>,
}

impl LedgerReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: None,
        }
    }

    /// Point lookups consult `index` before falling back to a scan.
    pub fn with_index(mut self, index: LedgerIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Returns block `block_number`, or `None` when it is absent or the log
    /// cannot be decoded up to it.
    pub fn fetch_block(&self, block_number: u64) -> Option<Block> {
        match self.find_block(block_number) {
            Ok(found) => found,
            Err(err) => {
                warn!(block_number, %err, "error reading ledger");
                None
            }
        }
    }

    /// Every block in the log, or nothing at all if any record is malformed.
    pub fn fetch_all_blocks(&self) -> Vec<Block> {
        self.read_all().unwrap_or_else(|err| {
            warn!(path = %self.path.display(), %err, "error reading ledger");
            Vec::new()
        })
    }

    /// Like [`fetch_all_blocks`](Self::fetch_all_blocks) but reports why the
    /// log could not be read.
    pub fn read_all(&self) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        self.for_each_record(|_, block| {
            blocks.push(block);
            ControlFlow::Continue(())
        })?;
        Ok(blocks)
    }

    fn find_block(&self, block_number: u64) -> Result<Option<Block>> {
        if let Some(index) = &self.index {
            if let Some(offset) = index.offset_of(block_number)? {
                match self.read_at(offset) {
                    Ok(block) if block.block_number == block_number => return Ok(Some(block)),
                    Ok(_) => warn!(block_number, offset, "stale index entry, scanning log"),
                    Err(err) => warn!(block_number, offset, %err, "unreadable index entry, scanning log"),
                }
            }
        }

        let mut found = None;
        self.for_each_record(|_, block| {
            if block.block_number == block_number {
                found = Some(block);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }

    fn read_at(&self, offset: u64) -> Result<Block> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        decode_record(&line, 0)
    }

    /// Decodes records front to back, handing each one and its offset to
    /// `visit` until it breaks or the log ends.
    fn for_each_record(
        &self,
        mut visit: impl FnMut(u64, Block) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut line = String::new();
        let mut offset = 0u64;
        let mut line_number = 0usize;

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                return Ok(());
            }
            line_number += 1;
            let block = decode_record(&line, line_number)?;
            if visit(offset, block).is_break() {
                return Ok(());
            }
            offset += read as u64;
        }
    }
}

/// A record counts only once its terminating newline is on disk.
fn decode_record(line: &str, line_number: usize) -> Result<Block> {
    let Some(body) = line.strip_suffix('\n') else {
        return Err(LedgerError::Decode { line: line_number });
    };
    serde_json::from_str(body).map_err(|_| LedgerError::Decode { line: line_number })
}

/// Rebuilds the offset index from an existing log. A missing log yields an
/// empty index.
pub fn rebuild_index(path: &Path) -> Result<LedgerIndex> {
    let index = LedgerIndex::new();
    let reader = LedgerReader::new(path);
    let mut recorded = Ok(());
    let scanned = reader.for_each_record(|offset, block| {
        recorded = index.record(block.block_number, offset);
        if recorded.is_err() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    match scanned {
        Err(LedgerError::Io(err)) if err.kind() == ErrorKind::NotFound => {}
        other => other?,
    }
    recorded?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GENESIS_PREV_HASH;
    use crate::tx::{SubPayload, Transaction};
    use std::io::Write;

    fn committed_chain(count: u64) -> Vec<Block> {
        let mut prev = GENESIS_PREV_HASH.to_string();
        (1..=count)
            .map(|n| {
                let mut block = Block::new(n, prev.clone(), 1);
                let mut tx =
                    Transaction::new(&format!("SIM{n}"), SubPayload::new(1.0).with_field("val", n)).unwrap();
                tx.accept();
                block.push(tx).unwrap();
                block.commit().unwrap();
                prev = block.block_hash.clone();
                block
            })
            .collect()
    }

    fn write_log(path: &Path, blocks: &[Block]) {
        let mut file = File::create(path).unwrap();
        for block in blocks {
            writeln!(file, "{}", serde_json::to_string(block).unwrap()).unwrap();
        }
    }

    #[test]
    fn fetches_by_number_with_a_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");
        let blocks = committed_chain(3);
        write_log(&path, &blocks);

        let reader = LedgerReader::new(&path);
        assert_eq!(reader.fetch_block(2), Some(blocks[1].clone()));
        assert_eq!(reader.fetch_block(4), None);
        assert_eq!(reader.fetch_all_blocks(), blocks);
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = LedgerReader::new(dir.path().join("nothing.txt"));
        assert_eq!(reader.fetch_block(1), None);
        assert!(reader.fetch_all_blocks().is_empty());
        assert!(rebuild_index(&dir.path().join("nothing.txt")).unwrap().is_empty());
    }

    #[test]
    fn unterminated_tail_is_a_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");
        let blocks = committed_chain(2);
        write_log(&path, &blocks[..1]);
        let partial = serde_json::to_string(&blocks[1]).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(partial.as_bytes()).unwrap();

        let reader = LedgerReader::new(&path);
        assert!(matches!(reader.read_all(), Err(LedgerError::Decode { line: 2 })));
        assert!(reader.fetch_all_blocks().is_empty());
        assert_eq!(reader.fetch_block(2), None);
        // Records before the damage are still reachable by number.
        assert_eq!(reader.fetch_block(1), Some(blocks[0].clone()));
    }

    #[test]
    fn garbage_line_hides_later_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");
        let blocks = committed_chain(2);
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&blocks[0]).unwrap()).unwrap();
        writeln!(file, "{{not a block").unwrap();
        writeln!(file, "{}", serde_json::to_string(&blocks[1]).unwrap()).unwrap();

        let reader = LedgerReader::new(&path);
        assert_eq!(reader.fetch_block(2), None);
        assert!(matches!(reader.read_all(), Err(LedgerError::Decode { line: 2 })));
    }

    #[test]
    fn rebuilt_index_points_at_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.txt");
        let blocks = committed_chain(3);
        write_log(&path, &blocks);

        let index = rebuild_index(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.offset_of(1).unwrap(), Some(0));

        let reader = LedgerReader::new(&path).with_index(index.clone());
        assert_eq!(reader.fetch_block(3), Some(blocks[2].clone()));

        // A wrong offset is detected and answered from a scan.
        index.record(3, 0).unwrap();
        assert_eq!(reader.fetch_block(3), Some(blocks[2].clone()));

        // So is one that points into the middle of a record.
        index.record(3, 5).unwrap();
        assert_eq!(reader.fetch_block(3), Some(blocks[2].clone()));
    }
}
