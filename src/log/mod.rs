//! Block framing over append-only storage.
//!
//! Everything in a database file after the header is a block:
//!
//! ```text
//! +------------+---------+-----------------------------+
//! | len: u32   | kind:u8 | payload                     |
//! +------------+---------+-----------------------------+
//!
//! Data:   payload = tblnum: u32, packed record
//! Node:   payload = encoded btree node
//! Commit: payload = commit record, crc32: u32
//! ```
//!
//! `len` covers the whole block including its 5 byte header. All integers
//! are big-endian.
//!
//! The crc of a commit block covers every byte appended since the previous
//! commit block plus the commit payload, so a commit vouches for all the
//! data and index nodes written before it. Transactions that abort leave
//! their blocks behind; they are covered by the next commit like any other
//! bytes and simply never referenced.

pub mod commit;
pub mod header;
pub mod scan;

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

pub use commit::CommitRecord;
pub use header::HEADER_SIZE;
use header::file_header;
pub use scan::{Blocks, CommitInfo, LogScan, Status};

use crate::digest::CommitDigest;
use crate::error::Result;
use crate::record::Record;
use crate::storage::Storage;
use crate::Error;

pub const BLOCK_HEADER: usize = 5;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Data = 1,
    Node = 2,
    Commit = 3,
}

impl TryFrom<u8> for BlockKind {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(BlockKind::Data),
            2 => Ok(BlockKind::Node),
            3 => Ok(BlockKind::Commit),
            other => Err(Error::InvalidData(format!("unknown block kind {}", other))),
        }
    }
}

struct Tail {
    digest: CommitDigest,
    last_commit: Option<CommitInfo>,
}

pub struct Log {
    storage: Arc<dyn Storage>,
    tail: Mutex<Tail>,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").field("size", &self.size()).finish()
    }
}

impl Log {
    /// Writes the file header to empty storage.
    pub fn create(storage: Arc<dyn Storage>) -> Result<Log> {
        if storage.size() != 0 {
            return Err(Error::InvalidOperation(
                "cannot create a database in non-empty storage".to_string(),
            ));
        }
        let header = file_header();
        let adr = storage.allocate(HEADER_SIZE)?;
        storage.write(adr, &header)?;
        Ok(Log {
            storage,
            tail: Mutex::new(Tail {
                digest: CommitDigest::new(),
                last_commit: None,
            }),
        })
    }

    /// Scans existing storage and positions the log after its last good
    /// commit. The caller decides what to do with a damaged scan.
    pub fn open(storage: Arc<dyn Storage>) -> Result<(Log, LogScan)> {
        let scan = scan::scan(storage.as_ref())?;
        let log = Log {
            storage,
            tail: Mutex::new(Tail {
                digest: CommitDigest::new(),
                last_commit: scan.last_good,
            }),
        };
        Ok((log, scan))
    }

    /// Drops everything after the last good commit. Only valid right after
    /// `open`, before anything new is appended.
    pub fn truncate_to_last_commit(&self) -> Result<u64> {
        let tail = self.tail.lock()?;
        let end = tail.last_commit.map(|c| c.end).unwrap_or(HEADER_SIZE as u64);
        let dropped = self.storage.size().saturating_sub(end);
        if dropped > 0 {
            self.storage.truncate(end)?;
        }
        Ok(dropped)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn size(&self) -> u64 {
        self.storage.size()
    }

    pub fn last_commit(&self) -> Result<Option<CommitInfo>> {
        Ok(self.tail.lock()?.last_commit)
    }

    fn append(&self, kind: BlockKind, parts: &[&[u8]]) -> Result<u64> {
        let len = BLOCK_HEADER + parts.iter().map(|p| p.len()).sum::<usize>();
        let mut block = Vec::with_capacity(len);
        block.extend_from_slice(&(len as u32).to_be_bytes());
        block.push(kind as u8);
        for part in parts {
            block.extend_from_slice(part);
        }

        let mut tail = self.tail.lock()?;
        let adr = self.storage.allocate(len)?;
        self.storage.write(adr, &block)?;
        tail.digest.write(&block);
        Ok(adr)
    }

    pub fn append_data(&self, tblnum: u32, rec: &Record) -> Result<u64> {
        self.append(BlockKind::Data, &[&tblnum.to_be_bytes(), rec.as_bytes()])
    }

    pub fn append_node(&self, node: &[u8]) -> Result<u64> {
        self.append(BlockKind::Node, &[node])
    }

    /// Appends a commit block sealing everything written since the last one.
    pub fn commit(&self, record: &CommitRecord) -> Result<CommitInfo> {
        let payload = record.encode()?;
        let len = BLOCK_HEADER + payload.len() + CRC_SIZE;
        let mut block = Vec::with_capacity(len);
        block.extend_from_slice(&(len as u32).to_be_bytes());
        block.push(BlockKind::Commit as u8);
        block.extend_from_slice(&payload);

        let mut tail = self.tail.lock()?;
        let covered = tail.digest.covered();
        let crc = tail.digest.seal(&block);
        block.extend_from_slice(&crc.to_be_bytes());

        let adr = self.storage.allocate(len)?;
        self.storage.write(adr, &block)?;

        let info = CommitInfo {
            adr,
            end: adr + len as u64,
            seq: record.seq,
            timestamp: record.timestamp,
        };
        tail.last_commit = Some(info);
        tracing::trace!(seq = record.seq, adr, covered, "commit appended");
        Ok(info)
    }

    /// Reads the kind and payload of the block at `adr`.
    pub fn read_block(&self, adr: u64) -> Result<(BlockKind, Vec<u8>)> {
        let head = self.storage.read(adr, BLOCK_HEADER)?;
        let len = BigEndian::read_u32(&head[0..4]) as usize;
        let kind = BlockKind::try_from(head[4])?;
        if len < BLOCK_HEADER {
            return Err(Error::InvalidData(format!("bad block length at {}", adr)));
        }
        let payload = self
            .storage
            .read(adr + BLOCK_HEADER as u64, len - BLOCK_HEADER)?;
        Ok((kind, payload))
    }

    /// Reads a data record, returning the table it belongs to.
    pub fn read_data(&self, adr: u64) -> Result<(u32, Record)> {
        let (kind, mut payload) = self.read_block(adr)?;
        if kind != BlockKind::Data || payload.len() < 4 {
            return Err(Error::InvalidData(format!("no data record at {}", adr)));
        }
        let tblnum = BigEndian::read_u32(&payload[0..4]);
        let rec = Record::from_bytes(payload.split_off(4))?;
        Ok((tblnum, rec))
    }

    pub fn read_node(&self, adr: u64) -> Result<Vec<u8>> {
        match self.read_block(adr)? {
            (BlockKind::Node, payload) => Ok(payload),
            _ => Err(Error::InvalidData(format!("no btree node at {}", adr))),
        }
    }

    pub fn read_commit(&self, adr: u64) -> Result<CommitRecord> {
        match self.read_block(adr)? {
            (BlockKind::Commit, payload) if payload.len() >= CRC_SIZE => {
                CommitRecord::decode(&payload[..payload.len() - CRC_SIZE])
            }
            _ => Err(Error::InvalidData(format!("no commit record at {}", adr))),
        }
    }

    /// Blocks starting at addresses in `[from, to]`, `from` must be a block.
    pub fn blocks(&self, from: u64, to: u64) -> Blocks<'_> {
        Blocks::new(self, from, to)
    }

    /// Verifies every commit from the start of the file.
    pub fn scan(&self) -> Result<LogScan> {
        let _tail = self.tail.lock()?;
        scan::scan(self.storage.as_ref())
    }

    pub fn force(&self) -> Result<()> {
        self.storage.force()
    }

    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn commit_record(seq: u64) -> CommitRecord {
        CommitRecord {
            seq,
            timestamp: 1000 + seq,
            next_tblnum: 3,
            bootstrap: vec![],
        }
    }

    #[test]
    fn test_append_and_read() -> Result<()> {
        let log = Log::create(Arc::new(MemStorage::new()))?;
        let rec = Record::from_values([1, 2, 3]);
        let adr = log.append_data(7, &rec)?;
        assert_eq!(adr, HEADER_SIZE as u64);

        let (tblnum, back) = log.read_data(adr)?;
        assert_eq!(tblnum, 7);
        assert_eq!(back, rec);

        let node = log.append_node(b"node bytes")?;
        assert_eq!(log.read_node(node)?, b"node bytes");
        assert!(log.read_data(node).is_err());
        Ok(())
    }

    #[test]
    fn test_commit_and_reopen() -> Result<()> {
        let storage = Arc::new(MemStorage::new());
        let log = Log::create(storage.clone())?;
        log.append_data(3, &Record::from_values(["a"]))?;
        let first = log.commit(&commit_record(1))?;
        log.append_data(3, &Record::from_values(["b"]))?;
        let second = log.commit(&commit_record(2))?;
        assert_eq!(log.read_commit(second.adr)?, commit_record(2));

        let (reopened, scan) = Log::open(storage)?;
        assert_eq!(scan.status, Status::Ok);
        assert_eq!(scan.commits, 2);
        assert_eq!(scan.last_good, Some(second));
        assert!(first.end <= second.adr);
        assert_eq!(reopened.last_commit()?, Some(second));
        Ok(())
    }

    #[test]
    fn test_uncommitted_tail_is_dropped() -> Result<()> {
        let storage = Arc::new(MemStorage::new());
        let log = Log::create(storage.clone())?;
        let info = log.commit(&commit_record(1))?;
        log.append_data(3, &Record::from_values(["uncommitted"]))?;

        let (reopened, scan) = Log::open(storage.clone())?;
        assert_eq!(scan.status, Status::Ok);
        let dropped = reopened.truncate_to_last_commit()?;
        assert!(dropped > 0);
        assert_eq!(storage.size(), info.end);
        Ok(())
    }

    #[test]
    fn test_blocks_in_range() -> Result<()> {
        let log = Log::create(Arc::new(MemStorage::new()))?;
        let a = log.append_data(3, &Record::from_values([1]))?;
        log.append_node(b"xx")?;
        let b = log.append_data(3, &Record::from_values([2]))?;
        log.append_data(3, &Record::from_values([3]))?;

        let kinds: Vec<(u64, BlockKind)> = log
            .blocks(a, b)
            .map(|block| block.map(|(adr, kind, _)| (adr, kind)))
            .collect::<Result<_>>()?;
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0], (a, BlockKind::Data));
        assert_eq!(kinds[1].1, BlockKind::Node);
        assert_eq!(kinds[2], (b, BlockKind::Data));
        Ok(())
    }
}
