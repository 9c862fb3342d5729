use byteorder::{BigEndian, ByteOrder};

use super::header::check_header;
use super::{BlockKind, Log, BLOCK_HEADER, CRC_SIZE, HEADER_SIZE};
use crate::error::Result;
use crate::digest::CommitDigest;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Something after the last good commit is damaged; truncating to that
    /// commit repairs the file.
    Corrupted,
    /// No usable commit at all.
    Unrecoverable,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::Corrupted => write!(f, "corrupted"),
            Status::Unrecoverable => write!(f, "unrecoverable"),
        }
    }
}

/// Location of a verified commit block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub adr: u64,
    /// First address after the commit block
    pub end: u64,
    pub seq: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScan {
    pub status: Status,
    pub last_good: Option<CommitInfo>,
    pub commits: u64,
    /// Where the walk stopped
    pub end: u64,
    /// Bytes of an interrupted final commit that were skipped as a torn tail
    pub torn: u64,
    pub detail: Option<String>,
}

impl LogScan {
    fn stop(mut self, status: Status, detail: String) -> Self {
        self.status = status;
        self.detail = Some(detail);
        self
    }
}

/// Walks the blocks from the header on, verifying each commit checksum.
///
/// A failure followed only by zero bytes is an interrupted write at the end
/// of the file, not corruption: the scan stays `Ok` and records the torn
/// length so the opener can truncate it.
pub fn scan(storage: &dyn Storage) -> Result<LogScan> {
    let size = storage.size();
    let mut result = LogScan {
        status: Status::Ok,
        last_good: None,
        commits: 0,
        end: HEADER_SIZE as u64,
        torn: 0,
        detail: None,
    };
    if size < HEADER_SIZE as u64 {
        return Ok(result.stop(Status::Unrecoverable, "file too short for header".into()));
    }
    if let Err(e) = check_header(&storage.read(0, HEADER_SIZE)?) {
        return Ok(result.stop(Status::Unrecoverable, format!("bad file header: {}", e)));
    }

    let mut digest = CommitDigest::new();
    let mut pos = HEADER_SIZE as u64;
    let failure = loop {
        if pos + BLOCK_HEADER as u64 > size {
            if pos < size {
                break Some((pos, size, "truncated block header".to_string()));
            }
            break None;
        }
        let head = storage.read(pos, BLOCK_HEADER)?;
        let len = BigEndian::read_u32(&head[0..4]) as u64;
        if len == 0 && head[4] == 0 {
            // never written
            break None;
        }
        if len < BLOCK_HEADER as u64 || pos + len > size {
            break Some((pos, pos + BLOCK_HEADER as u64, format!("bad block length at {}", pos)));
        }
        let Ok(kind) = BlockKind::try_from(head[4]) else {
            break Some((pos, pos + len, format!("bad block kind at {}", pos)));
        };
        let block = storage.read(pos, len as usize)?;
        if kind == BlockKind::Commit {
            if (len as usize) < BLOCK_HEADER + CRC_SIZE {
                break Some((pos, pos + len, format!("short commit at {}", pos)));
            }
            let body = &block[..block.len() - CRC_SIZE];
            let stored = BigEndian::read_u32(&block[block.len() - CRC_SIZE..]);
            if digest.seal(body) != stored {
                break Some((pos, pos + len, format!("checksum mismatch in commit at {}", pos)));
            }
            let record = match super::CommitRecord::decode(&body[BLOCK_HEADER..]) {
                Ok(record) => record,
                Err(e) => break Some((pos, pos + len, format!("bad commit at {}: {}", pos, e))),
            };
            result.commits += 1;
            result.last_good = Some(CommitInfo {
                adr: pos,
                end: pos + len,
                seq: record.seq,
                timestamp: record.timestamp,
            });
        } else {
            digest.write(&block);
        }
        pos += len;
    };
    result.end = pos;

    if result.last_good.is_none() {
        let detail = failure
            .map(|(_, _, msg)| msg)
            .unwrap_or_else(|| "no commits".to_string());
        return Ok(result.stop(Status::Unrecoverable, detail));
    }
    if let Some((at, skip, msg)) = failure {
        if all_zero(storage, skip, size)? {
            result.torn = size - at;
            result.detail = Some(msg);
            tracing::warn!(at, bytes = result.torn, "torn write at end of log");
        } else {
            return Ok(result.stop(Status::Corrupted, msg));
        }
    }
    Ok(result)
}

fn all_zero(storage: &dyn Storage, from: u64, to: u64) -> Result<bool> {
    const STEP: u64 = 64 * 1024;
    let mut pos = from;
    while pos < to {
        let n = (to - pos).min(STEP);
        if storage.read(pos, n as usize)?.iter().any(|&b| b != 0) {
            return Ok(false);
        }
        pos += n;
    }
    Ok(true)
}

/// Iterator over the blocks starting in an address range.
pub struct Blocks<'a> {
    log: &'a Log,
    pos: u64,
    to: u64,
}

impl<'a> Blocks<'a> {
    pub(super) fn new(log: &'a Log, from: u64, to: u64) -> Self {
        Self { log, pos: from, to }
    }
}

impl Iterator for Blocks<'_> {
    type Item = Result<(u64, BlockKind, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos > self.to || self.pos >= self.log.size() {
            return None;
        }
        let adr = self.pos;
        match self.log.read_block(adr) {
            Ok((kind, payload)) => {
                self.pos += (BLOCK_HEADER + payload.len()) as u64;
                Some(Ok((adr, kind, payload)))
            }
            Err(e) => {
                self.pos = u64::MAX;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::CommitRecord;
    use crate::record::Record;
    use crate::storage::MemStorage;
    use std::sync::Arc;

    fn commit(log: &Log, seq: u64) -> Result<CommitInfo> {
        log.commit(&CommitRecord {
            seq,
            timestamp: seq * 10,
            next_tblnum: 3,
            bootstrap: vec![],
        })
    }

    #[test]
    fn test_empty_log_is_unrecoverable() -> Result<()> {
        let storage = Arc::new(MemStorage::new());
        Log::create(storage.clone())?;
        let scan = scan(storage.as_ref())?;
        assert_eq!(scan.status, Status::Unrecoverable);
        assert!(scan.last_good.is_none());
        Ok(())
    }

    #[test]
    fn test_bad_header_is_unrecoverable() -> Result<()> {
        let storage = MemStorage::from_bytes(vec![0xAB; 64]);
        assert_eq!(scan(&storage)?.status, Status::Unrecoverable);
        Ok(())
    }

    #[test]
    fn test_corruption_before_last_commit() -> Result<()> {
        let storage = Arc::new(MemStorage::new());
        let log = Log::create(storage.clone())?;
        let data = log.append_data(3, &Record::from_values(["hello"]))?;
        let first = commit(&log, 1)?;
        log.append_data(3, &Record::from_values(["world"]))?;
        commit(&log, 2)?;
        log.append_data(3, &Record::from_values(["again"]))?;
        commit(&log, 3)?;

        // flip a payload byte of the first data record
        let at = data + 12;
        let byte = storage.read(at, 1)?[0];
        storage.write(at, &[byte ^ 0x55])?;

        let scan = scan(storage.as_ref())?;
        assert_eq!(scan.status, Status::Unrecoverable);

        // damage only the second transaction instead
        storage.write(at, &[byte])?;
        let second_data = first.end + 12;
        let byte = storage.read(second_data, 1)?[0];
        storage.write(second_data, &[byte ^ 0x55])?;
        let scan = super::scan(storage.as_ref())?;
        assert_eq!(scan.status, Status::Corrupted);
        assert_eq!(scan.last_good, Some(first));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_not_corruption() -> Result<()> {
        let storage = Arc::new(MemStorage::new());
        let log = Log::create(storage.clone())?;
        let good = commit(&log, 1)?;

        // a commit whose length was written but whose body never was
        let adr = storage.allocate(40)?;
        storage.write(adr, &40u32.to_be_bytes())?;

        let scan = scan(storage.as_ref())?;
        assert_eq!(scan.status, Status::Ok);
        assert_eq!(scan.last_good, Some(good));
        assert_eq!(scan.torn, 40);
        Ok(())
    }
}
