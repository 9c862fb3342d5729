//! Memory mapped file storage.
//!
//! The file is mapped in fixed size chunks. Growing the file maps one more
//! chunk and never remaps existing ones, so `read` stays valid while the log
//! grows. An address range may straddle a chunk boundary; reads and writes
//! are split accordingly.
//!
//! ```text
//! +-----------+-----------+-----------+
//! |  chunk 0  |  chunk 1  |  chunk 2  |   file = n * chunk_size while open
//! +-----------+-----------+-----------+
//! ^ 0                 ^ end                  set_len(end) on close
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use memmap2::{Mmap, MmapMut, MmapOptions};

use super::Storage;
use crate::error::{Error, Result};

enum Chunk {
    Rw(MmapMut),
    Ro(Mmap),
}

impl Chunk {
    fn bytes(&self) -> &[u8] {
        match self {
            Chunk::Rw(m) => m,
            Chunk::Ro(m) => m,
        }
    }
}

pub struct MmapStorage {
    path: PathBuf,
    file: File,
    chunk_size: usize,
    chunks: RwLock<Vec<Chunk>>,
    /// Serializes allocation; the value mirrors `end`.
    alloc: Mutex<u64>,
    end: AtomicU64,
    readonly: bool,
    closed: AtomicBool,
}

impl std::fmt::Debug for MmapStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapStorage")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("end", &self.end.load(Ordering::Acquire))
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl MmapStorage {
    /// Opens or creates a file for reading and appending.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let nchunks = (len as usize).div_ceil(chunk_size).max(1);
        file.set_len((nchunks * chunk_size) as u64)?;

        let mut chunks = Vec::with_capacity(nchunks);
        for i in 0..nchunks {
            chunks.push(Chunk::Rw(Self::map_rw(&file, i, chunk_size)?));
        }

        tracing::debug!(path = %path.display(), size = len, chunks = nchunks, "opened storage");
        Ok(Self {
            path,
            file,
            chunk_size,
            chunks: RwLock::new(chunks),
            alloc: Mutex::new(len),
            end: AtomicU64::new(len),
            readonly: false,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens an existing file without ever writing to it.
    pub fn open_readonly(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();

        let mut chunks = Vec::new();
        let mut offset = 0u64;
        while offset < len {
            let n = (len - offset).min(chunk_size as u64) as usize;
            let map = unsafe { MmapOptions::new().offset(offset).len(n).map(&file)? };
            chunks.push(Chunk::Ro(map));
            offset += n as u64;
        }

        Ok(Self {
            path,
            file,
            chunk_size,
            chunks: RwLock::new(chunks),
            alloc: Mutex::new(len),
            end: AtomicU64::new(len),
            readonly: true,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map_rw(file: &File, index: usize, chunk_size: usize) -> Result<MmapMut> {
        let offset = (index * chunk_size) as u64;
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(chunk_size)
                .map_mut(file)?
        };
        Ok(map)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("storage is closed".to_string()));
        }
        Ok(())
    }

    /// Maps chunks until `end` is covered.
    fn grow(&self, end: u64) -> Result<()> {
        let mut chunks = self.chunks.write()?;
        let needed = (end as usize).div_ceil(self.chunk_size);
        if needed <= chunks.len() {
            return Ok(());
        }
        self.file.set_len((needed * self.chunk_size) as u64)?;
        for i in chunks.len()..needed {
            chunks.push(Chunk::Rw(Self::map_rw(&self.file, i, self.chunk_size)?));
        }
        tracing::debug!(path = %self.path.display(), chunks = needed, "grew storage");
        Ok(())
    }

    /// Chunk spans `(chunk, offset, len)` covering `[adr, adr+len)`.
    fn split(&self, adr: u64, len: usize) -> Vec<(usize, usize, usize)> {
        let mut spans = Vec::new();
        let mut pos = adr as usize;
        let end = pos + len;
        while pos < end {
            let offset = pos % self.chunk_size;
            let n = (self.chunk_size - offset).min(end - pos);
            spans.push((pos / self.chunk_size, offset, n));
            pos += n;
        }
        spans
    }
}

impl Storage for MmapStorage {
    fn allocate(&self, n: usize) -> Result<u64> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.check_open()?;
        let mut alloc = self.alloc.lock()?;
        let adr = *alloc;
        let end = adr + n as u64;
        self.grow(end)?;
        *alloc = end;
        self.end.store(end, Ordering::Release);
        Ok(adr)
    }

    fn write(&self, adr: u64, data: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.check_open()?;
        if adr + data.len() as u64 > self.size() {
            return Err(Error::InvalidOperation(format!(
                "write at {} past allocated end {}",
                adr,
                self.size()
            )));
        }
        let mut chunks = self.chunks.write()?;
        let mut done = 0;
        for (index, offset, n) in self.split(adr, data.len()) {
            match &mut chunks[index] {
                Chunk::Rw(map) => map[offset..offset + n].copy_from_slice(&data[done..done + n]),
                Chunk::Ro(_) => return Err(Error::ReadOnly),
            }
            done += n;
        }
        Ok(())
    }

    fn read(&self, adr: u64, len: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        if adr + len as u64 > self.size() {
            return Err(Error::InvalidData(format!(
                "read of {} bytes at {} past end {}",
                len,
                adr,
                self.size()
            )));
        }
        let chunks = self.chunks.read()?;
        let mut buf = Vec::with_capacity(len);
        for (index, offset, n) in self.split(adr, len) {
            buf.extend_from_slice(&chunks[index].bytes()[offset..offset + n]);
        }
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    fn truncate(&self, end: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.check_open()?;
        let mut alloc = self.alloc.lock()?;
        if end >= *alloc {
            return Ok(());
        }
        // zero the discarded tail so a later scan cannot mistake it for blocks
        let old = *alloc;
        let mut chunks = self.chunks.write()?;
        for (index, offset, n) in self.split(end, (old - end) as usize) {
            if let Chunk::Rw(map) = &mut chunks[index] {
                map[offset..offset + n].fill(0);
            }
        }
        *alloc = end;
        self.end.store(end, Ordering::Release);
        tracing::warn!(path = %self.path.display(), from = old, to = end, "truncated storage");
        Ok(())
    }

    fn force(&self) -> Result<()> {
        if self.readonly || self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let chunks = self.chunks.read()?;
        for chunk in chunks.iter() {
            if let Chunk::Rw(map) = chunk {
                map.flush()?;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut chunks = self.chunks.write()?;
        if !self.readonly {
            for chunk in chunks.iter() {
                if let Chunk::Rw(map) = chunk {
                    map.flush()?;
                }
            }
        }
        chunks.clear();
        if !self.readonly {
            self.file.set_len(self.size())?;
            self.file.sync_all()?;
        }
        tracing::debug!(path = %self.path.display(), size = self.size(), "closed storage");
        Ok(())
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(path = %self.path.display(), error = %e, "failed to close storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 4096;

    #[test]
    fn test_allocate_across_chunks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MmapStorage::open(dir.path().join("db"), CHUNK)?;

        let a = storage.allocate(4000)?;
        let b = storage.allocate(200)?;
        assert_eq!(a, 0);
        assert_eq!(b, 4000);

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        storage.write(b, &data)?;
        assert_eq!(storage.read(b, 200)?, data);
        assert_eq!(storage.size(), 4200);
        Ok(())
    }

    #[test]
    fn test_allocation_larger_than_chunk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MmapStorage::open(dir.path().join("db"), CHUNK)?;

        let big = vec![7u8; CHUNK * 3 + 11];
        let adr = storage.allocate(big.len())?;
        storage.write(adr, &big)?;
        assert_eq!(storage.read(adr, big.len())?, big);
        Ok(())
    }

    #[test]
    fn test_close_sets_length_and_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let storage = MmapStorage::open(&path, CHUNK)?;
            let adr = storage.allocate(10)?;
            storage.write(adr, b"0123456789")?;
            storage.close()?;
        }
        assert_eq!(std::fs::metadata(&path)?.len(), 10);

        let storage = MmapStorage::open(&path, CHUNK)?;
        assert_eq!(storage.size(), 10);
        assert_eq!(storage.read(2, 3)?, b"234");
        let adr = storage.allocate(2)?;
        assert_eq!(adr, 10);
        Ok(())
    }

    #[test]
    fn test_readonly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let storage = MmapStorage::open(&path, CHUNK)?;
            let adr = storage.allocate(CHUNK + 5)?;
            storage.write(adr, &vec![1u8; CHUNK + 5])?;
            storage.close()?;
        }
        let storage = MmapStorage::open_readonly(&path, CHUNK)?;
        assert_eq!(storage.read(CHUNK as u64 - 2, 7)?, vec![1u8; 7]);
        assert!(matches!(storage.allocate(1), Err(Error::ReadOnly)));
        Ok(())
    }

    #[test]
    fn test_truncate_zeroes_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MmapStorage::open(dir.path().join("db"), CHUNK)?;
        let adr = storage.allocate(8)?;
        storage.write(adr, b"abcdefgh")?;
        storage.truncate(4)?;
        assert_eq!(storage.size(), 4);
        let again = storage.allocate(4)?;
        assert_eq!(again, 4);
        assert_eq!(storage.read(0, 8)?, b"abcd\0\0\0\0");
        Ok(())
    }

    #[test]
    fn test_write_outside_allocation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = MmapStorage::open(dir.path().join("db"), CHUNK)?;
        storage.allocate(4)?;
        assert!(storage.write(2, b"xyz").is_err());
        assert!(storage.read(0, 5).is_err());
        Ok(())
    }
}
