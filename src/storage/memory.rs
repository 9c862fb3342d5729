use std::sync::RwLock;

use super::Storage;
use crate::error::{Error, Result};

/// In-memory storage, used by tests and by tools that build a database
/// before deciding where to put it.
#[derive(Debug, Default)]
pub struct MemStorage {
    data: RwLock<Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps existing bytes, e.g. a file image read into memory.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copy of the whole image
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.read()?.clone())
    }
}

impl Storage for MemStorage {
    fn allocate(&self, n: usize) -> Result<u64> {
        let mut data = self.data.write()?;
        let adr = data.len() as u64;
        data.resize(adr as usize + n, 0);
        Ok(adr)
    }

    fn write(&self, adr: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write()?;
        let start = adr as usize;
        let end = start + bytes.len();
        if end > data.len() {
            return Err(Error::InvalidOperation(format!(
                "write at {} past end of storage {}",
                adr,
                data.len()
            )));
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, adr: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.data.read()?;
        let start = adr as usize;
        let end = start + len;
        if end > data.len() {
            return Err(Error::InvalidData(format!(
                "read of {} bytes at {} past end of storage {}",
                len,
                adr,
                data.len()
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.read().map(|d| d.len() as u64).unwrap_or(0)
    }

    fn truncate(&self, end: u64) -> Result<()> {
        self.data.write()?.truncate(end as usize);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read() -> Result<()> {
        let storage = MemStorage::new();
        let a = storage.allocate(5)?;
        let b = storage.allocate(3)?;
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        storage.write(a, b"hello")?;
        storage.write(b, b"abc")?;
        assert_eq!(storage.read(0, 8)?, b"helloabc");
        assert_eq!(storage.size(), 8);
        Ok(())
    }

    #[test]
    fn test_bounds() -> Result<()> {
        let storage = MemStorage::new();
        storage.allocate(4)?;
        assert!(storage.write(2, b"xyz").is_err());
        assert!(storage.read(1, 4).is_err());
        storage.truncate(2)?;
        assert_eq!(storage.size(), 2);
        Ok(())
    }
}
