//! Append-only byte storage addressed by file offset.
//!
//! Space is handed out by [`Storage::allocate`] and filled once by
//! [`Storage::write`]. Nothing below the end of the last commit is ever
//! rewritten, so readers may read any committed address without locking
//! against writers.

mod memory;
mod mmap;

pub use memory::MemStorage;
pub use mmap::MmapStorage;

use crate::error::Result;

pub trait Storage: Send + Sync {
    /// Reserves `n` contiguous bytes and returns their address.
    fn allocate(&self, n: usize) -> Result<u64>;

    /// Writes into previously allocated space.
    fn write(&self, adr: u64, data: &[u8]) -> Result<()>;

    /// Copies `len` bytes starting at `adr`.
    fn read(&self, adr: u64, len: usize) -> Result<Vec<u8>>;

    /// End of allocated space.
    fn size(&self) -> u64;

    /// Discards everything from `end` on. Only used when recovering a torn tail.
    fn truncate(&self, end: u64) -> Result<()>;

    /// Flushes written bytes to durable storage.
    fn force(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}
