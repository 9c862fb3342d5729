use std::fmt;

use crc::{Crc, Digest, CRC_32_ISCSI};

pub static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C over every block appended since the last commit.
///
/// Blocks are fed in as they are written; the commit block's own body is
/// fed last by [`CommitDigest::seal`], which yields the checksum stored at
/// the end of that commit block and starts the next span.
#[derive(Clone)]
pub struct CommitDigest {
    digest: Digest<'static, u32>,
    covered: u64,
}

impl fmt::Debug for CommitDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitDigest({} bytes)", self.covered)
    }
}

impl CommitDigest {
    pub fn new() -> Self {
        Self {
            digest: CRC32C.digest(),
            covered: 0,
        }
    }

    pub fn write(&mut self, block: &[u8]) {
        self.digest.update(block);
        self.covered += block.len() as u64;
    }

    /// Bytes fed in since the last seal
    pub fn covered(&self) -> u64 {
        self.covered
    }

    /// Adds `commit_body` and returns the checksum of the whole span.
    pub fn seal(&mut self, commit_body: &[u8]) -> u32 {
        self.digest.update(commit_body);
        let digest = std::mem::replace(&mut self.digest, CRC32C.digest());
        self.covered = 0;
        digest.finalize()
    }
}

impl Default for CommitDigest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_covers_every_block() {
        let mut digest = CommitDigest::new();
        digest.write(b"data block ");
        digest.write(b"node block ");
        assert_eq!(digest.covered(), 22);
        let crc = digest.seal(b"commit");
        assert_eq!(crc, CRC32C.checksum(b"data block node block commit"));
        assert_eq!(digest.covered(), 0);
    }

    #[test]
    fn test_spans_are_independent() {
        let mut digest = CommitDigest::new();
        digest.write(b"first");
        digest.seal(b"c1");
        digest.write(b"second");
        assert_eq!(digest.seal(b"c2"), CRC32C.checksum(b"secondc2"));
        // an empty span still checksums the commit body
        assert_eq!(digest.seal(b"c3"), CRC32C.checksum(b"c3"));
    }
}
