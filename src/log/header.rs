//! The 16 bytes at address 0 of every database file:
//! `"CINDERDB"`, a u32 BE format version, then 4 reserved zero bytes.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 16;

const MAGIC: &[u8; 8] = b"CINDERDB";
const VERSION: u32 = 1;

pub fn file_header() -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[..8].copy_from_slice(MAGIC);
    BigEndian::write_u32(&mut buf[8..12], VERSION);
    buf
}

/// Accepts a header written by [`file_header`], returning its version.
pub fn check_header(buf: &[u8]) -> Result<u32> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::InvalidHeader);
    }
    if &buf[..8] != MAGIC {
        return Err(Error::InvalidMagic);
    }
    let version = BigEndian::read_u32(&buf[8..12]);
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    if buf[12..HEADER_SIZE].iter().any(|&b| b != 0) {
        return Err(Error::InvalidHeader);
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_header_is_accepted() -> Result<()> {
        let buf = file_header();
        assert_eq!(&buf[..8], b"CINDERDB");
        assert_eq!(check_header(&buf)?, VERSION);
        Ok(())
    }

    #[test]
    fn test_rejects_damaged_headers() {
        let mut other = file_header();
        other[0] = b'S';
        assert!(matches!(check_header(&other), Err(Error::InvalidMagic)));

        let mut newer = file_header();
        BigEndian::write_u32(&mut newer[8..12], 7);
        assert!(matches!(check_header(&newer), Err(Error::UnsupportedVersion(7))));

        let mut reserved = file_header();
        reserved[15] = 1;
        assert!(matches!(check_header(&reserved), Err(Error::InvalidHeader)));

        assert!(matches!(check_header(&file_header()[..10]), Err(Error::InvalidHeader)));
    }
}
