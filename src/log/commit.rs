use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::catalog::info::TableInfo;
use crate::error::Result;
use crate::Error;

/// Payload of a commit block.
///
/// The catalog tables cannot record their own btree roots in themselves, so
/// their statistics and roots travel in every commit record instead.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub seq: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub next_tblnum: u32,
    pub bootstrap: Vec<TableInfo>,
}

impl CommitRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        buf.write_u64::<BigEndian>(self.seq)?;
        buf.write_u64::<BigEndian>(self.timestamp)?;
        buf.write_u32::<BigEndian>(self.next_tblnum)?;
        buf.write_u8(self.bootstrap.len() as u8)?;
        for info in &self.bootstrap {
            info.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let seq = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_u64::<BigEndian>()?;
        let next_tblnum = cursor.read_u32::<BigEndian>()?;
        let n = cursor.read_u8()?;
        let bootstrap = (0..n)
            .map(|_| TableInfo::decode_from(&mut cursor))
            .collect::<Result<Vec<_>>>()?;
        if cursor.position() as usize != bytes.len() {
            return Err(Error::InvalidData(
                "trailing bytes in commit record".to_string(),
            ));
        }
        Ok(Self {
            seq,
            timestamp,
            next_tblnum,
            bootstrap,
        })
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
