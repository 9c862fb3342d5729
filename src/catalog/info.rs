use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::btree::BtreeInfo;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub columns: Vec<u32>,
    pub btree: BtreeInfo,
}

/// Per table statistics, kept for cross checking against the indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub tblnum: u32,
    /// Next unused field number
    pub nextfield: u32,
    pub nrows: u64,
    /// Sum of the packed sizes of the live records
    pub totalsize: u64,
    pub indexes: Vec<IndexInfo>,
    /// Commit sequence that last changed this table. Not persisted.
    pub modified: u64,
}

impl TableInfo {
    pub fn new(tblnum: u32) -> Self {
        Self {
            tblnum,
            nextfield: 0,
            nrows: 0,
            totalsize: 0,
            indexes: Vec::new(),
            modified: 0,
        }
    }

    pub fn index(&self, columns: &[u32]) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.columns == columns)
    }

    pub fn index_mut(&mut self, columns: &[u32]) -> Option<&mut IndexInfo> {
        self.indexes.iter_mut().find(|i| i.columns == columns)
    }

    pub fn set_index(&mut self, columns: &[u32], btree: BtreeInfo) {
        match self.index_mut(columns) {
            Some(info) => info.btree = btree,
            None => self.indexes.push(IndexInfo {
                columns: columns.to_vec(),
                btree,
            }),
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<BigEndian>(self.tblnum)?;
        buf.write_u32::<BigEndian>(self.nextfield)?;
        buf.write_u64::<BigEndian>(self.nrows)?;
        buf.write_u64::<BigEndian>(self.totalsize)?;
        buf.write_u8(self.indexes.len() as u8)?;
        for index in &self.indexes {
            buf.write_u8(index.columns.len() as u8)?;
            for &col in &index.columns {
                buf.write_u32::<BigEndian>(col)?;
            }
            buf.write_u64::<BigEndian>(index.btree.root)?;
            buf.write_u32::<BigEndian>(index.btree.treelevels)?;
            buf.write_u32::<BigEndian>(index.btree.nnodes)?;
        }
        Ok(())
    }

    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        let tblnum = reader.read_u32::<BigEndian>()?;
        let nextfield = reader.read_u32::<BigEndian>()?;
        let nrows = reader.read_u64::<BigEndian>()?;
        let totalsize = reader.read_u64::<BigEndian>()?;
        let nindexes = reader.read_u8()?;
        let mut indexes = Vec::with_capacity(nindexes as usize);
        for _ in 0..nindexes {
            let ncols = reader.read_u8()?;
            let columns = (0..ncols)
                .map(|_| reader.read_u32::<BigEndian>())
                .collect::<std::io::Result<Vec<_>>>()?;
            let btree = BtreeInfo {
                root: reader.read_u64::<BigEndian>()?,
                treelevels: reader.read_u32::<BigEndian>()?,
                nnodes: reader.read_u32::<BigEndian>()?,
            };
            indexes.push(IndexInfo { columns, btree });
        }
        Ok(Self {
            tblnum,
            nextfield,
            nrows,
            totalsize,
            indexes,
            modified: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_set_index() {
        let mut info = TableInfo::new(9);
        info.set_index(&[0, 1], BtreeInfo::default());
        info.set_index(
            &[0, 1],
            BtreeInfo {
                root: 100,
                treelevels: 2,
                nnodes: 5,
            },
        );
        assert_eq!(info.indexes.len(), 1);
        assert_eq!(info.index(&[0, 1]).map(|i| i.btree.root), Some(100));
        assert!(info.index(&[1]).is_none());
    }

    #[test]
    fn test_encoding_skips_modified() -> Result<()> {
        let mut info = TableInfo::new(2);
        info.nextfield = 11;
        info.nrows = 3;
        info.totalsize = 99;
        info.modified = 42;
        info.set_index(&[0, 1], BtreeInfo::default());

        let mut buf = Vec::new();
        info.encode_into(&mut buf)?;
        let decoded = TableInfo::decode_from(&mut Cursor::new(&buf))?;
        assert_eq!(decoded.modified, 0);
        info.modified = 0;
        assert_eq!(decoded, info);
        Ok(())
    }
}
