//! Btree nodes and their on-disk encoding.
//!
//! ```text
//! leaf: 00 | count: u16 | { key_len: u32 | key | adr: u64 } * count
//! tree: 01 | count: u16 | child0: u64 | { key_len: u32 | key | child: u64 } * count
//! ```
//!
//! In a tree node every key in `children[i + 1]` is `>= keys[i]` and every
//! key in `children[i]` is `< keys[i]`.

use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::record::Record;
use crate::Error;

const LEAF: u8 = 0;
const TREE: u8 = 1;

#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Record,
    pub adr: u64,
}

#[derive(Debug, Clone)]
pub enum Child {
    /// Written to the log at this address; 0 is the empty leaf
    Stored(u64),
    /// Modified since it was last written
    Mem(Arc<Node>),
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Vec<Entry>),
    Tree {
        keys: Vec<Record>,
        children: Vec<Child>,
    },
}

impl Node {
    pub fn empty_leaf() -> Node {
        Node::Leaf(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Node::Leaf(entries) => entries.is_empty(),
            Node::Tree { children, .. } => children.is_empty(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf(entries) => {
                3 + entries
                    .iter()
                    .map(|e| 12 + e.key.pack_size())
                    .sum::<usize>()
            }
            Node::Tree { keys, .. } => {
                11 + keys.iter().map(|k| 12 + k.pack_size()).sum::<usize>()
            }
        }
    }

    /// Encodes a node whose children have all been written.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        match self {
            Node::Leaf(entries) => {
                buf.write_u8(LEAF)?;
                buf.write_u16::<BigEndian>(entries.len() as u16)?;
                for entry in entries {
                    write_key(&mut buf, &entry.key)?;
                    buf.write_u64::<BigEndian>(entry.adr)?;
                }
            }
            Node::Tree { keys, children } => {
                buf.write_u8(TREE)?;
                buf.write_u16::<BigEndian>(keys.len() as u16)?;
                buf.write_u64::<BigEndian>(stored(&children[0])?)?;
                for (key, child) in keys.iter().zip(&children[1..]) {
                    write_key(&mut buf, key)?;
                    buf.write_u64::<BigEndian>(stored(child)?)?;
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Node> {
        let mut cursor = Cursor::new(bytes);
        let kind = cursor.read_u8()?;
        let count = cursor.read_u16::<BigEndian>()? as usize;
        let node = match kind {
            LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = read_key(&mut cursor)?;
                    let adr = cursor.read_u64::<BigEndian>()?;
                    entries.push(Entry { key, adr });
                }
                Node::Leaf(entries)
            }
            TREE => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(Child::Stored(cursor.read_u64::<BigEndian>()?));
                for _ in 0..count {
                    keys.push(read_key(&mut cursor)?);
                    children.push(Child::Stored(cursor.read_u64::<BigEndian>()?));
                }
                Node::Tree { keys, children }
            }
            other => {
                return Err(Error::InvalidData(format!(
                    "bad btree node type {}",
                    other
                )))
            }
        };
        if cursor.position() as usize != bytes.len() {
            return Err(Error::InvalidData("trailing bytes in btree node".to_string()));
        }
        Ok(node)
    }
}

fn stored(child: &Child) -> Result<u64> {
    match child {
        Child::Stored(adr) => Ok(*adr),
        Child::Mem(_) => Err(Error::InvalidState(
            "encoding a btree node with unwritten children".to_string(),
        )),
    }
}

fn write_key(buf: &mut Vec<u8>, key: &Record) -> Result<()> {
    let bytes = key.as_bytes();
    buf.write_u32::<BigEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<Record> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::InvalidData("btree key runs past node".to_string()));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Record::from_bytes(bytes)
}
