//! Persistent copy-on-write B+tree mapping [`Record`] keys to addresses.
//!
//! Modified nodes live in memory as `Arc`s and are copied on write, so an
//! iterator or an older version of a tree keeps seeing exactly the nodes it
//! started with. [`Btree::persist`] appends the modified nodes to the log
//! bottom-up and leaves the tree fully stored again.

pub mod cache;
mod iter;
mod node;

use std::sync::{Arc, Mutex};

pub use iter::BtreeIter;
pub use node::{Child, Entry, Node};

use crate::error::{Error, Result};
use crate::indexed;
use crate::log::Log;
use crate::record::{Record, RecordBuilder};
use cache::Cache;

/// How an index treats equal column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Keys end with the record address; the columns must be unique.
    Key,
    /// Keys are the bare columns and must be unique.
    Unique,
    /// Keys end with the record address; duplicate columns are fine.
    Dups,
}

/// What a commit needs to find a tree again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BtreeInfo {
    /// Address of the root node, 0 for an empty tree
    pub root: u64,
    /// Levels of tree nodes above the leaves
    pub treelevels: u32,
    pub nnodes: u32,
}

/// Reads and writes nodes in the log through a shared cache.
pub struct NodeStore {
    log: Arc<Log>,
    cache: Mutex<Cache<u64, Arc<Node>>>,
    max_node_size: usize,
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("max_node_size", &self.max_node_size)
            .finish()
    }
}

impl NodeStore {
    pub fn new(log: Arc<Log>, cache_size: usize, max_node_size: usize) -> Self {
        Self {
            log,
            cache: Mutex::new(Cache::new(cache_size)),
            max_node_size,
        }
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    pub fn load(&self, adr: u64) -> Result<Arc<Node>> {
        if adr == 0 {
            return Ok(Arc::new(Node::empty_leaf()));
        }
        if let Some(node) = self.cache.lock()?.get(&adr) {
            return Ok(node);
        }
        let node = Arc::new(Node::decode(&self.log.read_node(adr)?)?);
        self.cache.lock()?.insert(adr, node.clone());
        Ok(node)
    }

    fn write(&self, node: Node) -> Result<u64> {
        let adr = self.log.append_node(&node.encode()?)?;
        self.cache.lock()?.insert(adr, Arc::new(node));
        Ok(adr)
    }

    /// (hits, misses)
    pub fn cache_stats(&self) -> Result<(usize, usize)> {
        Ok(self.cache.lock()?.stats())
    }
}

pub(crate) fn load_child(store: &NodeStore, child: &Child) -> Result<Arc<Node>> {
    match child {
        Child::Mem(node) => Ok(node.clone()),
        Child::Stored(adr) => store.load(*adr),
    }
}

fn make_mut<'a>(store: &NodeStore, child: &'a mut Child) -> Result<&'a mut Node> {
    if let Child::Stored(adr) = child {
        let node = store.load(*adr)?;
        *child = Child::Mem(node);
    }
    match child {
        Child::Mem(node) => Ok(Arc::make_mut(node)),
        Child::Stored(adr) => Err(Error::InvalidState(format!("btree node {} not loaded", adr))),
    }
}

enum Insert {
    Duplicate,
    Done,
    /// The node split; the separator and the new right sibling
    Split(Record, Node),
}

fn insert_into(
    store: &NodeStore,
    child: &mut Child,
    key: Record,
    adr: u64,
    splits: &mut u32,
) -> Result<Insert> {
    let max = store.max_node_size;
    let node = make_mut(store, child)?;
    match node {
        Node::Leaf(entries) => {
            match entries.binary_search_by(|e| e.key.cmp(&key)) {
                Ok(_) => return Ok(Insert::Duplicate),
                Err(pos) => entries.insert(pos, Entry { key, adr }),
            }
            if entries.len() < 2 || node.encoded_size() <= max {
                return Ok(Insert::Done);
            }
            let Node::Leaf(entries) = node else {
                return Ok(Insert::Done);
            };
            let right = entries.split_off(entries.len() / 2);
            let separator = right[0].key.clone();
            *splits += 1;
            Ok(Insert::Split(separator, Node::Leaf(right)))
        }
        Node::Tree { keys, children } => {
            let i = keys.partition_point(|s| *s <= key);
            match insert_into(store, &mut children[i], key, adr, splits)? {
                Insert::Split(separator, right) => {
                    keys.insert(i, separator);
                    children.insert(i + 1, Child::Mem(Arc::new(right)));
                }
                other => return Ok(other),
            }
            if keys.len() < 3 || node.encoded_size() <= max {
                return Ok(Insert::Done);
            }
            let Node::Tree { keys, children } = node else {
                return Ok(Insert::Done);
            };
            let mid = keys.len() / 2;
            let right_keys = keys.split_off(mid + 1);
            let separator = keys.pop().ok_or_else(|| {
                Error::InvalidState("splitting an empty tree node".to_string())
            })?;
            let right_children = children.split_off(mid + 1);
            *splits += 1;
            Ok(Insert::Split(
                separator,
                Node::Tree {
                    keys: right_keys,
                    children: right_children,
                },
            ))
        }
    }
}

/// Removes `key` below `child`, returning true if `child` became empty.
fn remove_from(store: &NodeStore, child: &mut Child, key: &Record, removed: &mut u32) -> Result<bool> {
    let node = make_mut(store, child)?;
    match node {
        Node::Leaf(entries) => {
            if let Ok(pos) = entries.binary_search_by(|e| e.key.cmp(key)) {
                entries.remove(pos);
            }
            Ok(entries.is_empty())
        }
        Node::Tree { keys, children } => {
            let i = keys.partition_point(|s| s <= key);
            if remove_from(store, &mut children[i], key, removed)? {
                children.remove(i);
                *removed += 1;
                if !keys.is_empty() {
                    keys.remove(i.saturating_sub(1));
                }
            }
            Ok(children.is_empty())
        }
    }
}

fn write_child(store: &NodeStore, child: &Child) -> Result<u64> {
    match child {
        Child::Stored(adr) => Ok(*adr),
        Child::Mem(node) => {
            let stored = match node.as_ref() {
                Node::Leaf(entries) => Node::Leaf(entries.clone()),
                Node::Tree { keys, children } => Node::Tree {
                    keys: keys.clone(),
                    children: children
                        .iter()
                        .map(|c| write_child(store, c).map(Child::Stored))
                        .collect::<Result<Vec<_>>>()?,
                },
            };
            store.write(stored)
        }
    }
}

/// Range end covering every key that starts with `prefix`
pub fn prefix_end(prefix: &Record) -> Record {
    RecordBuilder::new().add_all(prefix).add_max().build()
}

#[derive(Debug, Clone)]
pub struct Btree {
    store: Arc<NodeStore>,
    mode: Mode,
    root: Child,
    treelevels: u32,
    nnodes: u32,
}

impl Btree {
    pub fn new(store: Arc<NodeStore>, mode: Mode) -> Self {
        Self::open(store, mode, BtreeInfo::default())
    }

    pub fn open(store: Arc<NodeStore>, mode: Mode, info: BtreeInfo) -> Self {
        Self {
            store,
            mode,
            root: Child::Stored(info.root),
            treelevels: info.treelevels,
            nnodes: info.nnodes,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// True if nodes were changed since the last persist
    pub fn is_dirty(&self) -> bool {
        matches!(self.root, Child::Mem(_))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(load_child(&self.store, &self.root)?.is_empty())
    }

    /// Stats of the tree; `root` is only meaningful when not dirty.
    pub fn info(&self) -> BtreeInfo {
        BtreeInfo {
            root: match self.root {
                Child::Stored(adr) => adr,
                Child::Mem(_) => 0,
            },
            treelevels: self.treelevels,
            nnodes: self.nnodes,
        }
    }

    /// Adds an entry, returning false if the mode's uniqueness rule rejects
    /// it or the exact key is already present.
    pub fn insert(&mut self, key: Record, adr: u64) -> Result<bool> {
        if self.mode == Mode::Key
            && self
                .first_with_prefix(&indexed::strip(&key))?
                .is_some()
        {
            return Ok(false);
        }
        let was_empty = self.is_empty()?;
        let mut splits = 0;
        match insert_into(&self.store, &mut self.root, key, adr, &mut splits)? {
            Insert::Duplicate => return Ok(false),
            Insert::Done => {}
            Insert::Split(separator, right) => {
                let left = std::mem::replace(&mut self.root, Child::Stored(0));
                self.root = Child::Mem(Arc::new(Node::Tree {
                    keys: vec![separator],
                    children: vec![left, Child::Mem(Arc::new(right))],
                }));
                self.treelevels += 1;
                self.nnodes += 1;
            }
        }
        if was_empty {
            self.nnodes += 1;
        }
        self.nnodes += splits;
        Ok(true)
    }

    /// Removes the entry with exactly `key`, returning false if absent.
    pub fn remove(&mut self, key: &Record) -> Result<bool> {
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        let mut removed = 0;
        remove_from(&self.store, &mut self.root, key, &mut removed)?;
        self.nnodes = self.nnodes.saturating_sub(removed);
        loop {
            let only = match &self.root {
                Child::Mem(node) => match node.as_ref() {
                    Node::Tree { children, .. } if children.len() == 1 => Some(children[0].clone()),
                    Node::Tree { children, .. } if children.is_empty() => {
                        Some(Child::Mem(Arc::new(Node::empty_leaf())))
                    }
                    _ => None,
                },
                Child::Stored(_) => None,
            };
            match only {
                Some(child) => {
                    self.root = child;
                    self.treelevels = self.treelevels.saturating_sub(1);
                    self.nnodes = self.nnodes.saturating_sub(1);
                }
                None => break,
            }
        }
        if self.is_empty()? {
            self.treelevels = 0;
            self.nnodes = 0;
        }
        Ok(true)
    }

    /// Address stored under exactly `key`
    pub fn get(&self, key: &Record) -> Result<Option<u64>> {
        let mut node = load_child(&self.store, &self.root)?;
        loop {
            let next = match node.as_ref() {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|e| e.key.cmp(key))
                        .ok()
                        .map(|i| entries[i].adr))
                }
                Node::Tree { keys, children } => {
                    let i = keys.partition_point(|s| s <= key);
                    load_child(&self.store, &children[i])?
                }
            };
            node = next;
        }
    }

    pub fn first_with_prefix(&self, prefix: &Record) -> Result<Option<(Record, u64)>> {
        self.prefix(prefix).next()
    }

    pub fn iter(&self) -> BtreeIter {
        self.range(Record::min(), Record::max())
    }

    /// Entries with `from <= key <= to`
    pub fn range(&self, from: Record, to: Record) -> BtreeIter {
        BtreeIter::new(self.store.clone(), self.root.clone(), from, to)
    }

    pub fn prefix(&self, prefix: &Record) -> BtreeIter {
        self.range(prefix.clone(), prefix_end(prefix))
    }

    /// Writes the modified nodes to the log.
    pub fn persist(&mut self) -> Result<BtreeInfo> {
        if self.is_dirty() {
            self.root = if self.is_empty()? {
                Child::Stored(0)
            } else {
                Child::Stored(write_child(&self.store, &self.root)?)
            };
        }
        Ok(self.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::storage::MemStorage;
    use proptest::prelude::*;

    fn store(max_node_size: usize) -> Result<Arc<NodeStore>> {
        let log = Log::create(Arc::new(MemStorage::new()))?;
        Ok(Arc::new(NodeStore::new(Arc::new(log), 64, max_node_size)))
    }

    fn key(n: i64) -> Record {
        Record::from_values([n])
    }

    fn keys(iter: &mut BtreeIter) -> Result<Vec<i64>> {
        let mut found = Vec::new();
        while let Some((k, _)) = iter.next()? {
            found.push(k.get_int(0)?);
        }
        Ok(found)
    }

    #[test]
    fn test_insert_get_remove() -> Result<()> {
        let mut tree = Btree::new(store(4096)?, Mode::Unique);
        assert!(tree.is_empty()?);
        assert!(tree.insert(key(5), 500)?);
        assert!(tree.insert(key(3), 300)?);
        assert!(!tree.insert(key(5), 501)?);

        assert_eq!(tree.get(&key(3))?, Some(300));
        assert_eq!(tree.get(&key(4))?, None);
        assert!(tree.remove(&key(3))?);
        assert!(!tree.remove(&key(3))?);
        assert_eq!(tree.get(&key(3))?, None);
        assert_eq!(tree.info().nnodes, 1);

        assert!(tree.remove(&key(5))?);
        assert!(tree.is_empty()?);
        assert_eq!(tree.info().nnodes, 0);
        Ok(())
    }

    #[test]
    fn test_splits_keep_order() -> Result<()> {
        let mut tree = Btree::new(store(128)?, Mode::Dups);
        for i in (0..500).rev() {
            assert!(tree.insert(key(i * 7 % 500), i as u64 + 1)?);
        }
        assert!(tree.info().treelevels >= 2);
        assert_eq!(keys(&mut tree.iter())?, (0..500).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_reverse_iteration_and_direction_change() -> Result<()> {
        let mut tree = Btree::new(store(128)?, Mode::Dups);
        for i in 0..200 {
            tree.insert(key(i), i as u64 + 1)?;
        }
        let mut iter = tree.iter();
        let mut back = Vec::new();
        while let Some((k, _)) = iter.prev()? {
            back.push(k.get_int(0)?);
        }
        assert_eq!(back, (0..200).rev().collect::<Vec<_>>());
        assert!(iter.eof());

        iter.rewind();
        assert_eq!(iter.next()?.map(|(_, a)| a), Some(1));
        assert_eq!(iter.next()?.map(|(_, a)| a), Some(2));
        assert_eq!(iter.prev()?.map(|(_, a)| a), Some(1));
        assert_eq!(iter.prev()?, None);
        assert!(iter.eof());
        Ok(())
    }

    #[test]
    fn test_range_and_seek() -> Result<()> {
        let mut tree = Btree::new(store(128)?, Mode::Unique);
        for i in (0..300).step_by(3) {
            tree.insert(key(i), i as u64 + 1)?;
        }
        let mut range = tree.range(key(10), key(20));
        assert_eq!(keys(&mut range)?, vec![12, 15, 18]);

        let mut range = tree.range(key(10), key(20));
        assert_eq!(range.prev()?.map(|(k, _)| k), Some(key(18)));

        let mut iter = tree.iter();
        assert_eq!(iter.seek(&key(100))?.map(|(k, _)| k), Some(key(102)));
        assert_eq!(iter.next()?.map(|(k, _)| k), Some(key(105)));
        assert!(iter.seek(&key(1000))?.is_none());
        assert!(iter.eof());
        Ok(())
    }

    #[test]
    fn test_key_mode_rejects_duplicate_columns() -> Result<()> {
        let mut tree = Btree::new(store(4096)?, Mode::Key);
        let k1 = Record::from_values([Value::from("a"), Value::Int(100)]);
        let k2 = Record::from_values([Value::from("a"), Value::Int(200)]);
        let k3 = Record::from_values([Value::from("b"), Value::Int(200)]);
        assert!(tree.insert(k1.clone(), 100)?);
        assert!(!tree.insert(k2, 200)?);
        assert!(tree.insert(k3, 200)?);

        let found = tree.first_with_prefix(&Record::from_values(["a"]))?;
        assert_eq!(found, Some((k1, 100)));
        assert!(tree.first_with_prefix(&Record::from_values(["c"]))?.is_none());
        Ok(())
    }

    #[test]
    fn test_persist_and_reopen() -> Result<()> {
        let store = store(128)?;
        let mut tree = Btree::new(store.clone(), Mode::Dups);
        for i in 0..300 {
            tree.insert(key(i), i as u64 + 1)?;
        }
        let info = tree.persist()?;
        assert!(!tree.is_dirty());
        assert_ne!(info.root, 0);

        let reopened = Btree::open(store.clone(), Mode::Dups, info);
        assert_eq!(reopened.get(&key(123))?, Some(124));
        assert_eq!(keys(&mut reopened.iter())?.len(), 300);

        let mut empty = Btree::new(store, Mode::Dups);
        assert_eq!(empty.persist()?, BtreeInfo::default());
        Ok(())
    }

    #[test]
    fn test_iterator_keeps_its_version() -> Result<()> {
        let mut tree = Btree::new(store(128)?, Mode::Dups);
        for i in 0..100 {
            tree.insert(key(i), i as u64 + 1)?;
        }
        let mut iter = tree.iter();
        for i in 0..100 {
            tree.remove(&key(i))?;
        }
        assert!(tree.is_empty()?);
        assert_eq!(keys(&mut iter)?.len(), 100);
        Ok(())
    }

    #[test]
    fn test_removing_everything_collapses() -> Result<()> {
        let mut tree = Btree::new(store(128)?, Mode::Dups);
        for i in 0..400 {
            tree.insert(key(i), i as u64 + 1)?;
        }
        tree.persist()?;
        for i in (0..400).filter(|i| i % 5 != 0) {
            assert!(tree.remove(&key(i))?);
        }
        assert_eq!(keys(&mut tree.iter())?, (0..400).step_by(5).collect::<Vec<_>>());
        for i in (0..400).step_by(5) {
            assert!(tree.remove(&key(i))?);
        }
        assert!(tree.is_empty()?);
        assert_eq!(tree.info(), BtreeInfo::default());
        Ok(())
    }

    proptest! {
        #[test]
        fn test_any_insert_order_iterates_sorted(mut values in proptest::collection::vec(any::<i64>(), 1..300)) {
            let mut tree = Btree::new(store(200).map_err(|e| TestCaseError::fail(e.to_string()))?, Mode::Dups);
            for (i, v) in values.iter().enumerate() {
                tree.insert(key(*v), i as u64 + 1).map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            values.sort();
            values.dedup();
            let found = keys(&mut tree.iter()).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(found, values);
        }
    }
}
