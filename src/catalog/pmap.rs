//! Persistent hash array mapped trie.
//!
//! `with` and `without` return a new map that shares every untouched node
//! with the original, so a catalog version costs O(log n) to derive and old
//! versions stay valid for as long as someone holds them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const BITS: u32 = 5;
const FANOUT: u32 = 1 << BITS;
const MASK: u64 = (FANOUT - 1) as u64;
/// Below this depth 64 hash bits are used up and keys collide into buckets
const MAX_DEPTH: u32 = 64 / BITS;

#[derive(Debug)]
enum Node<K, V> {
    Branch {
        bitmap: u32,
        children: Vec<Arc<Node<K, V>>>,
    },
    /// One or more entries sharing a hash prefix at this depth
    Leaf(Vec<(u64, K, V)>),
}

#[derive(Debug)]
pub struct PersistentMap<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

impl<K, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PersistentMap<K, V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn slot(hash: u64, depth: u32) -> u32 {
    ((hash >> (depth * BITS)) & MASK) as u32
}

impl<K, V> PersistentMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = hash_of(key);
        let mut node = self.root.as_ref()?;
        let mut depth = 0;
        loop {
            match node.as_ref() {
                Node::Branch { bitmap, children } => {
                    let bit = 1u32 << slot(hash, depth);
                    if bitmap & bit == 0 {
                        return None;
                    }
                    let idx = (bitmap & (bit - 1)).count_ones() as usize;
                    node = &children[idx];
                    depth += 1;
                }
                Node::Leaf(entries) => {
                    return entries
                        .iter()
                        .find(|(h, k, _)| *h == hash && k == key)
                        .map(|(_, _, v)| v);
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// New map with `key` set to `value`.
    pub fn with(&self, key: K, value: V) -> Self {
        let hash = hash_of(&key);
        let mut added = false;
        let root = match &self.root {
            None => {
                added = true;
                Arc::new(Node::Leaf(vec![(hash, key, value)]))
            }
            Some(root) => Self::insert(root, 0, hash, key, value, &mut added),
        };
        Self {
            root: Some(root),
            len: self.len + usize::from(added),
        }
    }

    fn insert(
        node: &Arc<Node<K, V>>,
        depth: u32,
        hash: u64,
        key: K,
        value: V,
        added: &mut bool,
    ) -> Arc<Node<K, V>> {
        match node.as_ref() {
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << slot(hash, depth);
                let idx = (bitmap & (bit - 1)).count_ones() as usize;
                let mut children = children.clone();
                if bitmap & bit == 0 {
                    *added = true;
                    children.insert(idx, Arc::new(Node::Leaf(vec![(hash, key, value)])));
                } else {
                    children[idx] = Self::insert(&children[idx], depth + 1, hash, key, value, added);
                }
                Arc::new(Node::Branch {
                    bitmap: bitmap | bit,
                    children,
                })
            }
            Node::Leaf(entries) => {
                if let Some(pos) = entries.iter().position(|(h, k, _)| *h == hash && *k == key) {
                    let mut entries = entries.clone();
                    entries[pos].2 = value;
                    return Arc::new(Node::Leaf(entries));
                }
                *added = true;
                let same_hash = entries.iter().all(|(h, _, _)| *h == hash);
                if same_hash || depth >= MAX_DEPTH {
                    let mut entries = entries.clone();
                    entries.push((hash, key, value));
                    return Arc::new(Node::Leaf(entries));
                }
                // split the leaf into a branch one level down
                let mut branch = Arc::new(Node::Branch {
                    bitmap: 0,
                    children: Vec::new(),
                });
                let mut ignored = false;
                for (h, k, v) in entries.iter().cloned() {
                    branch = Self::insert(&branch, depth, h, k, v, &mut ignored);
                }
                Self::insert(&branch, depth, hash, key, value, &mut ignored)
            }
        }
    }

    /// New map without `key`. Returns a clone if the key is absent.
    pub fn without(&self, key: &K) -> Self {
        let Some(root) = &self.root else {
            return self.clone();
        };
        let hash = hash_of(key);
        match Self::remove(root, 0, hash, key) {
            Removal::NotFound => self.clone(),
            Removal::Empty => Self {
                root: None,
                len: self.len - 1,
            },
            Removal::Replaced(node) => Self {
                root: Some(node),
                len: self.len - 1,
            },
        }
    }

    fn remove(node: &Arc<Node<K, V>>, depth: u32, hash: u64, key: &K) -> Removal<K, V> {
        match node.as_ref() {
            Node::Branch { bitmap, children } => {
                let bit = 1u32 << slot(hash, depth);
                if bitmap & bit == 0 {
                    return Removal::NotFound;
                }
                let idx = (bitmap & (bit - 1)).count_ones() as usize;
                match Self::remove(&children[idx], depth + 1, hash, key) {
                    Removal::NotFound => Removal::NotFound,
                    Removal::Replaced(child) => {
                        let mut children = children.clone();
                        children[idx] = child;
                        Removal::Replaced(Arc::new(Node::Branch {
                            bitmap: *bitmap,
                            children,
                        }))
                    }
                    Removal::Empty => {
                        let bitmap = bitmap & !bit;
                        if bitmap == 0 {
                            return Removal::Empty;
                        }
                        let mut children = children.clone();
                        children.remove(idx);
                        Removal::Replaced(Arc::new(Node::Branch { bitmap, children }))
                    }
                }
            }
            Node::Leaf(entries) => {
                let Some(pos) = entries.iter().position(|(h, k, _)| *h == hash && k == key) else {
                    return Removal::NotFound;
                };
                if entries.len() == 1 {
                    return Removal::Empty;
                }
                let mut entries = entries.clone();
                entries.remove(pos);
                Removal::Replaced(Arc::new(Node::Leaf(entries)))
            }
        }
    }

    /// Entries in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut stack: Vec<&Node<K, V>> = self.root.iter().map(|n| n.as_ref()).collect();
        let mut pending: Vec<(&K, &V)> = Vec::new();
        std::iter::from_fn(move || loop {
            if let Some(entry) = pending.pop() {
                return Some(entry);
            }
            match stack.pop()? {
                Node::Branch { children, .. } => stack.extend(children.iter().map(|c| c.as_ref())),
                Node::Leaf(entries) => pending.extend(entries.iter().map(|(_, k, v)| (k, v))),
            }
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }
}

enum Removal<K, V> {
    NotFound,
    Empty,
    Replaced(Arc<Node<K, V>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_with_and_get() {
        let empty: PersistentMap<u32, String> = PersistentMap::new();
        let one = empty.with(1, "one".to_string());
        let two = one.with(2, "two".to_string());

        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 2);
        assert_eq!(two.get(&1).map(String::as_str), Some("one"));
        assert_eq!(two.get(&2).map(String::as_str), Some("two"));
        assert!(one.get(&2).is_none());
    }

    #[test]
    fn test_replace_keeps_len() {
        let map = PersistentMap::new().with("a", 1).with("a", 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"a"), Some(&2));
    }

    #[test]
    fn test_old_versions_unchanged() {
        let mut versions = vec![PersistentMap::new()];
        for i in 0..500u32 {
            let next = versions[versions.len() - 1].with(i, i * 10);
            versions.push(next);
        }
        for (n, version) in versions.iter().enumerate() {
            assert_eq!(version.len(), n);
            for i in 0..500u32 {
                assert_eq!(version.get(&i).is_some(), (i as usize) < n);
            }
        }
    }

    #[test]
    fn test_without() {
        let mut map = PersistentMap::new();
        for i in 0..200u32 {
            map = map.with(i, i);
        }
        let before = map.clone();
        for i in (0..200u32).step_by(2) {
            map = map.without(&i);
        }
        assert_eq!(map.len(), 100);
        assert!(map.get(&4).is_none());
        assert_eq!(map.get(&5), Some(&5));
        assert_eq!(before.len(), 200);
        assert_eq!(before.get(&4), Some(&4));

        let same = map.without(&4);
        assert_eq!(same.len(), 100);
        for i in (1..200u32).step_by(2) {
            map = map.without(&i);
        }
        assert!(map.is_empty());
    }

    #[test]
    fn test_iter_matches_hashmap() {
        let mut map = PersistentMap::new();
        let mut expected = HashMap::new();
        for i in 0..1000u32 {
            let key = format!("table{}", i);
            map = map.with(key.clone(), i);
            expected.insert(key, i);
        }
        let seen: HashMap<String, u32> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(seen, expected);
    }
}
