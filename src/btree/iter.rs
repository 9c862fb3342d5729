use std::sync::Arc;

use super::{load_child, Child, Node, NodeStore};
use crate::error::Result;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Rewound,
    Positioned,
    Eof,
}

/// Bidirectional cursor over the entries in `[from, to]`.
///
/// The cursor holds the root it was created from, so changes made to the
/// tree afterwards are not seen. Once it runs off either end it stays at
/// eof until rewound.
#[derive(Debug)]
pub struct BtreeIter {
    store: Arc<NodeStore>,
    root: Child,
    from: Record,
    to: Record,
    /// Path from the root; tree nodes hold the child index, the leaf holds
    /// the entry index.
    stack: Vec<(Arc<Node>, usize)>,
    state: State,
}

impl BtreeIter {
    pub(super) fn new(store: Arc<NodeStore>, root: Child, from: Record, to: Record) -> Self {
        Self {
            store,
            root,
            from,
            to,
            stack: Vec::new(),
            state: State::Rewound,
        }
    }

    pub fn eof(&self) -> bool {
        self.state == State::Eof
    }

    pub fn rewind(&mut self) {
        self.stack.clear();
        self.state = State::Rewound;
    }

    pub fn next(&mut self) -> Result<Option<(Record, u64)>> {
        let found = match self.state {
            State::Eof => return Ok(None),
            State::Rewound => {
                let from = self.from.clone();
                self.position(&from, true)?
            }
            State::Positioned => self.step(true)?,
        };
        Ok(self.settle(found))
    }

    pub fn prev(&mut self) -> Result<Option<(Record, u64)>> {
        let found = match self.state {
            State::Eof => return Ok(None),
            State::Rewound => {
                let to = self.to.clone();
                self.position(&to, false)?
            }
            State::Positioned => self.step(false)?,
        };
        Ok(self.settle(found))
    }

    /// Positions at the first entry `>= key` within the range.
    pub fn seek(&mut self, key: &Record) -> Result<Option<(Record, u64)>> {
        let key = if *key < self.from { self.from.clone() } else { key.clone() };
        let found = self.position(&key, true)?;
        Ok(self.settle(found))
    }

    fn settle(&mut self, found: bool) -> Option<(Record, u64)> {
        let current = if found { self.current() } else { None };
        match current {
            Some((key, adr)) if key >= self.from && key <= self.to => {
                self.state = State::Positioned;
                Some((key, adr))
            }
            _ => {
                self.stack.clear();
                self.state = State::Eof;
                None
            }
        }
    }

    fn current(&self) -> Option<(Record, u64)> {
        let (node, i) = self.stack.last()?;
        match node.as_ref() {
            Node::Leaf(entries) => entries.get(*i).map(|e| (e.key.clone(), e.adr)),
            Node::Tree { .. } => None,
        }
    }

    /// Descends to the leaf that would hold `key`. Forward lands on the
    /// first entry `>= key`, backward on the last entry `<= key`.
    fn position(&mut self, key: &Record, forward: bool) -> Result<bool> {
        self.stack.clear();
        let mut node = load_child(&self.store, &self.root)?;
        loop {
            let down = match node.as_ref() {
                Node::Tree { keys, children } => {
                    let i = keys.partition_point(|s| s <= key);
                    Some((i, load_child(&self.store, &children[i])?))
                }
                Node::Leaf(_) => None,
            };
            let Some((i, child)) = down else { break };
            let parent = std::mem::replace(&mut node, child);
            self.stack.push((parent, i));
        }
        let (pos, len) = match node.as_ref() {
            Node::Leaf(entries) if forward => (entries.partition_point(|e| e.key < *key), entries.len()),
            Node::Leaf(entries) => (entries.partition_point(|e| e.key <= *key), entries.len()),
            Node::Tree { .. } => (0, 0),
        };
        if forward {
            if pos < len {
                self.stack.push((node, pos));
                return Ok(true);
            }
        } else if pos > 0 {
            self.stack.push((node, pos - 1));
            return Ok(true);
        }
        self.next_leaf(forward)
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        if let Some((node, i)) = self.stack.last_mut() {
            let len = match node.as_ref() {
                Node::Leaf(entries) => entries.len(),
                Node::Tree { .. } => 0,
            };
            if forward && *i + 1 < len {
                *i += 1;
                return Ok(true);
            }
            if !forward && *i > 0 && *i <= len {
                *i -= 1;
                return Ok(true);
            }
        }
        self.stack.pop();
        self.next_leaf(forward)
    }

    /// Moves to the neighbouring leaf. The top of the stack must be a tree
    /// node or the stack empty.
    fn next_leaf(&mut self, forward: bool) -> Result<bool> {
        loop {
            let sibling = {
                let Some((node, i)) = self.stack.last_mut() else {
                    return Ok(false);
                };
                match node.as_ref() {
                    Node::Tree { children, .. } if forward && *i + 1 < children.len() => {
                        *i += 1;
                        Some(children[*i].clone())
                    }
                    Node::Tree { children, .. } if !forward && *i > 0 => {
                        *i -= 1;
                        Some(children[*i].clone())
                    }
                    _ => None,
                }
            };
            match sibling {
                None => {
                    self.stack.pop();
                }
                Some(child) => {
                    self.descend_edge(&child, forward)?;
                    if self.current().is_some() {
                        return Ok(true);
                    }
                    self.stack.pop();
                }
            }
        }
    }

    /// Pushes the path to the first (forward) or last entry below `child`.
    fn descend_edge(&mut self, child: &Child, forward: bool) -> Result<()> {
        let mut node = load_child(&self.store, child)?;
        loop {
            let down = match node.as_ref() {
                Node::Tree { children, .. } => {
                    let i = if forward { 0 } else { children.len().saturating_sub(1) };
                    match children.get(i) {
                        Some(c) => Some((i, load_child(&self.store, c)?)),
                        None => None,
                    }
                }
                Node::Leaf(_) => None,
            };
            let Some((i, child)) = down else { break };
            let parent = std::mem::replace(&mut node, child);
            self.stack.push((parent, i));
        }
        let i = match node.as_ref() {
            Node::Leaf(entries) if !forward => entries.len().saturating_sub(1),
            _ => 0,
        };
        self.stack.push((node, i));
        Ok(())
    }
}
