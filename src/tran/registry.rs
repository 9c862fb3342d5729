use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranKind {
    Read,
    Update,
    Exclusive,
}

/// The part of a transaction other threads can see and force-abort.
#[derive(Debug)]
pub struct TranShared {
    pub id: u64,
    pub kind: TranKind,
    pub started: Instant,
    aborted: Mutex<Option<String>>,
}

impl TranShared {
    /// Error if the transaction was aborted from outside.
    pub fn check(&self) -> Result<()> {
        match self.aborted.lock()?.as_ref() {
            Some(reason) => Err(Error::TransactionAborted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn abort_reason(&self) -> Result<Option<String>> {
        Ok(self.aborted.lock()?.clone())
    }

    fn force_abort(&self, reason: String) -> Result<()> {
        let mut aborted = self.aborted.lock()?;
        if aborted.is_none() {
            *aborted = Some(reason);
        }
        Ok(())
    }
}

/// Outstanding transactions ordered by age.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    live: SkipMap<u64, Arc<TranShared>>,
    exclusive: Mutex<Option<u64>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: TranKind) -> Result<Arc<TranShared>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if kind == TranKind::Exclusive {
            let mut exclusive = self.exclusive.lock()?;
            if let Some(other) = *exclusive {
                return Err(Error::Conflict(format!(
                    "exclusive transaction {} is already active",
                    other
                )));
            }
            *exclusive = Some(id);
        }
        let shared = Arc::new(TranShared {
            id,
            kind,
            started: Instant::now(),
            aborted: Mutex::new(None),
        });
        self.live.insert(id, shared.clone());
        Ok(shared)
    }

    /// Removes a finished transaction.
    pub fn end(&self, id: u64) -> Result<()> {
        self.live.remove(&id);
        let mut exclusive = self.exclusive.lock()?;
        if *exclusive == Some(id) {
            *exclusive = None;
        }
        Ok(())
    }

    /// The active exclusive transaction, if any
    pub fn exclusive(&self) -> Result<Option<u64>> {
        Ok(*self.exclusive.lock()?)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Id of the oldest outstanding transaction
    pub fn oldest(&self) -> Option<u64> {
        self.live.front().map(|e| *e.key())
    }

    fn abort(&self, shared: &TranShared, reason: String) -> Result<()> {
        tracing::warn!(tran = shared.id, kind = ?shared.kind, %reason, "aborting transaction");
        shared.force_abort(reason)?;
        self.end(shared.id)
    }

    /// Aborts the oldest transactions beyond `max` and any older than
    /// `max_age`, returning how many were aborted.
    pub fn limit(&self, max: usize, max_age: Duration) -> Result<usize> {
        let mut aborted = 0;
        while self.live.len() > max {
            let Some(entry) = self.live.front() else { break };
            let shared = entry.value().clone();
            self.abort(&shared, "too many outstanding transactions".to_string())?;
            aborted += 1;
        }
        let now = Instant::now();
        let expired: Vec<Arc<TranShared>> = self
            .live
            .iter()
            .map(|e| e.value().clone())
            .take_while(|t| now.duration_since(t.started) > max_age)
            .collect();
        for shared in expired {
            self.abort(&shared, "transaction exceeded its maximum age".to_string())?;
            aborted += 1;
        }
        Ok(aborted)
    }

    /// Aborts everything, used when the database closes.
    pub fn abort_all(&self, reason: &str) -> Result<usize> {
        let all: Vec<Arc<TranShared>> = self.live.iter().map(|e| e.value().clone()).collect();
        for shared in &all {
            self.abort(shared, reason.to_string())?;
        }
        Ok(all.len())
    }
}
