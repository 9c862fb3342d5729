use std::sync::Arc;

use super::registry::{TranKind, TranShared};
use super::{open_btree, TranRead};
use crate::btree::Btree;
use crate::catalog::DbState;
use crate::database::DbInner;
use crate::error::{Error, Result};
use crate::log::Log;

/// A consistent view of one committed state.
pub struct ReadTransaction {
    db: Arc<DbInner>,
    shared: Arc<TranShared>,
    state: Arc<DbState>,
    ended: bool,
}

impl ReadTransaction {
    pub(crate) fn new(db: Arc<DbInner>) -> Result<Self> {
        let shared = db.registry.register(TranKind::Read)?;
        let state = db.current()?;
        Ok(Self {
            db,
            shared,
            state,
            ended: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Commit sequence of the state being read
    pub fn seq(&self) -> u64 {
        self.state.seq
    }

    /// Ends the transaction. Returns the reason if it was aborted from
    /// outside in the meantime.
    ///
    /// # Panics
    ///
    /// If the transaction was already completed.
    pub fn complete(&mut self) -> Result<Option<String>> {
        if self.ended {
            panic!("read transaction {} completed twice", self.shared.id);
        }
        self.ended = true;
        self.db.registry.end(self.shared.id)?;
        self.shared.abort_reason()
    }

    pub fn abort_if_not_complete(&mut self) {
        if !self.ended {
            self.ended = true;
            if let Err(e) = self.db.registry.end(self.shared.id) {
                tracing::error!(tran = self.shared.id, error = %e, "failed to end read transaction");
            }
        }
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.abort_if_not_complete();
    }
}

impl TranRead for ReadTransaction {
    fn state(&self) -> Result<&DbState> {
        if self.ended {
            return Err(Error::InvalidState(format!(
                "read transaction {} has ended",
                self.shared.id
            )));
        }
        self.shared.check()?;
        Ok(&self.state)
    }

    fn btree(&self, tblnum: u32, columns: &[u32]) -> Result<Btree> {
        open_btree(&self.db.store, self.state()?, tblnum, columns)
    }

    fn log(&self) -> &Arc<Log> {
        self.db.store.log()
    }
}
