//! Transactions.
//!
//! A read transaction pins one committed [`DbState`] and never blocks. An
//! update transaction works on a private copy of the state and private
//! copy-on-write btrees, and makes them visible only when its commit is
//! accepted. Commits are first-committer-wins per table.

mod commit;
mod read;
pub mod registry;
mod update;

use std::sync::Arc;

pub use read::ReadTransaction;
pub use registry::{Registry, TranKind, TranShared};
pub use update::UpdateTransaction;

use crate::btree::{prefix_end, Btree, BtreeIter, NodeStore};
use crate::catalog::{DbState, Table};
use crate::error::{Error, Result};
use crate::log::Log;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranState {
    Active,
    Committed,
    Aborted,
}

/// Opens the committed btree of an index as of `state`.
pub(crate) fn open_btree(
    store: &Arc<NodeStore>,
    state: &DbState,
    tblnum: u32,
    columns: &[u32],
) -> Result<Btree> {
    let table = state
        .tables
        .get(tblnum)
        .ok_or_else(|| Error::TableNotFound(tblnum.to_string()))?;
    let index = table.index(columns).ok_or_else(|| no_index(table, columns))?;
    let info = state
        .info(tblnum)
        .and_then(|info| info.index(columns))
        .map(|i| i.btree)
        .unwrap_or_default();
    Ok(Btree::open(store.clone(), index.mode(), info))
}

pub(crate) fn no_index(table: &Table, columns: &[u32]) -> Error {
    Error::InvalidOperation(format!(
        "{} has no index on ({})",
        table.name,
        table.column_names(columns)
    ))
}

/// Reading side shared by both kinds of transaction.
pub trait TranRead {
    /// The state this transaction sees, or an error once it is aborted.
    fn state(&self) -> Result<&DbState>;

    /// The btree of the index on `columns` as this transaction sees it.
    fn btree(&self, tblnum: u32, columns: &[u32]) -> Result<Btree>;

    fn log(&self) -> &Arc<Log>;

    fn get_table(&self, name: &str) -> Result<Option<Arc<Table>>> {
        Ok(self.state()?.tables.get_by_name(name).cloned())
    }

    fn get_table_by_num(&self, num: u32) -> Result<Option<Arc<Table>>> {
        Ok(self.state()?.tables.get(num).cloned())
    }

    fn table_count(&self, tblnum: u32) -> Result<u64> {
        self.state()?
            .info(tblnum)
            .map(|info| info.nrows)
            .ok_or_else(|| Error::TableNotFound(tblnum.to_string()))
    }

    /// Total packed size of the table's records
    fn table_size(&self, tblnum: u32) -> Result<u64> {
        self.state()?
            .info(tblnum)
            .map(|info| info.totalsize)
            .ok_or_else(|| Error::TableNotFound(tblnum.to_string()))
    }

    fn iter(&self, tblnum: u32, columns: &[u32]) -> Result<TableIter> {
        let btree = self.btree(tblnum, columns)?;
        Ok(TableIter::new(btree.iter(), self.log().clone()))
    }

    /// Rows whose index columns lie in `[from, to]`. A bound with fewer
    /// fields than the index acts as a prefix.
    fn iter_range(&self, tblnum: u32, columns: &[u32], from: Record, to: Record) -> Result<TableIter> {
        let btree = self.btree(tblnum, columns)?;
        Ok(TableIter::new(btree.range(from, prefix_end(&to)), self.log().clone()))
    }

    /// The row whose index columns equal `key`
    fn lookup(&self, tblnum: u32, columns: &[u32], key: &Record) -> Result<Option<Record>> {
        match self.btree(tblnum, columns)?.first_with_prefix(key)? {
            Some((_, adr)) => self.input(adr).map(Some),
            None => Ok(None),
        }
    }

    /// The record stored at `adr`
    fn input(&self, adr: u64) -> Result<Record> {
        self.state()?;
        Ok(self.log().read_data(adr)?.1)
    }
}

/// Rows of a table in index order.
#[derive(Debug)]
pub struct TableIter {
    iter: BtreeIter,
    log: Arc<Log>,
}

impl TableIter {
    fn new(iter: BtreeIter, log: Arc<Log>) -> Self {
        Self { iter, log }
    }

    pub fn next(&mut self) -> Result<Option<(u64, Record)>> {
        match self.iter.next()? {
            Some((_, adr)) => Ok(Some((adr, self.log.read_data(adr)?.1))),
            None => Ok(None),
        }
    }

    pub fn prev(&mut self) -> Result<Option<(u64, Record)>> {
        match self.iter.prev()? {
            Some((_, adr)) => Ok(Some((adr, self.log.read_data(adr)?.1))),
            None => Ok(None),
        }
    }

    pub fn eof(&self) -> bool {
        self.iter.eof()
    }

    pub fn rewind(&mut self) {
        self.iter.rewind();
    }

    /// Collects the remaining rows.
    pub fn records(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some((_, rec)) = self.next()? {
            records.push(rec);
        }
        Ok(records)
    }
}
