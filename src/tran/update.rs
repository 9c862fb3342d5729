use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::registry::{TranKind, TranShared};
use super::{no_index, open_btree, TranRead, TranState};
use crate::btree::{Btree, BtreeInfo};
use crate::catalog::bootstrap::is_bootstrap;
use crate::catalog::info::TableInfo;
use crate::catalog::{DbState, Index, Table};
use crate::database::DbInner;
use crate::error::{Error, Result};
use crate::indexed;
use crate::log::Log;
use crate::record::{Record, RecordBuilder};

/// A transaction that can change rows and schema.
///
/// Every write goes to the log right away but only becomes reachable once
/// [`UpdateTransaction::complete`] installs the new state. A row operation
/// that fails, cascades included, leaves the transaction as it was before
/// the call; earlier successful operations stay staged.
pub struct UpdateTransaction {
    pub(super) db: Arc<DbInner>,
    pub(super) shared: Arc<TranShared>,
    /// The committed state this transaction started from
    pub(super) base: Arc<DbState>,
    /// Private working copy
    pub(super) state: DbState,
    pub(super) btrees: HashMap<(u32, Vec<u32>), Btree>,
    /// Tables whose rows changed
    pub(super) written: BTreeSet<u32>,
    /// Tables whose schema changed
    pub(super) altered: BTreeSet<u32>,
    pub(super) created: BTreeSet<u32>,
    pub(super) dropped: BTreeSet<u32>,
    pub(super) outcome: TranState,
    pub(super) conflict: Option<String>,
}

impl UpdateTransaction {
    pub(crate) fn new(db: Arc<DbInner>, kind: TranKind) -> Result<Self> {
        let shared = db.registry.register(kind)?;
        let base = db.current()?;
        let state = (*base).clone();
        Ok(Self {
            db,
            shared,
            base,
            state,
            btrees: HashMap::new(),
            written: BTreeSet::new(),
            altered: BTreeSet::new(),
            created: BTreeSet::new(),
            dropped: BTreeSet::new(),
            outcome: TranState::Active,
            conflict: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_exclusive(&self) -> bool {
        self.shared.kind == TranKind::Exclusive
    }

    pub fn tran_state(&self) -> TranState {
        self.outcome
    }

    /// Why the commit was refused, once `complete` has returned one.
    pub fn conflict(&self) -> Option<String> {
        self.conflict.clone()
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.outcome != TranState::Active {
            return Err(Error::InvalidState(format!(
                "transaction {} is no longer active",
                self.shared.id
            )));
        }
        self.shared.check()
    }

    pub(super) fn finish(&mut self, outcome: TranState) {
        self.outcome = outcome;
        if let Err(e) = self.db.registry.end(self.shared.id) {
            tracing::error!(tran = self.shared.id, error = %e, "failed to end transaction");
        }
    }

    /// Aborts; a no-op once the transaction is no longer active.
    pub fn abort(&mut self) {
        if self.outcome == TranState::Active {
            tracing::debug!(tran = self.shared.id, "transaction aborted");
            self.finish(TranState::Aborted);
        }
    }

    pub fn abort_if_not_complete(&mut self) {
        self.abort();
    }

    /// A user table that may be written
    fn write_table(&self, tblnum: u32) -> Result<Arc<Table>> {
        if is_bootstrap(tblnum) {
            return Err(Error::InvalidOperation(
                "catalog tables cannot be modified directly".to_string(),
            ));
        }
        self.state
            .tables
            .get(tblnum)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(tblnum.to_string()))
    }

    pub(crate) fn table_info(&self, tblnum: u32) -> Result<TableInfo> {
        self.state
            .info(tblnum)
            .map(|info| info.as_ref().clone())
            .ok_or_else(|| Error::TableNotFound(tblnum.to_string()))
    }

    fn update_info(&mut self, tblnum: u32, f: impl FnOnce(&mut TableInfo)) -> Result<()> {
        let mut info = self.table_info(tblnum)?;
        f(&mut info);
        self.state.with_info(info);
        Ok(())
    }

    fn btree_mut(&mut self, tblnum: u32, columns: &[u32]) -> Result<&mut Btree> {
        let key = (tblnum, columns.to_vec());
        if !self.btrees.contains_key(&key) {
            let tree = open_btree(&self.db.store, &self.state, tblnum, columns)?;
            self.btrees.insert(key.clone(), tree);
        }
        self.btrees
            .get_mut(&key)
            .ok_or_else(|| Error::InvalidState("btree vanished".to_string()))
    }

    /// Reads a row and checks it is a live row of `table`.
    fn live_row(&mut self, table: &Table, adr: u64) -> Result<Record> {
        let (tblnum, rec) = self.log().read_data(adr)?;
        let index = table
            .first_index()
            .ok_or_else(|| Error::Schema(format!("{} has no indexes", table.name)))?;
        let key = indexed::key(&rec, &index.columns, adr, index.mode());
        if tblnum != table.num || self.btree_mut(table.num, &index.columns)?.get(&key)? != Some(adr) {
            return Err(Error::InvalidOperation(format!(
                "no record at {} in {}",
                adr, table.name
            )));
        }
        Ok(rec)
    }

    fn insert_keys(&mut self, table: &Table, rec: &Record, adr: u64) -> Result<()> {
        for (i, index) in table.indexes.iter().enumerate() {
            let key = indexed::key(rec, &index.columns, adr, index.mode());
            if !self.btree_mut(table.num, &index.columns)?.insert(key, adr)? {
                for prev in &table.indexes[..i] {
                    let key = indexed::key(rec, &prev.columns, adr, prev.mode());
                    self.btree_mut(table.num, &prev.columns)?.remove(&key)?;
                }
                return Err(duplicate(table, index));
            }
        }
        Ok(())
    }

    fn remove_keys(&mut self, table: &Table, rec: &Record, adr: u64) -> Result<()> {
        for index in &table.indexes {
            let key = indexed::key(rec, &index.columns, adr, index.mode());
            if !self.btree_mut(table.num, &index.columns)?.remove(&key)? {
                return Err(Error::Corrupted(format!(
                    "{} index ({}) is missing the key for {}",
                    table.name,
                    table.column_names(&index.columns),
                    adr
                )));
            }
        }
        Ok(())
    }

    /// Every non-empty foreign key of `rec` must exist in its target. When
    /// `old` is given only changed keys are checked.
    fn check_foreign_keys(&self, table: &Table, rec: &Record, old: Option<&Record>) -> Result<()> {
        for index in &table.indexes {
            let Some(fk) = &index.fkey else { continue };
            let key = indexed::project(rec, &index.columns);
            if key.all_empty() || old.is_some_and(|old| indexed::project(old, &index.columns) == key) {
                continue;
            }
            let target = self.state.tables.get_by_name(&fk.table).ok_or_else(|| {
                Error::ForeignKey(format!("{} references missing table {}", table.name, fk.table))
            })?;
            let columns = target
                .fields_of(&fk.columns.join(","))
                .map_err(|e| Error::ForeignKey(e.to_string()))?;
            if self.lookup(target.num, &columns, &key)?.is_none() {
                return Err(Error::ForeignKey(format!(
                    "{} ({}) blocked by {:?} not found in {}",
                    table.name,
                    table.column_names(&index.columns),
                    key,
                    target.name
                )));
            }
        }
        Ok(())
    }

    /// Applies the foreign key rules of the tables referencing `table` to
    /// the removal (`new` is None) or update of `old`.
    fn cascade(&mut self, table: &Table, old: &Record, new: Option<&Record>) -> Result<()> {
        for (other, i) in self.state.tables.referencing(&table.name) {
            let index = &other.indexes[i];
            let Some(fk) = &index.fkey else { continue };
            let target = table
                .fields_of(&fk.columns.join(","))
                .map_err(|e| Error::ForeignKey(e.to_string()))?;
            let old_key = indexed::project(old, &target);
            let new_key = new.map(|rec| indexed::project(rec, &target));
            if old_key.all_empty() || new_key.as_ref() == Some(&old_key) {
                continue;
            }
            let mut refs = Vec::new();
            let mut iter = self.btree(other.num, &index.columns)?.prefix(&old_key);
            while let Some((_, adr)) = iter.next()? {
                refs.push(adr);
            }
            if refs.is_empty() {
                continue;
            }
            match new_key {
                None if fk.mode.cascades_deletes() => {
                    for adr in refs {
                        self.remove_row(other.num, adr)?;
                    }
                }
                Some(new_key) if fk.mode.cascades_updates() => {
                    for adr in refs {
                        let rec = self.input(adr)?;
                        let updated = replace_fields(&rec, &index.columns, &new_key);
                        self.update_row(other.num, adr, updated)?;
                    }
                }
                _ => {
                    return Err(Error::ForeignKey(format!(
                        "{} blocked by {} ({})",
                        table.name,
                        other.name,
                        other.column_names(&index.columns)
                    )))
                }
            }
        }
        Ok(())
    }

    /// Runs one row operation so that it either applies completely or,
    /// on error, leaves the staged state as it was. Blocks already appended
    /// to the log stay behind unreferenced.
    fn staged<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let state = self.state.clone();
        let btrees = self.btrees.clone();
        let written = self.written.clone();
        let result = op(self);
        if let Err(e) = &result {
            tracing::debug!(tran = self.shared.id, error = %e, "row operation rolled back");
            self.state = state;
            self.btrees = btrees;
            self.written = written;
        }
        result
    }

    pub fn add_record(&mut self, tblnum: u32, rec: Record) -> Result<u64> {
        self.check_active()?;
        self.staged(|tran| tran.add_row(tblnum, rec))
    }

    /// Replaces the row at `oldadr`, returning the new row's address.
    ///
    /// A foreign key refusal anywhere in the cascade undoes the whole update.
    pub fn update_record(&mut self, tblnum: u32, oldadr: u64, newrec: Record) -> Result<u64> {
        self.check_active()?;
        self.staged(|tran| tran.update_row(tblnum, oldadr, newrec))
    }

    pub fn update_record_by_value(&mut self, tblnum: u32, oldrec: &Record, newrec: Record) -> Result<u64> {
        let adr = self.find(tblnum, oldrec)?;
        self.update_record(tblnum, adr, newrec)
    }

    /// Removes the row at `adr` along with any cascaded removals; a refusal
    /// undoes all of them.
    pub fn remove_record(&mut self, tblnum: u32, adr: u64) -> Result<()> {
        self.check_active()?;
        self.staged(|tran| tran.remove_row(tblnum, adr))
    }

    fn add_row(&mut self, tblnum: u32, rec: Record) -> Result<u64> {
        let table = self.write_table(tblnum)?;
        self.check_foreign_keys(&table, &rec, None)?;
        let adr = self.log().append_data(tblnum, &rec)?;
        self.insert_keys(&table, &rec, adr)?;
        let size = rec.pack_size() as u64;
        self.update_info(tblnum, |info| {
            info.nrows += 1;
            info.totalsize += size;
        })?;
        self.written.insert(tblnum);
        Ok(adr)
    }

    fn update_row(&mut self, tblnum: u32, oldadr: u64, newrec: Record) -> Result<u64> {
        let table = self.write_table(tblnum)?;
        let old = self.live_row(&table, oldadr)?;
        self.check_foreign_keys(&table, &newrec, Some(&old))?;
        self.remove_keys(&table, &old, oldadr)?;
        let adr = self.log().append_data(tblnum, &newrec)?;
        self.insert_keys(&table, &newrec, adr)?;
        let (old_size, new_size) = (old.pack_size() as u64, newrec.pack_size() as u64);
        self.update_info(tblnum, |info| {
            info.totalsize = (info.totalsize + new_size).saturating_sub(old_size);
        })?;
        self.written.insert(tblnum);
        // after the new keys are in, so cascaded child updates find them
        self.cascade(&table, &old, Some(&newrec))?;
        Ok(adr)
    }

    fn remove_row(&mut self, tblnum: u32, adr: u64) -> Result<()> {
        let table = self.write_table(tblnum)?;
        let rec = self.live_row(&table, adr)?;
        self.cascade(&table, &rec, None)?;
        self.remove_keys(&table, &rec, adr)?;
        let size = rec.pack_size() as u64;
        self.update_info(tblnum, |info| {
            info.nrows = info.nrows.saturating_sub(1);
            info.totalsize = info.totalsize.saturating_sub(size);
        })?;
        self.written.insert(tblnum);
        Ok(())
    }

    pub fn remove_record_by_value(&mut self, tblnum: u32, rec: &Record) -> Result<()> {
        let adr = self.find(tblnum, rec)?;
        self.remove_record(tblnum, adr)
    }

    /// Address of a live row equal to `rec`
    fn find(&self, tblnum: u32, rec: &Record) -> Result<u64> {
        let table = self
            .state()?
            .tables
            .get(tblnum)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(tblnum.to_string()))?;
        let index = table
            .indexes
            .iter()
            .find(|i| i.is_key)
            .or_else(|| table.first_index())
            .ok_or_else(|| Error::Schema(format!("{} has no indexes", table.name)))?;
        let prefix = indexed::project(rec, &index.columns);
        let mut iter = self.btree(tblnum, &index.columns)?.prefix(&prefix);
        while let Some((_, adr)) = iter.next()? {
            if self.input(adr)? == *rec {
                return Ok(adr);
            }
        }
        Err(Error::InvalidOperation(format!(
            "record not found in {}: {:?}",
            table.name, rec
        )))
    }

    // Schema changes, driven by the table builder.

    pub(crate) fn allocate_tblnum(&mut self) -> u32 {
        let num = self.state.next_tblnum;
        self.state.next_tblnum += 1;
        num
    }

    /// Stages a new or changed table definition.
    pub(crate) fn put_table(&mut self, table: Table, info: TableInfo, created: bool) -> Result<()> {
        self.check_active()?;
        let num = table.num;
        self.btrees
            .retain(|(t, cols), _| *t != num || table.index(cols).is_some());
        if created {
            self.created.insert(num);
        } else {
            self.altered.insert(num);
        }
        self.state.tables = self.state.tables.with(table);
        self.state.with_info(info);
        Ok(())
    }

    pub(crate) fn remove_table(&mut self, num: u32) -> Result<()> {
        self.check_active()?;
        self.write_table(num)?;
        self.btrees.retain(|(t, _), _| *t != num);
        self.state.tables = self.state.tables.without(num);
        self.state.infos = self.state.infos.without(&num);
        self.dropped.insert(num);
        Ok(())
    }

    /// Fills a freshly declared index by scanning the first index of the
    /// table as currently staged. Call before staging the new definition.
    pub(crate) fn build_index(&mut self, tblnum: u32, index: &Index) -> Result<()> {
        self.check_active()?;
        let table = self.write_table(tblnum)?;
        let first = table
            .first_index()
            .ok_or_else(|| Error::Schema(format!("{} has no indexes", table.name)))?;
        let mut rows = self.iter(tblnum, &first.columns)?;
        let mut tree = Btree::new(self.db.store.clone(), index.mode());
        while let Some((adr, rec)) = rows.next()? {
            if !tree.insert(indexed::key(&rec, &index.columns, adr, index.mode()), adr)? {
                return Err(duplicate(&table, index));
            }
        }
        self.btrees.insert((tblnum, index.columns.clone()), tree);
        self.written.insert(tblnum);
        Ok(())
    }

    // Bulk paths used by the loader and rebuild.

    /// Appends a row and indexes it in the first index only.
    pub(crate) fn append_row(&mut self, tblnum: u32, rec: &Record) -> Result<u64> {
        self.check_active()?;
        let table = self.write_table(tblnum)?;
        let first = table
            .first_index()
            .ok_or_else(|| Error::Schema(format!("{} has no indexes", table.name)))?;
        let adr = self.log().append_data(tblnum, rec)?;
        self.index_row(&table, first, rec, adr)?;
        let size = rec.pack_size() as u64;
        self.update_info(tblnum, |info| {
            info.nrows += 1;
            info.totalsize += size;
        })?;
        self.written.insert(tblnum);
        Ok(adr)
    }

    /// Adds the key of an already appended row to one index.
    pub(crate) fn index_row(&mut self, table: &Table, index: &Index, rec: &Record, adr: u64) -> Result<()> {
        let key = indexed::key(rec, &index.columns, adr, index.mode());
        if !self.btree_mut(table.num, &index.columns)?.insert(key, adr)? {
            return Err(duplicate(table, index));
        }
        self.written.insert(table.num);
        Ok(())
    }

    /// Writes an index's nodes now rather than at commit.
    pub(crate) fn persist_index(&mut self, tblnum: u32, columns: &[u32]) -> Result<()> {
        let info = self.btree_mut(tblnum, columns)?.persist()?;
        self.update_info(tblnum, |t| t.set_index(columns, info))
    }

    /// Replaces an index with an empty one.
    pub(crate) fn reset_index(&mut self, tblnum: u32, columns: &[u32]) -> Result<()> {
        let table = self.write_table(tblnum)?;
        let index = table.index(columns).ok_or_else(|| no_index(&table, columns))?;
        self.btrees.insert(
            (tblnum, columns.to_vec()),
            Btree::new(self.db.store.clone(), index.mode()),
        );
        self.written.insert(tblnum);
        self.update_info(tblnum, |info| info.set_index(columns, BtreeInfo::default()))
    }

    pub(crate) fn set_counts(&mut self, tblnum: u32, nrows: u64, totalsize: u64) -> Result<()> {
        self.written.insert(tblnum);
        self.update_info(tblnum, |info| {
            info.nrows = nrows;
            info.totalsize = totalsize;
        })
    }

    /// Raises the table's next field number to at least `nextfield`.
    pub(crate) fn reserve_fields(&mut self, tblnum: u32, nextfield: u32) -> Result<()> {
        self.written.insert(tblnum);
        self.update_info(tblnum, |info| info.nextfield = info.nextfield.max(nextfield))
    }
}

fn duplicate(table: &Table, index: &Index) -> Error {
    Error::DuplicateKey {
        table: table.name.clone(),
        index: table.render_index(index),
    }
}

/// `rec` with the fields listed in `fields` set from `values`.
fn replace_fields(rec: &Record, fields: &[u32], values: &Record) -> Record {
    let n = fields
        .iter()
        .map(|&f| f as usize + 1)
        .max()
        .unwrap_or(0)
        .max(rec.size());
    let mut builder = RecordBuilder::new();
    for f in 0..n {
        match fields.iter().position(|&c| c as usize == f) {
            Some(j) => builder.add_raw(values.get_raw(j)),
            None => builder.add_raw(rec.get_raw(f)),
        };
    }
    builder.trim().build()
}

impl Drop for UpdateTransaction {
    fn drop(&mut self) {
        self.abort_if_not_complete();
    }
}

impl TranRead for UpdateTransaction {
    fn state(&self) -> Result<&DbState> {
        self.check_active()?;
        Ok(&self.state)
    }

    fn btree(&self, tblnum: u32, columns: &[u32]) -> Result<Btree> {
        match self.btrees.get(&(tblnum, columns.to_vec())) {
            Some(tree) => Ok(tree.clone()),
            None => open_btree(&self.db.store, self.state()?, tblnum, columns),
        }
    }

    fn log(&self) -> &Arc<Log> {
        self.db.store.log()
    }
}
