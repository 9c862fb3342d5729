//! Committing an update transaction.
//!
//! Under the commit mutex the transaction is checked against the latest
//! committed state, then its dirty btrees are written, the catalog rows of
//! every touched table are rewritten and a commit block seals it all. The
//! new state is derived from the latest one, not from the snapshot, so
//! commits to other tables in the meantime are kept.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::update::UpdateTransaction;
use super::TranState;
use crate::btree::{Btree, Mode, NodeStore};
use crate::catalog::bootstrap::{self, INDEXES, TABLES};
use crate::catalog::info::TableInfo;
use crate::catalog::{DbState, Table};
use crate::error::{Error, Result};
use crate::indexed;
use crate::log::{commit::now_millis, CommitRecord};
use crate::record::Record;

impl UpdateTransaction {
    /// Commits. `None` means success; `Some` carries the reason the
    /// transaction was aborted instead.
    ///
    /// # Panics
    ///
    /// If the transaction already completed or was aborted.
    pub fn complete(&mut self) -> Result<Option<String>> {
        if self.outcome != TranState::Active {
            panic!("transaction {} completed twice", self.shared.id);
        }
        if let Some(reason) = self.shared.abort_reason()? {
            self.conflict = Some(reason.clone());
            self.finish(TranState::Aborted);
            return Ok(Some(reason));
        }
        let db = self.db.clone();
        let result = match db.commit_lock.lock() {
            Ok(_guard) => self.commit_locked(),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(None) => {
                self.finish(TranState::Committed);
                Ok(None)
            }
            Ok(Some(conflict)) => {
                tracing::debug!(tran = self.shared.id, %conflict, "commit refused");
                self.conflict = Some(conflict.clone());
                self.finish(TranState::Aborted);
                Ok(Some(conflict))
            }
            Err(e) => {
                self.finish(TranState::Aborted);
                Err(e)
            }
        }
    }

    /// Like `complete` but a refused commit is an error.
    pub fn ck_complete(&mut self) -> Result<()> {
        match self.complete()? {
            None => Ok(()),
            Some(conflict) => Err(Error::Conflict(conflict)),
        }
    }

    fn touched(&self) -> BTreeSet<u32> {
        self.written
            .iter()
            .chain(&self.altered)
            .chain(&self.created)
            .chain(&self.dropped)
            .copied()
            .collect()
    }

    fn table_name(&self, num: u32) -> String {
        self.state
            .tables
            .get(num)
            .or_else(|| self.base.tables.get(num))
            .map(|t| t.name.clone())
            .unwrap_or_else(|| num.to_string())
    }

    fn find_conflict(&self, cur: &DbState, touched: &BTreeSet<u32>) -> Result<Option<String>> {
        if let Some(exclusive) = self.db.registry.exclusive()? {
            if exclusive != self.shared.id {
                return Ok(Some(format!(
                    "exclusive transaction {} is active",
                    exclusive
                )));
            }
        }
        for &num in touched.iter().filter(|n| !self.created.contains(*n)) {
            match cur.info(num) {
                None => {
                    return Ok(Some(format!(
                        "{} was dropped by another transaction",
                        self.table_name(num)
                    )))
                }
                Some(info) if info.modified > self.base.seq => {
                    return Ok(Some(format!(
                        "{} was modified by another transaction",
                        self.table_name(num)
                    )))
                }
                _ => {}
            }
        }
        for &num in touched.iter().filter(|n| !self.dropped.contains(*n)) {
            if self.created.contains(&num) && cur.tables.get(num).is_some() {
                return Ok(Some(format!("table number {} was taken by another transaction", num)));
            }
            let Some(table) = self.state.tables.get(num) else { continue };
            if let Some(other) = cur.tables.get_by_name(&table.name) {
                if other.num != num && !touched.contains(&other.num) {
                    return Ok(Some(format!(
                        "{} was created by another transaction",
                        table.name
                    )));
                }
            }
        }
        Ok(None)
    }

    fn commit_locked(&mut self) -> Result<Option<String>> {
        let cur = self.db.current()?;
        let touched = self.touched();
        if let Some(conflict) = self.find_conflict(&cur, &touched)? {
            return Ok(Some(conflict));
        }
        if touched.is_empty() {
            return Ok(None);
        }
        let seq = cur.seq + 1;

        for ((tblnum, columns), tree) in self.btrees.iter_mut() {
            if self.dropped.contains(tblnum) || !tree.is_dirty() {
                continue;
            }
            let btree = tree.persist()?;
            if let Some(info) = self.state.infos.get(tblnum) {
                let mut info = info.as_ref().clone();
                info.set_index(columns, btree);
                self.state.with_info(info);
            }
        }

        let mut next = (*cur).clone();
        next.seq = seq;
        next.timestamp = now_millis();
        next.next_tblnum = cur.next_tblnum.max(self.state.next_tblnum);

        let mut catalog = CatalogWriter::open(&self.db.store, &cur)?;
        for &num in &touched {
            if cur.tables.get(num).is_some() {
                catalog.remove_rows(num)?;
            }
        }
        for &num in &touched {
            let (Some(table), Some(info)) = (self.state.tables.get(num), self.state.info(num)) else {
                next.tables = next.tables.without(num);
                next.infos = next.infos.without(&num);
                continue;
            };
            let mut info = info.as_ref().clone();
            info.modified = seq;
            catalog.add_rows(table, &info)?;
            next.tables = next.tables.with(table.as_ref().clone());
            next.with_info(info);
        }
        catalog.finish(&mut next)?;

        let record = CommitRecord {
            seq,
            timestamp: next.timestamp,
            next_tblnum: next.next_tblnum,
            bootstrap: bootstrap::bootstrap_infos(&next)?,
        };
        let log = self.db.store.log();
        let commit = log.commit(&record)?;
        if self.db.config.sync_on_commit {
            log.force()?;
        }
        if !self.created.is_empty() || !self.altered.is_empty() || !self.dropped.is_empty() {
            tracing::info!(
                seq,
                created = self.created.len(),
                altered = self.altered.len(),
                dropped = self.dropped.len(),
                "schema committed"
            );
        }
        tracing::debug!(
            seq,
            tran = self.shared.id,
            tables = touched.len(),
            adr = commit.adr,
            "committed"
        );
        *self.db.state.write()? = Arc::new(next);
        Ok(None)
    }
}

/// Rewrites catalog rows against the latest committed catalog.
struct CatalogWriter {
    store: Arc<NodeStore>,
    by_num: Btree,
    by_name: Btree,
    indexes: Btree,
    tables_info: TableInfo,
    indexes_info: TableInfo,
}

impl CatalogWriter {
    fn open(store: &Arc<NodeStore>, cur: &DbState) -> Result<Self> {
        let info = |num: u32| {
            cur.info(num)
                .map(|i| i.as_ref().clone())
                .ok_or_else(|| Error::Corrupted(format!("missing catalog table {}", num)))
        };
        let tables_info = info(TABLES)?;
        let indexes_info = info(INDEXES)?;
        let tree = |info: &TableInfo, columns: &[u32]| {
            Btree::open(
                store.clone(),
                Mode::Key,
                info.index(columns).map(|i| i.btree).unwrap_or_default(),
            )
        };
        Ok(Self {
            store: store.clone(),
            by_num: tree(&tables_info, &[0]),
            by_name: tree(&tables_info, &[1]),
            indexes: tree(&indexes_info, &[0, 1]),
            tables_info,
            indexes_info,
        })
    }

    fn remove_rows(&mut self, num: u32) -> Result<()> {
        let prefix = Record::from_values([num]);
        let log = self.store.log().clone();

        let mut found = Vec::new();
        let mut iter = self.by_num.prefix(&prefix);
        while let Some(entry) = iter.next()? {
            found.push(entry);
        }
        for (key, adr) in found {
            let (_, rec) = log.read_data(adr)?;
            self.by_num.remove(&key)?;
            self.by_name.remove(&indexed::key(&rec, &[1], adr, Mode::Key))?;
            self.tables_info.nrows = self.tables_info.nrows.saturating_sub(1);
            self.tables_info.totalsize = self.tables_info.totalsize.saturating_sub(rec.pack_size() as u64);
        }

        let mut found = Vec::new();
        let mut iter = self.indexes.prefix(&prefix);
        while let Some(entry) = iter.next()? {
            found.push(entry);
        }
        for (key, adr) in found {
            let (_, rec) = log.read_data(adr)?;
            self.indexes.remove(&key)?;
            self.indexes_info.nrows = self.indexes_info.nrows.saturating_sub(1);
            self.indexes_info.totalsize = self.indexes_info.totalsize.saturating_sub(rec.pack_size() as u64);
        }
        Ok(())
    }

    fn add_rows(&mut self, table: &Table, info: &TableInfo) -> Result<()> {
        let log = self.store.log().clone();
        let row = bootstrap::table_row(table, info);
        let adr = log.append_data(TABLES, &row)?;
        if !self.by_num.insert(indexed::key(&row, &[0], adr, Mode::Key), adr)? {
            return Err(Error::InvalidState(format!("duplicate table number {}", table.num)));
        }
        if !self.by_name.insert(indexed::key(&row, &[1], adr, Mode::Key), adr)? {
            return Err(Error::TableExists(table.name.clone()));
        }
        self.tables_info.nrows += 1;
        self.tables_info.totalsize += row.pack_size() as u64;

        for row in bootstrap::index_rows(table, info) {
            let adr = log.append_data(INDEXES, &row)?;
            if !self.indexes.insert(indexed::key(&row, &[0, 1], adr, Mode::Key), adr)? {
                return Err(Error::Schema(format!("duplicate index in {}", table.name)));
            }
            self.indexes_info.nrows += 1;
            self.indexes_info.totalsize += row.pack_size() as u64;
        }
        Ok(())
    }

    /// Writes the catalog btrees and records their roots in `state`.
    fn finish(mut self, state: &mut DbState) -> Result<()> {
        let by_num = self.by_num.persist()?;
        let by_name = self.by_name.persist()?;
        let indexes = self.indexes.persist()?;
        self.tables_info.set_index(&[0], by_num);
        self.tables_info.set_index(&[1], by_name);
        self.indexes_info.set_index(&[0, 1], indexes);
        state.with_info(self.tables_info);
        state.with_info(self.indexes_info);
        Ok(())
    }
}
