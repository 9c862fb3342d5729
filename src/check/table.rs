use std::sync::Arc;

use crate::btree::{Btree, Mode, NodeStore};
use crate::catalog::bootstrap::is_bootstrap;
use crate::catalog::info::TableInfo;
use crate::catalog::{Index, Table};
use crate::error::{Error, Result};
use crate::indexed;
use crate::record::Record;

/// Verifies one table: every index against the data it points at and
/// against the table's statistics.
pub struct CheckTable {
    store: Arc<NodeStore>,
    table: Arc<Table>,
    info: Option<Arc<TableInfo>>,
}

impl CheckTable {
    pub fn new(store: Arc<NodeStore>, table: Arc<Table>, info: Option<Arc<TableInfo>>) -> Self {
        Self { store, table, info }
    }

    pub fn name(&self) -> &str {
        &self.table.name
    }

    /// A description of the first problem found, or None.
    pub fn run(&self) -> Option<String> {
        match self.check() {
            Ok(()) => None,
            Err(Error::Corrupted(msg)) => Some(msg),
            Err(e) => Some(e.to_string()),
        }
    }

    fn check(&self) -> Result<()> {
        let info = self
            .info
            .as_ref()
            .ok_or_else(|| bad("no table info".to_string()))?;
        for (i, index) in self.table.indexes.iter().enumerate() {
            self.check_index(info, index, i == 0)?;
        }
        Ok(())
    }

    fn check_index(&self, info: &TableInfo, index: &Index, first: bool) -> Result<()> {
        let name = format!("({})", self.table.column_names(&index.columns));
        let btree = info.index(&index.columns).map(|i| i.btree).unwrap_or_default();
        let mode = index.mode();
        let tree = Btree::open(self.store.clone(), mode, btree);
        let log = self.store.log();

        let mut iter = tree.iter();
        let mut prev: Option<Record> = None;
        let mut count = 0u64;
        let mut size = 0u64;
        let mut max_fields = 0usize;
        while let Some((key, adr)) = iter.next()? {
            if let Some(prev) = &prev {
                if key <= *prev {
                    return Err(bad(format!("{} keys out of order at {}", name, adr)));
                }
                if mode == Mode::Key && indexed::strip(&key) == indexed::strip(prev) {
                    return Err(bad(format!("{} duplicate key at {}", name, adr)));
                }
                if mode == Mode::Unique && key == *prev {
                    return Err(bad(format!("{} duplicate unique key at {}", name, adr)));
                }
            }
            let (tblnum, rec) = log
                .read_data(adr)
                .map_err(|e| bad(format!("{} bad data address {}: {}", name, adr, e)))?;
            if tblnum != self.table.num {
                return Err(bad(format!(
                    "{} record at {} belongs to table {}",
                    name, adr, tblnum
                )));
            }
            if indexed::key(&rec, &index.columns, adr, mode) != key {
                return Err(bad(format!("{} key mismatch at {}", name, adr)));
            }
            if first {
                rec.values()
                    .map_err(|e| bad(format!("undecodable record at {}: {}", adr, e)))?;
                size += rec.pack_size() as u64;
                max_fields = max_fields.max(rec.size());
            }
            count += 1;
            prev = Some(key);
        }

        if count != info.nrows {
            return Err(bad(format!(
                "{} has {} entries but the table has {} rows",
                name, count, info.nrows
            )));
        }
        if first {
            if size != info.totalsize {
                return Err(bad(format!(
                    "total size is {} but records add up to {}",
                    info.totalsize, size
                )));
            }
            // catalog rows carry one padding field
            let used = if is_bootstrap(self.table.num) {
                max_fields.saturating_sub(1)
            } else {
                max_fields
            };
            if used > info.nextfield as usize {
                return Err(bad(format!(
                    "records use {} fields but nextfield is {}",
                    used, info.nextfield
                )));
            }
        }
        Ok(())
    }
}

fn bad(msg: String) -> Error {
    Error::Corrupted(msg)
}
