//! Schema catalog.
//!
//! A [`Tables`] value is one immutable version of the catalog. Deriving a
//! new version with [`Tables::with`] or [`Tables::without`] shares all the
//! untouched structure with the old one, so every transaction can keep the
//! version it started with for free.

pub mod bootstrap;
pub mod info;
pub mod pmap;

use std::sync::Arc;

use itertools::Itertools as _;

use crate::btree::Mode;
use crate::error::{Error, Result};
use info::TableInfo;
use pmap::PersistentMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Position of this column's value in the table's records
    pub field: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeMode {
    Block,
    CascadeUpdates,
    CascadeDeletes,
    Cascade,
}

impl CascadeMode {
    pub fn code(self) -> i64 {
        match self {
            CascadeMode::Block => 0,
            CascadeMode::CascadeUpdates => 1,
            CascadeMode::CascadeDeletes => 2,
            CascadeMode::Cascade => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(CascadeMode::Block),
            1 => Ok(CascadeMode::CascadeUpdates),
            2 => Ok(CascadeMode::CascadeDeletes),
            3 => Ok(CascadeMode::Cascade),
            other => Err(Error::InvalidData(format!("bad cascade mode {}", other))),
        }
    }

    pub fn cascades_updates(self) -> bool {
        matches!(self, CascadeMode::CascadeUpdates | CascadeMode::Cascade)
    }

    pub fn cascades_deletes(self) -> bool {
        matches!(self, CascadeMode::CascadeDeletes | CascadeMode::Cascade)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Name of the referenced table
    pub table: String,
    /// Referenced column names, same length as the index columns
    pub columns: Vec<String>,
    pub mode: CascadeMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Field numbers, in key order
    pub columns: Vec<u32>,
    pub is_key: bool,
    pub unique: bool,
    pub fkey: Option<ForeignKey>,
}

impl Index {
    pub fn mode(&self) -> Mode {
        if self.is_key {
            Mode::Key
        } else if self.unique {
            Mode::Unique
        } else {
            Mode::Dups
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub num: u32,
    pub name: String,
    /// Live columns ordered by field number
    pub columns: Vec<Column>,
    /// In declaration order; the first one drives full scans
    pub indexes: Vec<Index>,
}

impl Table {
    pub fn new(num: u32, name: impl Into<String>) -> Self {
        Self {
            num,
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn field_of(&self, name: &str) -> Option<u32> {
        self.column(name).map(|c| c.field)
    }

    pub fn column_name(&self, field: u32) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.name.as_str())
    }

    /// Comma separated names for field numbers
    pub fn column_names(&self, fields: &[u32]) -> String {
        fields
            .iter()
            .map(|&f| self.column_name(f).unwrap_or("?"))
            .join(",")
    }

    /// Field numbers for a comma separated column list
    pub fn fields_of(&self, columns: &str) -> Result<Vec<u32>> {
        split_columns(columns)
            .map(|name| {
                self.field_of(name).ok_or_else(|| {
                    Error::Schema(format!("nonexistent column: {} in {}", name, self.name))
                })
            })
            .collect()
    }

    pub fn index(&self, fields: &[u32]) -> Option<&Index> {
        self.indexes.iter().find(|i| i.columns == fields)
    }

    pub fn index_position(&self, fields: &[u32]) -> Option<usize> {
        self.indexes.iter().position(|i| i.columns == fields)
    }

    pub fn first_index(&self) -> Option<&Index> {
        self.indexes.first()
    }

    /// A key whose columns are exactly `fields`
    pub fn key(&self, fields: &[u32]) -> Option<&Index> {
        self.indexes
            .iter()
            .find(|i| i.is_key && i.columns == fields)
    }

    pub fn has_key(&self) -> bool {
        self.indexes.iter().any(|i| i.is_key)
    }

    /// Comma separated column names by field number, `-` for unused fields.
    pub fn columns_with_placeholders(&self, nextfield: u32) -> String {
        (0..nextfield)
            .map(|f| self.column_name(f).unwrap_or("-"))
            .join(",")
    }

    fn render(&self, columns: String) -> String {
        let mut schema = format!("({})", columns);
        for index in &self.indexes {
            schema.push(' ');
            schema.push_str(&self.render_index(index));
        }
        schema
    }

    pub fn render_index(&self, index: &Index) -> String {
        let kind = if index.is_key {
            "key"
        } else if index.unique {
            "index unique"
        } else {
            "index"
        };
        let columns = self.column_names(&index.columns);
        let mut text = format!("{}({})", kind, columns);
        if let Some(fk) = &index.fkey {
            text.push_str(&format!(" in {}", fk.table));
            let target = fk.columns.join(",");
            if target != columns {
                text.push_str(&format!("({})", target));
            }
            match fk.mode {
                CascadeMode::Block => {}
                CascadeMode::CascadeUpdates => text.push_str(" cascade update"),
                CascadeMode::CascadeDeletes => text.push_str(" cascade delete"),
                CascadeMode::Cascade => text.push_str(" cascade"),
            }
        }
        text
    }

    /// `(a,b) key(a) index(b)`
    pub fn schema(&self) -> String {
        self.render(self.columns.iter().map(|c| c.name.as_str()).join(","))
    }

    /// Schema keeping `-` placeholders so reloading preserves field numbers
    pub fn dump_schema(&self, nextfield: u32) -> String {
        self.render(self.columns_with_placeholders(nextfield))
    }
}

pub fn split_columns(columns: &str) -> impl Iterator<Item = &str> {
    columns.split(',').map(str::trim).filter(|c| !c.is_empty())
}

/// One immutable version of the catalog
#[derive(Debug, Clone, Default)]
pub struct Tables {
    by_num: PersistentMap<u32, Arc<Table>>,
    by_name: PersistentMap<String, u32>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// New version in which `table` replaces any table with its number.
    pub fn with(&self, table: Table) -> Tables {
        let mut by_name = self.by_name.clone();
        if let Some(old) = self.by_num.get(&table.num) {
            if old.name != table.name {
                by_name = by_name.without(&old.name);
            }
        }
        by_name = by_name.with(table.name.clone(), table.num);
        Tables {
            by_num: self.by_num.with(table.num, Arc::new(table)),
            by_name,
        }
    }

    pub fn without(&self, num: u32) -> Tables {
        match self.by_num.get(&num) {
            None => self.clone(),
            Some(old) => Tables {
                by_num: self.by_num.without(&num),
                by_name: self.by_name.without(&old.name),
            },
        }
    }

    pub fn get(&self, num: u32) -> Option<&Arc<Table>> {
        self.by_num.get(&num)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<Table>> {
        let num = self.by_name.get(&name.to_string())?;
        self.by_num.get(num)
    }

    pub fn len(&self) -> usize {
        self.by_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_num.is_empty()
    }

    /// All tables ordered by number
    pub fn sorted(&self) -> Vec<Arc<Table>> {
        self.by_num
            .values()
            .cloned()
            .sorted_by_key(|t| t.num)
            .collect_vec()
    }

    /// Indexes in other tables whose foreign key targets `name`:
    /// `(table, index position)`.
    pub fn referencing(&self, name: &str) -> Vec<(Arc<Table>, usize)> {
        let mut found = Vec::new();
        for table in self.by_num.values() {
            for (i, index) in table.indexes.iter().enumerate() {
                if index.fkey.as_ref().is_some_and(|fk| fk.table == name) {
                    found.push((table.clone(), i));
                }
            }
        }
        found.sort_by_key(|(t, i)| (t.num, *i));
        found
    }
}

/// One committed version of the whole database.
#[derive(Debug, Clone)]
pub struct DbState {
    pub seq: u64,
    pub timestamp: u64,
    pub tables: Tables,
    pub infos: PersistentMap<u32, Arc<TableInfo>>,
    pub next_tblnum: u32,
}

impl DbState {
    pub fn info(&self, tblnum: u32) -> Option<&Arc<TableInfo>> {
        self.infos.get(&tblnum)
    }

    pub fn with_info(&mut self, info: TableInfo) {
        self.infos = self.infos.with(info.tblnum, Arc::new(info));
    }
}
