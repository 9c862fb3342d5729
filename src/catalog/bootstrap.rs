//! The two catalog tables that describe every other table.
//!
//! `tables` holds one row per user table and `indexes` one row per user
//! index. Their own schema is fixed here and their own statistics travel in
//! each commit record. Both kinds of row end with an empty padding field.

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools as _;

use super::info::{IndexInfo, TableInfo};
use super::{split_columns, CascadeMode, Column, DbState, ForeignKey, Index, Table, Tables};
use crate::btree::{Btree, BtreeInfo, Mode, NodeStore};
use crate::error::{Error, Result};
use crate::log::CommitRecord;
use crate::record::{Record, RecordBuilder};

pub const TABLES: u32 = 1;
pub const INDEXES: u32 = 2;
pub const FIRST_USER_TABLE: u32 = 3;

pub const TABLES_NAME: &str = "tables";
pub const INDEXES_NAME: &str = "indexes";

const TABLES_COLUMNS: [&str; 6] = ["table", "tablename", "columns", "nextfield", "nrows", "totalsize"];
const INDEXES_COLUMNS: [&str; 10] = [
    "table", "columns", "key", "unique", "fktable", "fkcolumns", "fkmode", "root", "treelevels",
    "nnodes",
];

pub fn is_bootstrap(tblnum: u32) -> bool {
    tblnum < FIRST_USER_TABLE
}

fn fixed_table(num: u32, name: &str, columns: &[&str], keys: &[&[u32]]) -> Table {
    let mut table = Table::new(num, name);
    table.columns = columns
        .iter()
        .enumerate()
        .map(|(i, c)| Column {
            name: c.to_string(),
            field: i as u32,
        })
        .collect();
    table.indexes = keys
        .iter()
        .map(|cols| Index {
            columns: cols.to_vec(),
            is_key: true,
            unique: false,
            fkey: None,
        })
        .collect();
    table
}

pub fn tables_table() -> Table {
    fixed_table(TABLES, TABLES_NAME, &TABLES_COLUMNS, &[&[0], &[1]])
}

pub fn indexes_table() -> Table {
    fixed_table(INDEXES, INDEXES_NAME, &INDEXES_COLUMNS, &[&[0, 1]])
}

fn fixed_info(table: &Table) -> TableInfo {
    let mut info = TableInfo::new(table.num);
    info.nextfield = table.columns.len() as u32;
    for index in &table.indexes {
        info.set_index(&index.columns, BtreeInfo::default());
    }
    info
}

/// The state of a freshly created database.
pub fn initial_state() -> DbState {
    let tables = tables_table();
    let indexes = indexes_table();
    let mut state = DbState {
        seq: 0,
        timestamp: 0,
        tables: Tables::new(),
        infos: Default::default(),
        next_tblnum: FIRST_USER_TABLE,
    };
    state.with_info(fixed_info(&tables));
    state.with_info(fixed_info(&indexes));
    state.tables = state.tables.with(tables).with(indexes);
    state
}

/// The bootstrap statistics a commit record carries.
pub fn bootstrap_infos(state: &DbState) -> Result<Vec<TableInfo>> {
    [TABLES, INDEXES]
        .into_iter()
        .map(|num| {
            state
                .info(num)
                .map(|info| info.as_ref().clone())
                .ok_or_else(|| Error::InvalidState(format!("missing catalog table {}", num)))
        })
        .collect()
}

pub fn table_row(table: &Table, info: &TableInfo) -> Record {
    RecordBuilder::new()
        .add(table.num)
        .add(table.name.as_str())
        .add(table.columns_with_placeholders(info.nextfield))
        .add(info.nextfield)
        .add(info.nrows as i64)
        .add(info.totalsize as i64)
        .add_min()
        .build()
}

pub fn index_rows(table: &Table, info: &TableInfo) -> Vec<Record> {
    table
        .indexes
        .iter()
        .map(|index| {
            let btree = info
                .index(&index.columns)
                .map(|i| i.btree)
                .unwrap_or_default();
            let (fktable, fkcolumns, fkmode) = match &index.fkey {
                Some(fk) => (fk.table.clone(), fk.columns.join(","), fk.mode.code()),
                None => (String::new(), String::new(), CascadeMode::Block.code()),
            };
            RecordBuilder::new()
                .add(table.num)
                .add(index.columns.iter().join(","))
                .add(index.is_key)
                .add(index.unique)
                .add(fktable)
                .add(fkcolumns)
                .add(fkmode)
                .add(btree.root as i64)
                .add(btree.treelevels)
                .add(btree.nnodes)
                .add_min()
                .build()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub num: u32,
    pub name: String,
    pub columns: Vec<Column>,
    pub nextfield: u32,
    pub nrows: u64,
    pub totalsize: u64,
}

fn int_field<T: TryFrom<i64>>(rec: &Record, i: usize, what: &str) -> Result<T> {
    let n = rec.get_int(i)?;
    T::try_from(n).map_err(|_| Error::InvalidData(format!("{} out of range: {}", what, n)))
}

/// Columns of a `a,-,c` list; `-` marks an unused field number.
pub fn columns_from_list(list: &str) -> Vec<Column> {
    split_columns(list)
        .enumerate()
        .filter(|(_, name)| *name != "-")
        .map(|(i, name)| Column {
            name: name.to_string(),
            field: i as u32,
        })
        .collect()
}

pub fn parse_table_row(rec: &Record) -> Result<TableRow> {
    Ok(TableRow {
        num: int_field(rec, 0, "table number")?,
        name: rec.get_string(1)?,
        columns: columns_from_list(&rec.get_string(2)?),
        nextfield: int_field(rec, 3, "nextfield")?,
        nrows: int_field(rec, 4, "nrows")?,
        totalsize: int_field(rec, 5, "totalsize")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub table: u32,
    pub index: Index,
    pub btree: BtreeInfo,
}

fn parse_fields(list: &str) -> Result<Vec<u32>> {
    split_columns(list)
        .map(|f| {
            f.parse::<u32>()
                .map_err(|_| Error::InvalidData(format!("bad field number in index: {}", f)))
        })
        .collect()
}

pub fn parse_index_row(rec: &Record) -> Result<IndexRow> {
    let fktable = rec.get_string(4)?;
    let fkey = if fktable.is_empty() {
        None
    } else {
        Some(ForeignKey {
            table: fktable,
            columns: split_columns(&rec.get_string(5)?).map(String::from).collect(),
            mode: CascadeMode::from_code(rec.get_int(6)?)?,
        })
    };
    Ok(IndexRow {
        table: int_field(rec, 0, "table number")?,
        index: Index {
            columns: parse_fields(&rec.get_string(1)?)?,
            is_key: rec.get_bool(2)?,
            unique: rec.get_bool(3)?,
            fkey,
        },
        btree: BtreeInfo {
            root: int_field(rec, 7, "root")?,
            treelevels: int_field(rec, 8, "treelevels")?,
            nnodes: int_field(rec, 9, "nnodes")?,
        },
    })
}

/// Every row of a catalog table in key order, with its address.
pub fn rows(store: &Arc<NodeStore>, info: &TableInfo) -> Result<Vec<(u64, Record)>> {
    let root = info
        .indexes
        .first()
        .map(|i| i.btree)
        .ok_or_else(|| Error::Corrupted(format!("catalog table {} has no index", info.tblnum)))?;
    let mut iter = Btree::open(store.clone(), Mode::Key, root).iter();
    let mut rows = Vec::new();
    while let Some((_, adr)) = iter.next()? {
        let (tblnum, rec) = store.log().read_data(adr)?;
        if tblnum != info.tblnum {
            return Err(Error::Corrupted(format!(
                "catalog row at {} belongs to table {}",
                adr, tblnum
            )));
        }
        rows.push((adr, rec));
    }
    Ok(rows)
}

/// Rebuilds the catalog as of `commit`.
pub fn load_state(store: &Arc<NodeStore>, commit: &CommitRecord) -> Result<DbState> {
    let mut state = initial_state();
    for info in &commit.bootstrap {
        if !is_bootstrap(info.tblnum) {
            return Err(Error::Corrupted(format!(
                "commit record carries table {}",
                info.tblnum
            )));
        }
        state.with_info(info.clone());
    }
    state.seq = commit.seq;
    state.timestamp = commit.timestamp;
    state.next_tblnum = commit.next_tblnum.max(FIRST_USER_TABLE);

    let tables_info = catalog_info(&state, TABLES)?;
    let indexes_info = catalog_info(&state, INDEXES)?;

    // rows of one table are written in declaration order
    let mut indexes: BTreeMap<u32, Vec<IndexRow>> = BTreeMap::new();
    for (_, rec) in rows(store, &indexes_info)?
        .into_iter()
        .sorted_by_key(|(adr, _)| *adr)
    {
        let row = parse_index_row(&rec)?;
        indexes.entry(row.table).or_default().push(row);
    }

    for (_, rec) in rows(store, &tables_info)? {
        let row = parse_table_row(&rec)?;
        let index_rows = indexes.remove(&row.num).unwrap_or_default();
        let mut table = Table::new(row.num, row.name);
        table.columns = row.columns;
        let mut info = TableInfo::new(row.num);
        info.nextfield = row.nextfield;
        info.nrows = row.nrows;
        info.totalsize = row.totalsize;
        for ir in index_rows {
            info.indexes.push(IndexInfo {
                columns: ir.index.columns.clone(),
                btree: ir.btree,
            });
            table.indexes.push(ir.index);
        }
        state.tables = state.tables.with(table);
        state.with_info(info);
    }
    if let Some(orphan) = indexes.keys().next() {
        return Err(Error::Corrupted(format!(
            "index rows for missing table {}",
            orphan
        )));
    }
    Ok(state)
}

fn catalog_info(state: &DbState, num: u32) -> Result<TableInfo> {
    state
        .info(num)
        .map(|i| i.as_ref().clone())
        .ok_or_else(|| Error::Corrupted(format!("missing catalog table {}", num)))
}
