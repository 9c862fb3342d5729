use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{creation_order, DUMP_HEADER, TABLE_PREFIX};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::tran::{ReadTransaction, TranRead};

/// Writes every user table, returning the number of tables written.
pub fn dump_database<W: Write>(db: &Database, writer: W) -> Result<usize> {
    let mut out = BufWriter::new(writer);
    out.write_all(DUMP_HEADER)?;
    let tran = db.read_transaction()?;
    let tables = creation_order(&tran)?;
    let mut rows = 0;
    for name in &tables {
        rows += write_table(&tran, name, &mut out)?;
    }
    out.flush()?;
    tracing::info!(tables = tables.len(), rows, "database dumped");
    Ok(tables.len())
}

/// Writes one table, returning the number of records written.
pub fn dump_table<W: Write>(db: &Database, name: &str, writer: W) -> Result<u64> {
    let mut out = BufWriter::new(writer);
    out.write_all(DUMP_HEADER)?;
    let tran = db.read_transaction()?;
    let rows = write_table(&tran, name, &mut out)?;
    out.flush()?;
    tracing::info!(table = name, rows, "table dumped");
    Ok(rows)
}

pub fn dump_database_file(db: &Database, path: impl AsRef<Path>) -> Result<usize> {
    dump_database(db, File::create(path)?)
}

pub fn dump_table_file(db: &Database, name: &str, path: impl AsRef<Path>) -> Result<u64> {
    dump_table(db, name, File::create(path)?)
}

fn write_table<W: Write>(tran: &ReadTransaction, name: &str, out: &mut W) -> Result<u64> {
    let table = tran
        .get_table(name)?
        .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
    let nextfield = tran
        .state()?
        .info(table.num)
        .map(|info| info.nextfield)
        .unwrap_or(0);
    let schema = table.dump_schema(nextfield);
    writeln!(out, "{}{} {}", TABLE_PREFIX, name, schema)?;

    let first = table
        .first_index()
        .ok_or_else(|| Error::Schema(format!("{} has no indexes", name)))?;
    let mut iter = tran.iter(table.num, &first.columns)?;
    let mut rows = 0;
    while let Some((_, rec)) = iter.next()? {
        let bytes = rec.as_bytes();
        out.write_i32::<LittleEndian>(bytes.len() as i32)?;
        out.write_all(bytes)?;
        rows += 1;
    }
    out.write_i32::<LittleEndian>(0)?;
    Ok(rows)
}
