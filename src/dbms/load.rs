use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use super::{DUMP_HEADER, TABLE_PREFIX};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::indexed;
use crate::log::BlockKind;
use crate::record::Record;
use crate::schema::Request;
use crate::tran::TranRead;

/// Loads every table in a database dump, returning how many were loaded.
pub fn load_database<R: Read>(db: &Database, reader: R) -> Result<usize> {
    let mut reader = BufReader::new(reader);
    read_header(&mut reader)?;
    let mut tables = 0;
    while let Some((name, schema)) = read_table_line(&mut reader)? {
        load_rows(db, &name, &schema, DumpRecords::new(&mut reader))?;
        tables += 1;
    }
    tracing::info!(tables, "database loaded");
    Ok(tables)
}

/// Loads a single table dump, returning the number of records.
pub fn load_table<R: Read>(db: &Database, reader: R) -> Result<u64> {
    let mut reader = BufReader::new(reader);
    read_header(&mut reader)?;
    let (name, schema) = read_table_line(&mut reader)?
        .ok_or_else(|| Error::InvalidData("dump contains no table".to_string()))?;
    load_rows(db, &name, &schema, DumpRecords::new(&mut reader))
}

pub fn load_database_file(db: &Database, path: impl AsRef<Path>) -> Result<usize> {
    load_database(db, File::open(path)?)
}

pub fn load_table_file(db: &Database, path: impl AsRef<Path>) -> Result<u64> {
    load_table(db, File::open(path)?)
}

fn read_header<R: Read>(reader: &mut R) -> Result<()> {
    let mut header = vec![0u8; DUMP_HEADER.len()];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::InvalidData("not a dump file".to_string()))?;
    if header != DUMP_HEADER {
        return Err(Error::InvalidData("not a dump file".to_string()));
    }
    Ok(())
}

/// `====== <name> <schema>`, or None at the end of the dump
fn read_table_line<R: BufRead>(reader: &mut R) -> Result<Option<(String, String)>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line
        .strip_suffix('\n')
        .and_then(|l| l.strip_prefix(TABLE_PREFIX))
        .ok_or_else(|| Error::InvalidData(format!("bad table header: {:?}", line)))?;
    let (name, schema) = line
        .split_once(' ')
        .ok_or_else(|| Error::InvalidData(format!("table header without schema: {:?}", line)))?;
    Ok(Some((name.to_string(), schema.to_string())))
}

/// The length prefixed records of one table, up to its zero terminator.
struct DumpRecords<'a, R> {
    reader: &'a mut R,
    done: bool,
}

impl<'a, R: Read> DumpRecords<'a, R> {
    fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    fn read(&mut self) -> Result<Option<Record>> {
        let len = self.reader.read_i32::<LittleEndian>()?;
        if len == 0 {
            return Ok(None);
        }
        if len < 0 {
            return Err(Error::InvalidData(format!("bad record length {}", len)));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf)?;
        Record::from_bytes(buf).map(Some)
    }
}

impl<R: Read> Iterator for DumpRecords<'_, R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.read();
        if !matches!(item, Ok(Some(_))) {
            self.done = true;
        }
        item.transpose()
    }
}

/// Recreates `name` with `schema` and bulk loads `rows` into it.
///
/// Any failure drops the table again, so a partial load never stays behind.
pub(crate) fn load_rows<I>(db: &Database, name: &str, schema: &str, rows: I) -> Result<u64>
where
    I: Iterator<Item = Result<Record>>,
{
    if db.get_schema(name)?.is_some() {
        db.drop_table(name)?;
    }
    Request::execute(db, &format!("create {} {}", name, schema))?;
    match bulk_insert(db, name, rows) {
        Ok(n) => {
            tracing::info!(table = name, rows = n, "table loaded");
            Ok(n)
        }
        Err(e) => {
            tracing::warn!(table = name, error = %e, "load failed, dropping table");
            if let Err(drop) = db.drop_table(name) {
                tracing::error!(table = name, error = %drop, "failed to drop partially loaded table");
            }
            Err(e)
        }
    }
}

/// Appends the rows indexed by the first index only, then builds each
/// other index from a pass over the appended address range.
fn bulk_insert<I>(db: &Database, name: &str, rows: I) -> Result<u64>
where
    I: Iterator<Item = Result<Record>>,
{
    let mut tran = db.exclusive_transaction()?;
    let table = tran
        .get_table(name)?
        .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
    let first = table
        .first_index()
        .ok_or_else(|| Error::Schema(format!("{} has no indexes", name)))?;

    let mut range: Option<(u64, u64)> = None;
    let mut n = 0u64;
    for rec in rows {
        let adr = tran.append_row(table.num, &rec?)?;
        range = Some((range.map_or(adr, |(from, _)| from), adr));
        n += 1;
    }
    tran.persist_index(table.num, &first.columns)?;

    if let Some((from, to)) = range {
        let log = tran.log().clone();
        // other writers may append rows for this table inside the range;
        // only rows already in the first index are ours
        let loaded = tran.btree(table.num, &first.columns)?;
        for index in table.indexes.iter().skip(1) {
            for block in log.blocks(from, to) {
                let (adr, kind, payload) = block?;
                if kind != BlockKind::Data
                    || payload.len() < 4
                    || BigEndian::read_u32(&payload[..4]) != table.num
                {
                    continue;
                }
                let rec = Record::from_bytes(payload[4..].to_vec())?;
                let key = indexed::key(&rec, &first.columns, adr, first.mode());
                if loaded.get(&key)? != Some(adr) {
                    continue;
                }
                tran.index_row(&table, index, &rec, adr)?;
            }
            tran.persist_index(table.num, &index.columns)?;
        }
    }
    tran.ck_complete()?;
    Ok(n)
}
