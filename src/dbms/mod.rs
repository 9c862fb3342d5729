//! Whole database operations: dump and load, check, rebuild and compact.
//!
//! A dump is a text header followed by one section per table:
//!
//! ```text
//! Suneido dump\n
//! ====== <name> <schema>\n
//! { i32 LE length, packed record }
//! i32 LE 0
//! ```
//!
//! The schema keeps `-` for dropped fields so a reloaded table numbers its
//! fields the same way and the packed records stay valid.

mod compact;
mod dump;
mod load;
mod rebuild;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub use compact::{compact, compact_with};
pub use dump::{dump_database, dump_database_file, dump_table, dump_table_file};
pub use load::{load_database, load_database_file, load_table, load_table_file};
pub use rebuild::{rebuild, rebuild_with};

use crate::catalog::bootstrap::is_bootstrap;
use crate::check::{check_file, CheckReport};
use crate::config::DbConfig;
use crate::error::Result;
use crate::tran::TranRead;

pub(crate) const DUMP_HEADER: &[u8] = b"Suneido dump\n";
pub(crate) const TABLE_PREFIX: &str = "====== ";

/// Checks the database file at `path` with default settings.
pub fn check(path: impl AsRef<Path>) -> Result<CheckReport> {
    let path = path.as_ref();
    check_file(path, &DbConfig::new(path))
}

/// User table names ordered so that every foreign key target comes before
/// the tables referring to it. Otherwise tables keep their creation order.
pub(crate) fn creation_order<T: TranRead>(tran: &T) -> Result<Vec<String>> {
    let mut pending: Vec<_> = tran
        .state()?
        .tables
        .sorted()
        .into_iter()
        .filter(|t| !is_bootstrap(t.num))
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = Vec::new();
        for table in pending {
            let ready = table
                .indexes
                .iter()
                .filter_map(|i| i.fkey.as_ref())
                .all(|fk| fk.table == table.name || order.contains(&fk.table));
            if ready {
                order.push(table.name.clone());
            } else {
                waiting.push(table);
            }
        }
        if waiting.len() == before {
            // targets that do not exist, or a cycle
            order.extend(waiting.iter().map(|t| t.name.clone()));
            break;
        }
        pending = waiting;
    }
    Ok(order)
}

/// `path` with `suffix` appended to its file name
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::Error;
    use crate::record::{Record, Value};
    use crate::schema::Request;
    use tempfile::tempdir;

    fn table_num(db: &Database, name: &str) -> Result<u32> {
        db.read_transaction()?
            .get_table(name)?
            .map(|t| t.num)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn rows(db: &Database, name: &str) -> Result<Vec<Record>> {
        let tran = db.read_transaction()?;
        let num = table_num(db, name)?;
        tran.iter(num, &[0])?.records()
    }

    /// Two related tables, one with a dropped field
    fn sample(db: &Database) -> Result<()> {
        Request::execute(db, "create cust (id, name, junk) key(id) index(name)")?;
        Request::execute(
            db,
            "create orders (oid, cust, amount) key(oid) index(cust) in cust(id) index(amount, cust)",
        )?;
        // created after orders, but referenced by it once altered
        Request::execute(db, "create region (code) key(code)")?;
        Request::execute(db, "alter cust create (region) index(region)")?;
        Request::execute(db, "alter cust drop (junk)")?;
        Request::execute(db, "alter orders create (region) index(region) in region(code)")?;

        let (cust, orders, region) = (
            table_num(db, "cust")?,
            table_num(db, "orders")?,
            table_num(db, "region")?,
        );
        let mut tran = db.update_transaction()?;
        tran.add_record(region, Record::from_values(["north"]))?;
        for i in 0..40i64 {
            tran.add_record(
                cust,
                Record::from_values([
                    Value::Int(i),
                    Value::from(format!("customer {}", i % 9)),
                    Value::from(""),
                    Value::from("north"),
                ]),
            )?;
        }
        for i in 0..120i64 {
            tran.add_record(
                orders,
                Record::from_values([
                    Value::Int(1000 + i),
                    Value::Int(i % 40),
                    Value::Int((i * 37) % 500),
                    Value::from(if i % 2 == 0 { "north" } else { "" }),
                ]),
            )?;
        }
        tran.ck_complete()
    }

    #[test]
    fn test_dump_and_load_round_trip() -> Result<()> {
        let src = Database::memory(DbConfig::default())?;
        sample(&src)?;
        let mut dump = Vec::new();
        assert_eq!(dump_database(&src, &mut dump)?, 3);
        assert!(dump.starts_with(DUMP_HEADER));

        let dst = Database::memory(DbConfig::default())?;
        assert_eq!(load_database(&dst, dump.as_slice())?, 3);
        for name in ["cust", "orders", "region"] {
            assert_eq!(dst.dump_schema(name)?, src.dump_schema(name)?);
            assert_eq!(rows(&dst, name)?, rows(&src, name)?);
        }
        assert_eq!(dst.dump_schema("cust")?.as_deref(), Some("(id,name,-,region) key(id) index(name) index(region)"));
        assert_eq!(dst.check()?, "");

        let tran = dst.read_transaction()?;
        let orders = table_num(&dst, "orders")?;
        assert_eq!(tran.table_count(orders)?, 120);
        let by_cust = tran
            .iter_range(orders, &[1], Record::from_values([7]), Record::from_values([7]))?
            .records()?;
        assert_eq!(by_cust.len(), 3);
        Ok(())
    }

    #[test]
    fn test_reload_small_table() -> Result<()> {
        let src = Database::memory(DbConfig::default())?;
        Request::execute(&src, "create test (a,b) key(a) index(b)")?;
        let num = table_num(&src, "test")?;
        let mut tran = src.update_transaction()?;
        for (a, b) in [(1, "x"), (2, "y"), (3, "x")] {
            tran.add_record(num, Record::from_values([Value::Int(a), Value::from(b)]))?;
        }
        tran.ck_complete()?;

        let mut dump = Vec::new();
        dump_table(&src, "test", &mut dump)?;
        let dst = Database::memory(DbConfig::default())?;
        assert_eq!(load_table(&dst, dump.as_slice())?, 3);
        assert_eq!(dst.get_schema("test")?, src.get_schema("test")?);
        assert_eq!(rows(&dst, "test")?, rows(&src, "test")?);

        let state = dst.current()?;
        let table = state
            .tables
            .get_by_name("test")
            .cloned()
            .ok_or_else(|| Error::TableNotFound("test".into()))?;
        let checked = crate::check::CheckTable::new(
            dst.store().clone(),
            table.clone(),
            state.info(table.num).cloned(),
        );
        assert_eq!(checked.run(), None);
        Ok(())
    }

    #[test]
    fn test_load_table_replaces_existing() -> Result<()> {
        let src = Database::memory(DbConfig::default())?;
        sample(&src)?;
        let mut dump = Vec::new();
        assert_eq!(dump_table(&src, "region", &mut dump)?, 1);

        let dst = Database::memory(DbConfig::default())?;
        Request::execute(&dst, "create region (other) key(other)")?;
        assert_eq!(load_table(&dst, dump.as_slice())?, 1);
        assert_eq!(dst.get_schema("region")?.as_deref(), Some("(code) key(code)"));
        Ok(())
    }

    #[test]
    fn test_failed_load_drops_table() -> Result<()> {
        let src = Database::memory(DbConfig::default())?;
        sample(&src)?;
        let mut dump = Vec::new();
        dump_table(&src, "cust", &mut dump)?;
        // cut off inside the records
        dump.truncate(dump.len() - 10);

        let dst = Database::memory(DbConfig::default())?;
        assert!(load_table(&dst, dump.as_slice()).is_err());
        assert_eq!(dst.get_schema("cust")?, None);
        assert_eq!(dst.outstanding_transactions(), 0);

        assert!(matches!(
            load_table(&dst, &b"not a dump"[..]),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_indexes_only_its_own_rows() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let other = db.clone();
        let rows = (0..20i64).map(move |i| -> Result<Record> {
            if i == 10 {
                // another writer appends a row for the table mid load
                let num = table_num(&other, "test")?;
                let mut tran = other.update_transaction()?;
                tran.add_record(num, Record::from_values([Value::Int(500), Value::from("z")]))?;
                tran.abort();
            }
            Ok(Record::from_values([Value::Int(i), Value::from("x")]))
        });
        assert_eq!(super::load::load_rows(&db, "test", "(a,b) key(a) index(b)", rows)?, 20);

        let num = table_num(&db, "test")?;
        let tran = db.read_transaction()?;
        assert_eq!(tran.table_count(num)?, 20);
        assert_eq!(tran.iter(num, &[1])?.records()?.len(), 20);
        assert_eq!(db.check()?, "");
        Ok(())
    }

    #[test]
    fn test_dump_files() -> Result<()> {
        let dir = tempdir()?;
        let src = Database::memory(DbConfig::default())?;
        sample(&src)?;
        let path = dir.path().join("db.su");
        dump_database_file(&src, &path)?;
        let dst = Database::memory(DbConfig::default())?;
        assert_eq!(load_database_file(&dst, &path)?, 3);
        let path = dir.path().join("orders.su");
        assert_eq!(dump_table_file(&src, "orders", &path)?, 120);
        assert_eq!(load_table_file(&dst, &path)?, 120);
        assert_eq!(dst.check()?, "");
        Ok(())
    }

    #[test]
    fn test_compact() -> Result<()> {
        let dir = tempdir()?;
        let config = DbConfig::new(dir.path().join("big.db")).chunk_size(1024 * 1024);
        let db = Database::create(config.clone())?;
        sample(&db)?;
        // leave some garbage behind
        let region = table_num(&db, "region")?;
        let scratch: Vec<_> = (0..50)
            .map(|i| Record::from_values([format!("scratch {}", i)]))
            .collect();
        let mut tran = db.update_transaction()?;
        for rec in &scratch {
            tran.add_record(region, rec.clone())?;
        }
        tran.ck_complete()?;
        let mut tran = db.update_transaction()?;
        for rec in &scratch {
            tran.remove_record_by_value(region, rec)?;
        }
        tran.ck_complete()?;
        let expected = rows(&db, "orders")?;
        let size = db.size();
        db.close()?;

        let dst = dir.path().join("small.db");
        assert_eq!(compact_with(&config, &dst)?, 3);
        let compacted = Database::open(config.with_path(&dst))?;
        assert!(compacted.size() < size);
        assert_eq!(rows(&compacted, "orders")?, expected);
        assert_eq!(
            compacted.get_schema("orders")?.as_deref(),
            Some("(oid,cust,amount,region) key(oid) index(cust) in cust(id) index(amount,cust) index(region) in region(code)")
        );
        assert_eq!(compacted.check()?, "");
        compacted.close()?;
        Ok(())
    }

    #[test]
    fn test_rebuild_repairs_index() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("repair.db");
        let config = DbConfig::new(&path).chunk_size(1024 * 1024);
        let db = Database::create(config.clone())?;
        sample(&db)?;
        let cust = table_num(&db, "cust")?;
        {
            // wipe the name index without touching the rows
            let mut tran = db.update_transaction()?;
            tran.reset_index(cust, &[1])?;
            tran.ck_complete()?;
        }
        assert!(db.check()?.starts_with("cust:"));
        let expected = rows(&db, "cust")?;
        db.close()?;

        assert!(!check(&path)?.is_ok());
        let tmp = dir.path().join("repair.tmp");
        let done = rebuild_with(&config, &tmp)?;
        let done = done.ok_or_else(|| Error::InvalidState("nothing rebuilt".into()))?;
        assert!(done.contains("cust: rebuilt 3 indexes from (id) with 40 rows"), "{}", done);
        assert!(with_suffix(&path, ".bak").exists());
        assert!(!tmp.exists());

        let db = Database::open(config.clone())?;
        assert_eq!(db.check()?, "");
        assert_eq!(rows(&db, "cust")?, expected);
        db.close()?;

        // nothing left to do
        assert_eq!(rebuild_with(&config, &tmp)?, None);
        Ok(())
    }

    #[test]
    fn test_rebuild_truncates_damaged_log() -> Result<()> {
        use std::io::Write;

        let dir = tempdir()?;
        let path = dir.path().join("damaged.db");
        let config = DbConfig::new(&path).chunk_size(1024 * 1024);
        let db = Database::create(config.clone())?;
        sample(&db)?;
        db.close()?;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xEE; 64])?;
        drop(file);
        assert!(matches!(Database::open(config.clone()), Err(Error::Corrupted(_))));

        let done = rebuild_with(&config, dir.path().join("damaged.tmp"))?;
        assert!(done.is_some_and(|d| d.starts_with("truncated log")));
        let db = Database::open(config)?;
        assert_eq!(rows(&db, "orders")?.len(), 120);
        assert_eq!(db.check()?, "");
        Ok(())
    }

    #[test]
    fn test_creation_order_puts_targets_first() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        sample(&db)?;
        let tran = db.read_transaction()?;
        assert_eq!(creation_order(&tran)?, vec!["cust", "region", "orders"]);
        Ok(())
    }
}
