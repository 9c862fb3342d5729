//! Consistency checking.
//!
//! Phase one walks the log and verifies every commit checksum. Phase two
//! loads the catalog of the last good commit and checks each table on a
//! worker pool, stopping early once too many tables are bad.

mod table;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

pub use table::CheckTable;

use crate::btree::NodeStore;
use crate::catalog::bootstrap;
use crate::catalog::DbState;
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::log::{Log, Status};
use crate::storage::MmapStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub status: Status,
    /// Timestamp of the last good commit
    pub last_good: Option<u64>,
    /// Problems by table name; `log` and `catalog` cover the file itself
    pub details: BTreeMap<String, String>,
    /// Tables left unchecked or unreported once `max_bad_tables` was reached
    pub skipped: usize,
}

impl CheckReport {
    fn new(status: Status, last_good: Option<u64>) -> Self {
        Self {
            status,
            last_good,
            details: BTreeMap::new(),
            skipped: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok && self.details.is_empty()
    }

    fn add(&mut self, what: impl Into<String>, problem: impl Into<String>) {
        self.details.insert(what.into(), problem.into());
        if self.status == Status::Ok {
            self.status = Status::Corrupted;
        }
    }

    /// Names of the tables with problems
    pub fn bad_tables(&self) -> Vec<&str> {
        self.details
            .keys()
            .map(String::as_str)
            .filter(|k| *k != "log" && *k != "catalog")
            .collect()
    }
}

impl std::fmt::Display for CheckReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status)?;
        for (what, problem) in &self.details {
            write!(f, "\n{}: {}", what, problem)?;
        }
        Ok(())
    }
}

/// Checks a database file without writing to it.
pub fn check_file(path: impl AsRef<Path>, config: &DbConfig) -> Result<CheckReport> {
    let path = path.as_ref();
    let storage = Arc::new(MmapStorage::open_readonly(path, config.chunk_size)?);
    let (log, scan) = Log::open(storage)?;
    let mut report = CheckReport::new(scan.status, scan.last_good.map(|c| c.timestamp));
    let last = match (scan.status, scan.last_good) {
        (Status::Ok, Some(last)) => last,
        _ => {
            report
                .details
                .insert("log".to_string(), scan.detail.unwrap_or_default());
            tracing::warn!(path = %path.display(), status = %report.status, "log check failed");
            return Ok(report);
        }
    };
    let log = Arc::new(log);
    let store = Arc::new(NodeStore::new(
        log.clone(),
        config.node_cache_size,
        config.max_node_size,
    ));
    let state = log
        .read_commit(last.adr)
        .and_then(|commit| bootstrap::load_state(&store, &commit));
    let state = match state {
        Ok(state) => state,
        Err(e) => {
            report.add("catalog", e.to_string());
            return Ok(report);
        }
    };
    let tables = check_tables(&store, &state, config)?;
    for (table, problem) in tables.details {
        report.add(table, problem);
    }
    report.skipped = tables.skipped;
    tracing::info!(
        path = %path.display(),
        status = %report.status,
        bad = report.details.len(),
        "database checked"
    );
    Ok(report)
}

/// Runs a [`CheckTable`] for every table in `state`.
pub fn check_tables(
    store: &Arc<NodeStore>,
    state: &DbState,
    config: &DbConfig,
) -> Result<CheckReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.check_threads.max(1))
        .thread_name(|i| format!("cinder-check-{}", i))
        .build()
        .map_err(|e| Error::InvalidState(format!("checker pool: {}", e)))?;
    let (tx, rx) = mpsc::channel::<(String, Option<Option<String>>)>();
    let cancel = Arc::new(AtomicBool::new(false));

    let tables = state.tables.sorted();
    for table in tables {
        let task = CheckTable::new(store.clone(), table.clone(), state.info(table.num).cloned());
        let tx = tx.clone();
        let cancel = cancel.clone();
        pool.spawn(move || {
            let outcome = if cancel.load(Ordering::Acquire) {
                None
            } else {
                Some(task.run())
            };
            if tx.send((task.name().to_string(), outcome)).is_err() {
                tracing::debug!(table = task.name(), "checker stopped listening");
            }
        });
    }
    drop(tx);

    let limit = config.max_bad_tables.max(1);
    let mut report = CheckReport::new(Status::Ok, Some(state.timestamp));
    for (name, outcome) in rx {
        match outcome {
            None => report.skipped += 1,
            Some(None) => {}
            // tasks already running when the limit was hit
            Some(Some(_)) if report.details.len() >= limit => report.skipped += 1,
            Some(Some(problem)) => {
                tracing::warn!(table = %name, %problem, "table check failed");
                report.add(name, problem);
                if report.details.len() >= limit {
                    cancel.store(true, Ordering::Release);
                }
            }
        }
    }
    if report.skipped > 0 {
        tracing::warn!(skipped = report.skipped, "table checks cancelled after too many bad tables");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::record::{Record, Value};
    use crate::schema::Request;
    use crate::tran::TranRead;
    use std::io::Write;
    use tempfile::tempdir;

    fn filled(db: &Database) -> Result<u32> {
        Request::execute(db, "create t (a, b) key(a) index(b)")?;
        let num = db
            .read_transaction()?
            .get_table("t")?
            .map(|t| t.num)
            .ok_or_else(|| Error::TableNotFound("t".into()))?;
        let mut tran = db.update_transaction()?;
        for i in 0..50 {
            tran.add_record(num, Record::from_values([Value::Int(i), Value::Int(i % 7)]))?;
        }
        tran.ck_complete()?;
        Ok(num)
    }

    #[test]
    fn test_clean_database_checks_ok() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        filled(&db)?;
        assert_eq!(db.check()?, "");
        Ok(())
    }

    #[test]
    fn test_detects_corrupt_index() -> Result<()> {
        let db = Database::memory(DbConfig::default().check_threads(2))?;
        let num = filled(&db)?;

        let mut tran = db.update_transaction()?;
        let table = tran
            .get_table("t")?
            .ok_or_else(|| Error::TableNotFound("t".into()))?;
        let rows: Vec<(u64, Record)> = {
            let mut iter = tran.iter(num, &[0])?;
            let mut rows = Vec::new();
            while let Some(row) = iter.next()? {
                rows.push(row);
            }
            rows
        };
        tran.reset_index(num, &[1])?;
        let index = table.indexes[1].clone();
        let (adr, _) = &rows[0];
        // a key that does not match the record it points to
        tran.index_row(&table, &index, &Record::from_values([Value::Int(0), Value::Int(99)]), *adr)?;
        for (adr, rec) in &rows[1..] {
            tran.index_row(&table, &index, rec, *adr)?;
        }
        tran.ck_complete()?;

        let problems = db.check()?;
        assert!(problems.starts_with("t: (b) key mismatch"), "{}", problems);

        let state = db.current()?;
        let report = check_tables(db.store(), &state, db.config())?;
        assert_eq!(report.status, Status::Corrupted);
        assert_eq!(report.bad_tables(), vec!["t"]);
        Ok(())
    }

    #[test]
    fn test_detects_count_mismatch() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = filled(&db)?;
        let mut tran = db.update_transaction()?;
        tran.set_counts(num, 49, tran.table_size(num)?)?;
        tran.ck_complete()?;
        let problems = db.check()?;
        assert!(problems.contains("has 50 entries but the table has 49 rows"), "{}", problems);
        Ok(())
    }

    #[test]
    fn test_stops_after_max_bad_tables() -> Result<()> {
        let config = DbConfig::default().check_threads(1).max_bad_tables(1);
        let db = Database::memory(config)?;
        let mut nums = Vec::new();
        for name in ["w", "x", "y", "z"] {
            Request::execute(&db, &format!("create {} (a) key(a)", name))?;
            let num = db
                .read_transaction()?
                .get_table(name)?
                .map(|t| t.num)
                .ok_or_else(|| Error::TableNotFound(name.into()))?;
            nums.push(num);
        }
        let mut tran = db.update_transaction()?;
        for &num in &nums {
            for i in 0..5 {
                tran.add_record(num, Record::from_values([Value::Int(i)]))?;
            }
            // every table now disagrees with its index
            tran.set_counts(num, 1, tran.table_size(num)?)?;
        }
        tran.ck_complete()?;

        let state = db.current()?;
        let report = check_tables(db.store(), &state, db.config())?;
        assert_eq!(report.status, Status::Corrupted);
        assert_eq!(report.details.len(), 1);
        // the other bad tables, plus any clean catalog table not yet run
        assert!((3..=5).contains(&report.skipped), "{}", report.skipped);
        assert_eq!(db.check()?.lines().count(), 1);
        Ok(())
    }

    #[test]
    fn test_check_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("check.db");
        let config = DbConfig::new(&path).chunk_size(64 * 1024);
        let db = Database::create(config.clone())?;
        filled(&db)?;
        db.close()?;

        let report = check_file(&path, &config)?;
        assert!(report.is_ok(), "{}", report);
        assert!(report.last_good.is_some());

        // garbage where the next block should start
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xFF; 32])?;
        drop(file);
        let report = check_file(&path, &config)?;
        assert_eq!(report.status, Status::Corrupted);
        assert!(report.last_good.is_some());
        assert!(report.details.contains_key("log"));
        Ok(())
    }
}
