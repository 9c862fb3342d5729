//! The database handle.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools as _;

use crate::btree::NodeStore;
use crate::catalog::bootstrap::{self, is_bootstrap};
use crate::catalog::DbState;
use crate::check;
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::flock::DbLock;
use crate::log::{commit::now_millis, CommitRecord, Log, Status};
use crate::schema::TableBuilder;
use crate::storage::{MemStorage, MmapStorage, Storage};
use crate::tran::{ReadTransaction, Registry, TranKind, TranRead, UpdateTransaction};

pub(crate) struct DbInner {
    pub(crate) config: DbConfig,
    pub(crate) store: Arc<NodeStore>,
    pub(crate) state: RwLock<Arc<DbState>>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) registry: Registry,
    lock: Mutex<Option<DbLock>>,
    closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn current(&self) -> Result<Arc<DbState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("database is closed".to_string()));
        }
        Ok(self.state.read()?.clone())
    }

    pub(crate) fn log(&self) -> &Arc<Log> {
        self.store.log()
    }
}

/// An open database. Clones share the same underlying file.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.config.path)
            .field("size", &self.size())
            .finish()
    }
}

impl Database {
    /// Creates a new database file at `config.path`.
    pub fn create(config: DbConfig) -> Result<Database> {
        if std::fs::metadata(&config.path).is_ok_and(|m| m.len() > 0) {
            return Err(Error::InvalidOperation(format!(
                "{} already exists",
                config.path.display()
            )));
        }
        let lock = DbLock::acquire(&config.path)?;
        let storage = Arc::new(MmapStorage::open(&config.path, config.chunk_size)?);
        let db = Self::create_in(storage, config)?;
        *db.inner.lock.lock()? = Some(lock);
        tracing::info!(path = %db.inner.config.path.display(), "database created");
        Ok(db)
    }

    /// Opens an existing database file, refusing one that needs repair.
    pub fn open(config: DbConfig) -> Result<Database> {
        let lock = DbLock::acquire(&config.path)?;
        let storage = Arc::new(MmapStorage::open(&config.path, config.chunk_size)?);
        let db = Self::open_in(storage, config)?;
        *db.inner.lock.lock()? = Some(lock);
        Ok(db)
    }

    /// Opens `config.path`, creating it if it is missing or empty.
    pub fn open_or_create(config: DbConfig) -> Result<Database> {
        if std::fs::metadata(&config.path).is_ok_and(|m| m.len() > 0) {
            Self::open(config)
        } else {
            Self::create(config)
        }
    }

    /// A database living entirely in memory.
    pub fn memory(config: DbConfig) -> Result<Database> {
        Self::create_in(Arc::new(MemStorage::new()), config)
    }

    pub(crate) fn create_in(storage: Arc<dyn Storage>, config: DbConfig) -> Result<Database> {
        let log = Arc::new(Log::create(storage)?);
        let mut state = bootstrap::initial_state();
        state.seq = 1;
        state.timestamp = now_millis();
        log.commit(&CommitRecord {
            seq: state.seq,
            timestamp: state.timestamp,
            next_tblnum: state.next_tblnum,
            bootstrap: bootstrap::bootstrap_infos(&state)?,
        })?;
        Ok(Self::with_state(log, state, config))
    }

    pub(crate) fn open_in(storage: Arc<dyn Storage>, config: DbConfig) -> Result<Database> {
        let (log, scan) = Log::open(storage)?;
        let last = match (scan.status, scan.last_good) {
            (Status::Ok, Some(last)) => last,
            (status, _) => {
                return Err(Error::Corrupted(format!(
                    "{} is {}: {} (rebuild it)",
                    config.path.display(),
                    status,
                    scan.detail.unwrap_or_default()
                )))
            }
        };
        if scan.torn > 0 {
            tracing::warn!(bytes = scan.torn, "ignoring interrupted commit at end of log");
        }
        let dropped = log.truncate_to_last_commit()?;
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "truncated uncommitted tail");
        }
        let log = Arc::new(log);
        let commit = log.read_commit(last.adr)?;
        let store = Arc::new(NodeStore::new(
            log.clone(),
            config.node_cache_size,
            config.max_node_size,
        ));
        let state = bootstrap::load_state(&store, &commit)?;
        tracing::info!(
            path = %config.path.display(),
            seq = state.seq,
            tables = state.tables.len().saturating_sub(2),
            size = log.size(),
            "database opened"
        );
        Ok(Self::from_parts(store, state, config))
    }

    fn with_state(log: Arc<Log>, state: DbState, config: DbConfig) -> Database {
        let store = Arc::new(NodeStore::new(log, config.node_cache_size, config.max_node_size));
        Self::from_parts(store, state, config)
    }

    fn from_parts(store: Arc<NodeStore>, state: DbState, config: DbConfig) -> Database {
        Database {
            inner: Arc::new(DbInner {
                config,
                store,
                state: RwLock::new(Arc::new(state)),
                commit_lock: Mutex::new(()),
                registry: Registry::new(),
                lock: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub(crate) fn store(&self) -> &Arc<NodeStore> {
        &self.inner.store
    }

    /// The latest committed state
    pub(crate) fn current(&self) -> Result<Arc<DbState>> {
        self.inner.current()
    }

    pub fn read_transaction(&self) -> Result<ReadTransaction> {
        self.inner.current()?;
        ReadTransaction::new(self.inner.clone())
    }

    pub fn update_transaction(&self) -> Result<UpdateTransaction> {
        self.inner.current()?;
        UpdateTransaction::new(self.inner.clone(), TranKind::Update)
    }

    /// An update transaction that keeps every other update transaction from
    /// committing until it ends. Only one can be open at a time.
    pub fn exclusive_transaction(&self) -> Result<UpdateTransaction> {
        self.inner.current()?;
        UpdateTransaction::new(self.inner.clone(), TranKind::Exclusive)
    }

    pub fn create_table(&self, name: &str) -> Result<TableBuilder> {
        TableBuilder::create(self, name)
    }

    pub fn alter_table(&self, name: &str) -> Result<TableBuilder> {
        TableBuilder::alter(self, name)
    }

    pub fn ensure_table(&self, name: &str) -> Result<TableBuilder> {
        TableBuilder::ensure(self, name)
    }

    /// Drops a table. Fails if another table's foreign key refers to it.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut tran = self.update_transaction()?;
        let table = tran
            .get_table(name)?
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        if is_bootstrap(table.num) {
            return Err(Error::InvalidOperation(format!("cannot drop {}", name)));
        }
        let refs = tran.state()?.tables.referencing(name);
        if let Some((other, _)) = refs.iter().find(|(t, _)| t.num != table.num) {
            return Err(Error::Schema(format!(
                "can't drop {} because {} references it",
                name, other.name
            )));
        }
        tran.remove_table(table.num)?;
        tran.ck_complete()?;
        tracing::info!(table = name, "table dropped");
        Ok(())
    }

    /// Renames a table and the foreign keys that refer to it.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let mut tran = self.update_transaction()?;
        let table = tran
            .get_table(from)?
            .ok_or_else(|| Error::TableNotFound(from.to_string()))?;
        if is_bootstrap(table.num) {
            return Err(Error::InvalidOperation(format!("cannot rename {}", from)));
        }
        if tran.get_table(to)?.is_some() {
            return Err(Error::TableExists(to.to_string()));
        }
        let referencing = tran.state()?.tables.referencing(from);
        for (other, _) in referencing.iter().dedup_by(|a, b| a.0.num == b.0.num) {
            if other.num == table.num {
                continue;
            }
            let mut other = other.as_ref().clone();
            for index in other.indexes.iter_mut() {
                if let Some(fk) = index.fkey.as_mut().filter(|fk| fk.table == from) {
                    fk.table = to.to_string();
                }
            }
            let info = tran.table_info(other.num)?;
            tran.put_table(other, info, false)?;
        }
        let mut renamed = table.as_ref().clone();
        renamed.name = to.to_string();
        for index in renamed.indexes.iter_mut() {
            if let Some(fk) = index.fkey.as_mut().filter(|fk| fk.table == from) {
                fk.table = to.to_string();
            }
        }
        let info = tran.table_info(table.num)?;
        tran.put_table(renamed, info, false)?;
        tran.ck_complete()?;
        tracing::info!(from, to, "table renamed");
        Ok(())
    }

    /// `(a,b) key(a) index(b)` for a table, None if it does not exist.
    pub fn get_schema(&self, name: &str) -> Result<Option<String>> {
        let state = self.current()?;
        Ok(state.tables.get_by_name(name).map(|t| t.schema()))
    }

    /// Schema keeping `-` placeholders for unused fields
    pub fn dump_schema(&self, name: &str) -> Result<Option<String>> {
        let state = self.current()?;
        let Some(table) = state.tables.get_by_name(name) else {
            return Ok(None);
        };
        let nextfield = state.info(table.num).map(|i| i.nextfield).unwrap_or(0);
        Ok(Some(table.dump_schema(nextfield)))
    }

    /// Names of the user tables in creation order
    pub fn table_names(&self) -> Result<Vec<String>> {
        let state = self.current()?;
        Ok(state
            .tables
            .sorted()
            .into_iter()
            .filter(|t| !is_bootstrap(t.num))
            .map(|t| t.name.clone())
            .collect())
    }

    /// Size of the database file in use
    pub fn size(&self) -> u64 {
        self.inner.log().size()
    }

    pub fn force(&self) -> Result<()> {
        self.inner.current()?;
        self.inner.log().force()
    }

    /// Verifies the log and every table, returning the problems found, one
    /// per line. An empty string means the database is consistent.
    pub fn check(&self) -> Result<String> {
        let scan = {
            let _commit = self.inner.commit_lock.lock()?;
            self.inner.log().scan()?
        };
        if scan.status != Status::Ok {
            return Ok(format!(
                "log {}: {}",
                scan.status,
                scan.detail.unwrap_or_default()
            ));
        }
        let state = self.current()?;
        let report = check::check_tables(&self.inner.store, &state, &self.inner.config)?;
        Ok(report
            .details
            .iter()
            .map(|(table, msg)| format!("{}: {}", table, msg))
            .join("\n"))
    }

    /// Aborts transactions beyond the configured count and age limits.
    pub fn limit_outstanding_transactions(&self) -> Result<usize> {
        let aborted = self.inner.registry.limit(
            self.inner.config.max_outstanding_transactions,
            self.inner.config.max_transaction_age,
        )?;
        if aborted > 0 {
            tracing::warn!(aborted, outstanding = self.inner.registry.len(), "transactions aborted");
        }
        Ok(aborted)
    }

    /// Number of open transactions
    pub fn outstanding_transactions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Aborts outstanding transactions, flushes and closes the file. Later
    /// calls on any clone of this handle fail.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _commit = self.inner.commit_lock.lock()?;
        let aborted = self.inner.registry.abort_all("database closed")?;
        let log = self.inner.log();
        log.force()?;
        log.close()?;
        self.inner.lock.lock()?.take();
        tracing::info!(
            path = %self.inner.config.path.display(),
            size = log.size(),
            aborted,
            "database closed"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, Value};
    use tempfile::tempdir;

    fn people(db: &Database) -> Result<u32> {
        db.create_table("people")?
            .add_column("name")?
            .add_column("age")?
            .add_index("name", true, false, None)?
            .finish()?;
        let tran = db.read_transaction()?;
        let table = tran
            .get_table("people")?
            .ok_or_else(|| Error::TableNotFound("people".into()))?;
        Ok(table.num)
    }

    fn person(name: &str, age: i64) -> Record {
        Record::from_values([Value::from(name), Value::Int(age)])
    }

    #[test]
    fn test_create_insert_reopen() -> Result<()> {
        let dir = tempdir()?;
        let config = DbConfig::new(dir.path().join("test.db")).chunk_size(64 * 1024);
        {
            let db = Database::create(config.clone())?;
            let num = people(&db)?;
            let mut tran = db.update_transaction()?;
            tran.add_record(num, person("bob", 30))?;
            tran.add_record(num, person("alice", 25))?;
            assert_eq!(tran.complete()?, None);
            db.close()?;
        }
        let db = Database::open(config)?;
        let tran = db.read_transaction()?;
        let table = tran
            .get_table("people")?
            .ok_or_else(|| Error::TableNotFound("people".into()))?;
        assert_eq!(tran.table_count(table.num)?, 2);
        let rows = tran.iter(table.num, &[0])?.records()?;
        assert_eq!(rows, vec![person("alice", 25), person("bob", 30)]);
        assert_eq!(db.check()?, "");
        Ok(())
    }

    #[test]
    fn test_second_open_is_locked() -> Result<()> {
        let dir = tempdir()?;
        let config = DbConfig::new(dir.path().join("locked.db")).chunk_size(64 * 1024);
        let db = Database::create(config.clone())?;
        assert!(matches!(Database::open(config.clone()), Err(Error::LockError(_))));
        db.close()?;
        let db = Database::open(config)?;
        db.close()?;
        Ok(())
    }

    #[test]
    fn test_snapshot_isolation() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = people(&db)?;

        let before = db.read_transaction()?;
        let mut tran = db.update_transaction()?;
        tran.add_record(num, person("carol", 41))?;
        assert_eq!(tran.table_count(num)?, 1);
        assert_eq!(before.table_count(num)?, 0);
        tran.ck_complete()?;

        assert_eq!(before.table_count(num)?, 0);
        assert!(before.iter(num, &[0])?.records()?.is_empty());
        let after = db.read_transaction()?;
        assert_eq!(after.table_count(num)?, 1);
        assert_eq!(
            after.lookup(num, &[0], &Record::from_values(["carol"]))?,
            Some(person("carol", 41))
        );
        Ok(())
    }

    #[test]
    fn test_optimistic_conflict() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = people(&db)?;

        let mut first = db.update_transaction()?;
        let mut second = db.update_transaction()?;
        first.add_record(num, person("dan", 1))?;
        second.add_record(num, person("erin", 2))?;
        assert_eq!(first.complete()?, None);
        let conflict = second.complete()?;
        assert!(conflict.is_some());
        assert_eq!(second.conflict(), conflict);

        let tran = db.read_transaction()?;
        assert_eq!(tran.table_count(num)?, 1);
        Ok(())
    }

    #[test]
    fn test_different_tables_do_not_conflict() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let people = people(&db)?;
        db.create_table("other")?
            .add_column("x")?
            .add_index("x", true, false, None)?
            .finish()?;
        let other = db
            .read_transaction()?
            .get_table("other")?
            .map(|t| t.num)
            .ok_or_else(|| Error::TableNotFound("other".into()))?;

        let mut a = db.update_transaction()?;
        let mut b = db.update_transaction()?;
        a.add_record(people, person("fay", 3))?;
        b.add_record(other, Record::from_values(["x1"]))?;
        a.ck_complete()?;
        b.ck_complete()?;

        let tran = db.read_transaction()?;
        assert_eq!(tran.table_count(people)?, 1);
        assert_eq!(tran.table_count(other)?, 1);
        Ok(())
    }

    #[test]
    fn test_exclusive_blocks_other_commits() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = people(&db)?;
        let mut exclusive = db.exclusive_transaction()?;
        assert!(matches!(db.exclusive_transaction(), Err(Error::Conflict(_))));
        let mut other = db.update_transaction()?;
        other.add_record(num, person("gus", 4))?;
        assert!(other.complete()?.is_some());

        exclusive.add_record(num, person("hal", 5))?;
        exclusive.ck_complete()?;
        assert!(db.exclusive_transaction().is_ok());
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = people(&db)?;
        let mut tran = db.update_transaction()?;
        tran.add_record(num, person("ida", 1))?;
        assert!(matches!(
            tran.add_record(num, person("ida", 2)),
            Err(Error::DuplicateKey { .. })
        ));
        tran.ck_complete()?;
        assert_eq!(db.read_transaction()?.table_count(num)?, 1);
        Ok(())
    }

    #[test]
    fn test_update_and_remove() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = people(&db)?;
        let mut tran = db.update_transaction()?;
        let adr = tran.add_record(num, person("jo", 1))?;
        tran.add_record(num, person("kim", 2))?;
        let adr = tran.update_record(num, adr, person("jo", 10))?;
        tran.update_record_by_value(num, &person("kim", 2), person("kay", 2))?;
        tran.ck_complete()?;

        let mut tran = db.update_transaction()?;
        assert_eq!(tran.input(adr)?, person("jo", 10));
        assert!(tran.remove_record(num, 1 << 40).is_err());
        tran.remove_record(num, adr)?;
        tran.remove_record_by_value(num, &person("kay", 2))?;
        assert_eq!(tran.table_count(num)?, 0);
        assert_eq!(tran.table_size(num)?, 0);
        tran.ck_complete()?;
        assert_eq!(db.check()?, "");
        Ok(())
    }

    #[test]
    fn test_limit_outstanding_aborts_oldest() -> Result<()> {
        let db = Database::memory(DbConfig::default().max_outstanding_transactions(2))?;
        let num = people(&db)?;
        let mut oldest = db.update_transaction()?;
        let _middle = db.read_transaction()?;
        let _newest = db.read_transaction()?;
        assert_eq!(db.limit_outstanding_transactions()?, 1);
        assert_eq!(db.outstanding_transactions(), 2);
        assert!(matches!(
            oldest.add_record(num, person("lee", 1)),
            Err(Error::TransactionAborted(_))
        ));
        assert!(oldest.complete()?.is_some());
        Ok(())
    }

    #[test]
    fn test_dropped_transaction_aborts() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let num = people(&db)?;
        {
            let mut tran = db.update_transaction()?;
            tran.add_record(num, person("max", 1))?;
        }
        assert_eq!(db.outstanding_transactions(), 0);
        assert_eq!(db.read_transaction()?.table_count(num)?, 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_double_complete_panics() {
        let db = Database::memory(DbConfig::default()).unwrap();
        let mut tran = db.update_transaction().unwrap();
        tran.complete().unwrap();
        let _ = tran.complete();
    }

    #[test]
    fn test_closed_database_refuses_work() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let tran = db.read_transaction()?;
        db.close()?;
        assert!(tran.get_table("tables").is_err());
        assert!(db.update_transaction().is_err());
        db.close()?;
        Ok(())
    }

    #[test]
    fn test_torn_commit_is_ignored() -> Result<()> {
        use crate::storage::Storage;

        let dir = tempdir()?;
        let path = dir.path().join("torn.db");
        let config = DbConfig::new(&path).chunk_size(64 * 1024);
        let good_size = {
            let db = Database::create(config.clone())?;
            people(&db)?;
            let size = db.size();
            db.close()?;
            size
        };
        {
            // a commit cut short by a crash: header written, rest zero
            let storage = MmapStorage::open(&path, 64 * 1024)?;
            let adr = storage.allocate(64)?;
            storage.write(adr, &[0, 0, 0, 64, 3])?;
            storage.close()?;
        }
        let db = Database::open(config)?;
        assert_eq!(db.size(), good_size);
        assert!(db.get_schema("people")?.is_some());
        assert_eq!(db.check()?, "");
        Ok(())
    }
}
