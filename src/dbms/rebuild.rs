use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use super::with_suffix;
use crate::btree::Mode;
use crate::catalog::bootstrap::is_bootstrap;
use crate::catalog::{Index, Table};
use crate::check;
use crate::config::DbConfig;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::flock::DbLock;
use crate::indexed;
use crate::log::{Log, Status};
use crate::record::Record;
use crate::storage::MmapStorage;
use crate::tran::{TranRead, UpdateTransaction};

/// Repairs the database at `path` using `tmp` as scratch space.
pub fn rebuild(path: impl AsRef<Path>, tmp: impl AsRef<Path>) -> Result<Option<String>> {
    rebuild_with(&DbConfig::new(path.as_ref()), tmp)
}

/// Repairs `config.path`: drops everything after the last good commit and
/// rebuilds the indexes of bad tables.
///
/// Returns what was done, or None when nothing needed repair, in which case
/// the file is left untouched. Otherwise the original is kept as
/// `<path>.bak`.
pub fn rebuild_with(config: &DbConfig, tmp: impl AsRef<Path>) -> Result<Option<String>> {
    let path = config.path.clone();
    let tmp = tmp.as_ref().to_path_buf();
    let lock = DbLock::acquire(&path)?;

    let scan = {
        let storage = Arc::new(MmapStorage::open_readonly(&path, config.chunk_size)?);
        Log::open(storage)?.1
    };
    let last = match (scan.status, scan.last_good) {
        (Status::Unrecoverable, _) | (_, None) => {
            return Err(Error::Corrupted(format!(
                "{} cannot be rebuilt: {}",
                path.display(),
                scan.detail.unwrap_or_default()
            )))
        }
        (_, Some(last)) => last,
    };

    let mut fixes = Vec::new();
    if scan.status == Status::Corrupted {
        fixes.push(format!(
            "truncated log after commit {}: {}",
            last.seq,
            scan.detail.unwrap_or_default()
        ));
    }
    copy_prefix(&path, &tmp, last.end)?;

    let result = repair(config, &tmp, &mut fixes);
    let _ = fs::remove_file(DbLock::lock_path(&tmp));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if fixes.is_empty() {
        fs::remove_file(&tmp)?;
        tracing::info!(path = %path.display(), "nothing to rebuild");
        return Ok(None);
    }

    let bak = with_suffix(&path, ".bak");
    fs::rename(&path, &bak)?;
    fs::rename(&tmp, &path)?;
    drop(lock);
    let description = fixes.join("\n");
    tracing::info!(path = %path.display(), backup = %bak.display(), fixes = fixes.len(), "database rebuilt");
    Ok(Some(description))
}

fn copy_prefix(from: &Path, to: &Path, len: u64) -> Result<()> {
    let mut src = File::open(from)?.take(len);
    let mut dst = File::create(to)?;
    let copied = io::copy(&mut src, &mut dst)?;
    if copied != len {
        return Err(Error::Corrupted(format!(
            "expected {} bytes, copied {}",
            len, copied
        )));
    }
    dst.sync_all()?;
    Ok(())
}

fn repair(config: &DbConfig, tmp: &Path, fixes: &mut Vec<String>) -> Result<()> {
    let db = Database::open(config.with_path(tmp))?;
    let result = repair_tables(&db, fixes);
    let closed = db.close();
    result.and(closed)
}

fn repair_tables(db: &Database, fixes: &mut Vec<String>) -> Result<()> {
    let state = db.current()?;
    let report = check::check_tables(db.store(), &state, db.config())?;
    if report.details.is_empty() {
        return Ok(());
    }
    let mut tran = db.exclusive_transaction()?;
    for (name, problem) in &report.details {
        let table = tran
            .get_table(name)?
            .ok_or_else(|| Error::TableNotFound(name.clone()))?;
        if is_bootstrap(table.num) {
            return Err(Error::Corrupted(format!(
                "catalog table {} is damaged: {}",
                name, problem
            )));
        }
        let fix = rebuild_table(&mut tran, &table)?;
        tracing::warn!(table = %name, %problem, %fix, "table rebuilt");
        fixes.push(format!("{}: {} ({})", name, fix, problem));
    }
    tran.ck_complete()
}

fn rebuild_table(tran: &mut UpdateTransaction, table: &Table) -> Result<String> {
    let source = table
        .indexes
        .iter()
        .find_map(|index| readable_rows(tran, table, index).map(|rows| (index, rows)));
    let Some((source, mut rows)) = source else {
        for index in &table.indexes {
            tran.reset_index(table.num, &index.columns)?;
        }
        tran.set_counts(table.num, 0, 0)?;
        return Ok("no readable index, emptied".to_string());
    };
    rows.sort_by_key(|(adr, _)| *adr);
    rows.dedup_by_key(|(adr, _)| *adr);

    let before = rows.len();
    for index in table.indexes.iter().filter(|i| i.mode() != Mode::Dups) {
        let mut seen = HashSet::new();
        rows.retain(|(adr, rec)| {
            let key = indexed::key(rec, &index.columns, *adr, index.mode());
            match index.mode() {
                Mode::Key => seen.insert(indexed::strip(&key)),
                _ => seen.insert(key),
            }
        });
    }

    for index in &table.indexes {
        tran.reset_index(table.num, &index.columns)?;
        for (adr, rec) in &rows {
            tran.index_row(table, index, rec, *adr)?;
        }
    }
    let size = rows.iter().map(|(_, rec)| rec.pack_size() as u64).sum();
    let fields = rows.iter().map(|(_, rec)| rec.size()).max().unwrap_or(0);
    tran.set_counts(table.num, rows.len() as u64, size)?;
    tran.reserve_fields(table.num, fields as u32)?;

    let mut fix = format!(
        "rebuilt {} indexes from ({}) with {} rows",
        table.indexes.len(),
        table.column_names(&source.columns),
        rows.len()
    );
    if rows.len() < before {
        fix.push_str(&format!(", dropped {} duplicates", before - rows.len()));
    }
    Ok(fix)
}

/// The rows of an index whose every entry reads back as a record of the
/// table, or None.
fn readable_rows(tran: &UpdateTransaction, table: &Table, index: &Index) -> Option<Vec<(u64, Record)>> {
    let mut iter = tran.btree(table.num, &index.columns).ok()?.iter();
    let log = tran.log();
    let mut rows = Vec::new();
    loop {
        match iter.next() {
            Ok(Some((_, adr))) => match log.read_data(adr) {
                Ok((num, rec)) if num == table.num => rows.push((adr, rec)),
                _ => return None,
            },
            Ok(None) => return Some(rows),
            Err(_) => return None,
        }
    }
}
