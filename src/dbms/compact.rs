use std::path::Path;

use super::creation_order;
use super::load::load_rows;
use crate::config::DbConfig;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::tran::TranRead;

/// Copies the live rows of every table in `src` into a new database at
/// `dst`, leaving behind aborted writes and superseded index nodes.
/// Returns the number of tables copied.
pub fn compact(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<usize> {
    compact_with(&DbConfig::new(src.as_ref()), dst)
}

pub fn compact_with(config: &DbConfig, dst: impl AsRef<Path>) -> Result<usize> {
    let from = Database::open(config.clone())?;
    let to = Database::create(config.with_path(dst.as_ref()))?;
    let copied = copy_tables(&from, &to);
    let closed = to.close().and(from.close());
    let copied = copied?;
    closed?;
    tracing::info!(
        src = %config.path.display(),
        dst = %dst.as_ref().display(),
        tables = copied,
        "database compacted"
    );
    Ok(copied)
}

fn copy_tables(from: &Database, to: &Database) -> Result<usize> {
    let tran = from.read_transaction()?;
    let names = creation_order(&tran)?;
    for name in &names {
        let table = tran
            .get_table(name)?
            .ok_or_else(|| Error::TableNotFound(name.clone()))?;
        let nextfield = tran
            .state()?
            .info(table.num)
            .map(|info| info.nextfield)
            .unwrap_or(0);
        let first = table
            .first_index()
            .ok_or_else(|| Error::Schema(format!("{} has no indexes", name)))?;
        let mut iter = tran.iter(table.num, &first.columns)?;
        let rows = std::iter::from_fn(move || iter.next().transpose())
            .map(|row| row.map(|(_, rec)| rec));
        load_rows(to, name, &table.dump_schema(nextfield), rows)?;
    }
    Ok(names.len())
}
