use crate::catalog::bootstrap::is_bootstrap;
use crate::catalog::info::TableInfo;
use crate::catalog::{Column, ForeignKey, Index, Table};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::tran::{TranRead, UpdateTransaction};

/// Stages a schema change inside one update transaction.
///
/// Nothing is visible to other transactions until [`TableBuilder::finish`]
/// commits. A builder dropped before that, including one dropped because a
/// step returned an error, aborts and leaves the catalog as it was.
pub struct TableBuilder {
    tran: Option<UpdateTransaction>,
    table: Table,
    info: TableInfo,
    created: bool,
    /// Skip columns and indexes that already exist
    ensure: bool,
    changed: bool,
    /// Indexes added to an existing table, built at finish
    new_indexes: Vec<Vec<u32>>,
    /// Column renames, applied to referencing foreign keys at finish
    renamed: Vec<(String, String)>,
}

impl TableBuilder {
    pub(crate) fn create(db: &Database, name: &str) -> Result<TableBuilder> {
        let tran = db.update_transaction()?;
        if tran.get_table(name)?.is_some() {
            return Err(Error::TableExists(name.to_string()));
        }
        Self::new_table(tran, name, false)
    }

    pub(crate) fn alter(db: &Database, name: &str) -> Result<TableBuilder> {
        let tran = db.update_transaction()?;
        let table = tran
            .get_table(name)?
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        Self::existing(tran, table.as_ref().clone(), false)
    }

    pub(crate) fn ensure(db: &Database, name: &str) -> Result<TableBuilder> {
        let tran = db.update_transaction()?;
        match tran.get_table(name)? {
            Some(table) => Self::existing(tran, table.as_ref().clone(), true),
            None => Self::new_table(tran, name, true),
        }
    }

    fn new_table(mut tran: UpdateTransaction, name: &str, ensure: bool) -> Result<TableBuilder> {
        if name.is_empty() {
            return Err(Error::Schema("table name is empty".to_string()));
        }
        let num = tran.allocate_tblnum();
        Ok(TableBuilder {
            tran: Some(tran),
            table: Table::new(num, name),
            info: TableInfo::new(num),
            created: true,
            ensure,
            changed: true,
            new_indexes: Vec::new(),
            renamed: Vec::new(),
        })
    }

    fn existing(tran: UpdateTransaction, table: Table, ensure: bool) -> Result<TableBuilder> {
        if is_bootstrap(table.num) {
            return Err(Error::InvalidOperation(format!("cannot alter {}", table.name)));
        }
        let info = tran.table_info(table.num)?;
        Ok(TableBuilder {
            tran: Some(tran),
            table,
            info,
            created: false,
            ensure,
            changed: false,
            new_indexes: Vec::new(),
            renamed: Vec::new(),
        })
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    fn tran(&self) -> Result<&UpdateTransaction> {
        self.tran
            .as_ref()
            .ok_or_else(|| Error::InvalidState("table builder already finished".to_string()))
    }

    /// Adds a column. `-` reserves a field number without a column, which is
    /// how dumps preserve the numbering of dropped fields.
    pub fn add_column(mut self, name: &str) -> Result<Self> {
        if name == "-" {
            self.info.nextfield += 1;
            self.changed = true;
            return Ok(self);
        }
        if name.is_empty() {
            return Err(Error::Schema("column name is empty".to_string()));
        }
        if self.table.column(name).is_some() {
            if self.ensure {
                return Ok(self);
            }
            return Err(Error::Schema(format!(
                "existing column: {} in {}",
                name, self.table.name
            )));
        }
        self.table.columns.push(Column {
            name: name.to_string(),
            field: self.info.nextfield,
        });
        self.info.nextfield += 1;
        self.changed = true;
        Ok(self)
    }

    pub fn drop_column(mut self, name: &str) -> Result<Self> {
        let field = self.table.field_of(name).ok_or_else(|| {
            Error::Schema(format!("nonexistent column: {} in {}", name, self.table.name))
        })?;
        if let Some(index) = self.table.indexes.iter().find(|i| i.columns.contains(&field)) {
            return Err(Error::Schema(format!(
                "can't drop column {} used by {}",
                name,
                self.table.render_index(index)
            )));
        }
        self.table.columns.retain(|c| c.field != field);
        self.changed = true;
        Ok(self)
    }

    pub fn rename_column(mut self, from: &str, to: &str) -> Result<Self> {
        if self.table.column(to).is_some() {
            return Err(Error::Schema(format!(
                "existing column: {} in {}",
                to, self.table.name
            )));
        }
        let name = self.table.name.clone();
        let column = self
            .table
            .columns
            .iter_mut()
            .find(|c| c.name == from)
            .ok_or_else(|| Error::Schema(format!("nonexistent column: {} in {}", from, name)))?;
        column.name = to.to_string();
        for index in self.table.indexes.iter_mut() {
            if let Some(fk) = index.fkey.as_mut().filter(|fk| fk.table == name) {
                rename_in(&mut fk.columns, from, to);
            }
        }
        self.renamed.push((from.to_string(), to.to_string()));
        self.changed = true;
        Ok(self)
    }

    /// Declares an index on the comma separated `columns`. A foreign key
    /// with no columns refers to the same names in its target table.
    pub fn add_index(
        mut self,
        columns: &str,
        is_key: bool,
        unique: bool,
        fkey: Option<ForeignKey>,
    ) -> Result<Self> {
        let fields = self.table.fields_of(columns)?;
        if self.table.index(&fields).is_some() {
            if self.ensure {
                return Ok(self);
            }
            return Err(Error::Schema(format!(
                "existing index: ({}) in {}",
                columns, self.table.name
            )));
        }
        let fkey = match fkey {
            Some(fk) => Some(self.check_foreign_key(fk, &fields)?),
            None => None,
        };
        self.table.indexes.push(Index {
            columns: fields.clone(),
            is_key,
            unique: unique && !is_key,
            fkey,
        });
        if !self.created {
            self.new_indexes.push(fields);
        }
        self.changed = true;
        Ok(self)
    }

    fn check_foreign_key(&self, mut fk: ForeignKey, fields: &[u32]) -> Result<ForeignKey> {
        if fk.columns.is_empty() {
            fk.columns = fields
                .iter()
                .filter_map(|&f| self.table.column_name(f))
                .map(str::to_string)
                .collect();
        }
        if fk.columns.len() != fields.len() {
            return Err(Error::Schema(format!(
                "foreign key columns ({}) do not match the index in {}",
                fk.columns.join(","),
                self.table.name
            )));
        }
        let target = if fk.table == self.table.name {
            self.table.clone()
        } else {
            self.tran()?
                .get_table(&fk.table)?
                .ok_or_else(|| {
                    Error::Schema(format!("foreign key to nonexistent table: {}", fk.table))
                })?
                .as_ref()
                .clone()
        };
        let target_fields = target.fields_of(&fk.columns.join(","))?;
        if target.key(&target_fields).is_none() {
            return Err(Error::Schema(format!(
                "foreign key must reference a key: {}({})",
                fk.table,
                fk.columns.join(",")
            )));
        }
        Ok(fk)
    }

    pub fn drop_index(mut self, columns: &str) -> Result<Self> {
        let fields = self.table.fields_of(columns)?;
        let pos = self.table.index_position(&fields).ok_or_else(|| {
            Error::Schema(format!(
                "nonexistent index: ({}) in {}",
                columns, self.table.name
            ))
        })?;
        let names = split_names(columns);
        let referenced = self
            .tran()?
            .state()?
            .tables
            .referencing(&self.table.name)
            .into_iter()
            .any(|(other, i)| {
                other.num != self.table.num
                    && other.indexes[i]
                        .fkey
                        .as_ref()
                        .is_some_and(|fk| fk.columns == names)
            });
        if referenced {
            return Err(Error::Schema(format!(
                "can't drop index ({}) in {} used by a foreign key",
                columns, self.table.name
            )));
        }
        self.table.indexes.remove(pos);
        self.info.indexes.retain(|i| i.columns != fields);
        self.new_indexes.retain(|cols| *cols != fields);
        self.changed = true;
        Ok(self)
    }

    /// Validates the staged definition and commits it.
    pub fn finish(mut self) -> Result<()> {
        let mut tran = self
            .tran
            .take()
            .ok_or_else(|| Error::InvalidState("table builder already finished".to_string()))?;
        if !self.changed {
            tran.abort();
            return Ok(());
        }
        if !self.table.has_key() {
            return Err(Error::Schema(format!("key required in {}", self.table.name)));
        }
        let num = self.table.num;
        for columns in &self.new_indexes {
            if let Some(index) = self.table.index(columns) {
                tran.build_index(num, index)?;
            }
        }
        self.rename_foreign_keys(&mut tran)?;
        tran.put_table(self.table.clone(), self.info.clone(), self.created)?;
        tran.ck_complete()?;
        tracing::info!(
            table = %self.table.name,
            created = self.created,
            columns = self.table.columns.len(),
            indexes = self.table.indexes.len(),
            "schema updated"
        );
        Ok(())
    }

    fn rename_foreign_keys(&self, tran: &mut UpdateTransaction) -> Result<()> {
        if self.renamed.is_empty() {
            return Ok(());
        }
        let mut seen = Vec::new();
        for (other, _) in tran.state()?.tables.referencing(&self.table.name) {
            if other.num == self.table.num || seen.contains(&other.num) {
                continue;
            }
            seen.push(other.num);
            let mut other = other.as_ref().clone();
            for index in other.indexes.iter_mut() {
                if let Some(fk) = index.fkey.as_mut().filter(|fk| fk.table == self.table.name) {
                    for (from, to) in &self.renamed {
                        rename_in(&mut fk.columns, from, to);
                    }
                }
            }
            let info = tran.table_info(other.num)?;
            tran.put_table(other, info, false)?;
        }
        Ok(())
    }

    /// Aborts unless `finish` already ran.
    pub fn abort_unfinished(&mut self) {
        if let Some(mut tran) = self.tran.take() {
            tracing::debug!(table = %self.table.name, "schema change abandoned");
            tran.abort();
        }
    }
}

impl Drop for TableBuilder {
    fn drop(&mut self) {
        self.abort_unfinished();
    }
}

fn rename_in(columns: &mut [String], from: &str, to: &str) {
    for c in columns.iter_mut().filter(|c| c.as_str() == from) {
        *c = to.to_string();
    }
}

fn split_names(columns: &str) -> Vec<String> {
    crate::catalog::split_columns(columns)
        .map(str::to_string)
        .collect()
}
