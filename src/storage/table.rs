use crate::core::{DbError, Result, Row};
use std::collections::BTreeMap;

/// One committed version of a row. `row == None` marks a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct RowVersion {
    pub version: u64,
    pub row: Option<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(DbError::ColumnCount {
                table: self.name.clone(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        Ok(())
    }
}

/// Integer-keyed table keeping a version chain per key, oldest first.
#[derive(Debug)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<i64, Vec<RowVersion>>,
    last_modified: u64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            last_modified: 0,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Version of the newest commit that touched any row of this table.
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// Version of the newest commit that touched `key`.
    pub fn latest_version(&self, key: i64) -> Option<u64> {
        self.rows
            .get(&key)
            .and_then(|versions| versions.last())
            .map(|v| v.version)
    }

    /// The row as seen by a snapshot taken at `snapshot`.
    pub fn get(&self, key: i64, snapshot: u64) -> Option<&Row> {
        self.rows
            .get(&key)
            .and_then(|versions| visible(versions, snapshot))
    }

    pub fn scan(&self, snapshot: u64) -> Vec<(i64, Row)> {
        self.rows
            .iter()
            .filter_map(|(key, versions)| visible(versions, snapshot).map(|row| (*key, row.clone())))
            .collect()
    }

    /// Install a committed write at `version`.
    pub fn apply(&mut self, key: i64, row: Option<Row>, version: u64) {
        self.rows
            .entry(key)
            .or_default()
            .push(RowVersion { version, row });
        self.last_modified = self.last_modified.max(version);
    }

    /// Drop versions no snapshot at or after `oldest_snapshot` can observe.
    pub fn vacuum(&mut self, oldest_snapshot: u64) {
        self.rows.retain(|_, versions| {
            let keep_from = versions
                .iter()
                .rposition(|v| v.version <= oldest_snapshot)
                .unwrap_or(0);
            versions.drain(..keep_from);
            // A tombstone nobody can see past is as good as no row at all.
            !(versions.len() == 1
                && versions[0].row.is_none()
                && versions[0].version <= oldest_snapshot)
        });
    }

    pub fn version_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

fn visible(versions: &[RowVersion], snapshot: u64) -> Option<&Row> {
    versions
        .iter()
        .rev()
        .find(|v| v.version <= snapshot)
        .and_then(|v| v.row.as_ref())
}
