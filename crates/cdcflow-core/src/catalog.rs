// crates/cdcflow-core/src/catalog.rs

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use polars::prelude::{DataFrame, PolarsError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid table name '{0}'")]
    InvalidName(String),
    #[error("table {0} does not exist")]
    TableNotFound(TableName),
    #[error("table {table} cannot be read as a stream: version {version} is not an append")]
    NonAppendSource { table: TableName, version: u64 },
    #[error("append to {table} does not match its schema: {detail}")]
    SchemaMismatch { table: TableName, detail: String },
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),
}

/// Three-part table identifier `catalog.schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parses a one-, two- or three-part name, filling missing parts from the defaults.
    pub fn parse(
        raw: &str,
        default_catalog: &str,
        default_schema: &str,
    ) -> Result<Self, CatalogError> {
        let parts: Vec<&str> = raw.split('.').map(str::trim).collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(CatalogError::InvalidName(raw.to_string()));
        }

        match parts.as_slice() {
            [table] => Ok(Self::new(default_catalog, default_schema, *table)),
            [schema, table] => Ok(Self::new(default_catalog, *schema, *table)),
            [catalog, schema, table] => Ok(Self::new(*catalog, *schema, *table)),
            _ => Err(CatalogError::InvalidName(raw.to_string())),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOperation {
    Create,
    Append,
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub version: u64,
    pub operation: CommitOperation,
    pub timestamp: DateTime<Utc>,
    /// Rows written by the commit, kept after its data has been released.
    pub rows: usize,
    /// Empty once a later overwrite supersedes the commit.
    pub data: DataFrame,
}

/// A table backed by its commit log.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: TableName,
    pub comment: Option<String>,
    commits: Vec<Commit>,
    snapshot: DataFrame,
}

impl Table {
    fn create(name: TableName, comment: Option<String>) -> Self {
        Self {
            name,
            comment,
            commits: vec![Commit {
                version: 0,
                operation: CommitOperation::Create,
                timestamp: Utc::now(),
                rows: 0,
                data: DataFrame::empty(),
            }],
            snapshot: DataFrame::empty(),
        }
    }

    /// Replays a persisted commit log.
    pub fn from_commits(
        name: TableName,
        comment: Option<String>,
        commits: Vec<Commit>,
    ) -> Result<Self, CatalogError> {
        let mut table = Self {
            name,
            comment,
            commits: Vec::with_capacity(commits.len()),
            snapshot: DataFrame::empty(),
        };
        for commit in commits {
            table.apply(commit)?;
        }
        Ok(table)
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn latest_version(&self) -> u64 {
        self.commits.last().map(|c| c.version).unwrap_or(0)
    }

    pub fn snapshot(&self) -> &DataFrame {
        &self.snapshot
    }

    /// Rows still held by the commit log.
    pub fn retained_rows(&self) -> usize {
        self.commits.iter().map(|c| c.data.height()).sum()
    }

    fn next_version(&self) -> u64 {
        self.commits.last().map(|c| c.version + 1).unwrap_or(0)
    }

    fn apply(&mut self, commit: Commit) -> Result<(), CatalogError> {
        match commit.operation {
            CommitOperation::Create => {}
            // Released data of a superseded append.
            CommitOperation::Append if commit.data.width() == 0 => {}
            CommitOperation::Append => {
                if self.snapshot.width() == 0 {
                    self.snapshot = commit.data.clone();
                } else {
                    check_same_schema(&self.name, &self.snapshot, &commit.data)?;
                    self.snapshot.vstack_mut(&commit.data)?;
                }
            }
            CommitOperation::Overwrite => {
                self.snapshot = commit.data.clone();
                for superseded in &mut self.commits {
                    superseded.data = DataFrame::empty();
                }
            }
        }
        self.commits.push(commit);
        Ok(())
    }

    fn commit(&mut self, operation: CommitOperation, data: DataFrame) -> Result<u64, CatalogError> {
        let version = self.next_version();
        self.apply(Commit {
            version,
            operation,
            timestamp: Utc::now(),
            rows: data.height(),
            data,
        })?;
        Ok(version)
    }
}

fn check_same_schema(
    table: &TableName,
    existing: &DataFrame,
    incoming: &DataFrame,
) -> Result<(), CatalogError> {
    let mismatch = |detail: String| CatalogError::SchemaMismatch {
        table: table.clone(),
        detail,
    };

    if existing.width() != incoming.width() {
        return Err(mismatch(format!(
            "expected {} columns, found {}",
            existing.width(),
            incoming.width()
        )));
    }
    for (left, right) in existing.get_columns().iter().zip(incoming.get_columns()) {
        if left.name() != right.name() || left.dtype() != right.dtype() {
            return Err(mismatch(format!(
                "expected {}: {}, found {}: {}",
                left.name(),
                left.dtype(),
                right.name(),
                right.dtype()
            )));
        }
    }
    Ok(())
}

/// New data read from a stream since a checkpoint.
#[derive(Debug, Clone)]
pub struct StreamRead {
    /// Appended rows in commit order, or `None` when nothing new was committed.
    pub data: Option<DataFrame>,
    /// Version the reader has consumed up to.
    pub end_version: u64,
    pub commits_read: usize,
}

/// Named tables of one metastore, addressed by [`TableName`].
#[derive(Debug, Clone)]
pub struct Catalog {
    default_catalog: String,
    default_schema: String,
    tables: BTreeMap<TableName, Table>,
}

impl Catalog {
    pub fn new(default_catalog: impl Into<String>, default_schema: impl Into<String>) -> Self {
        Self {
            default_catalog: default_catalog.into(),
            default_schema: default_schema.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn default_catalog(&self) -> &str {
        &self.default_catalog
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn resolve(&self, raw: &str) -> Result<TableName, CatalogError> {
        TableName::parse(raw, &self.default_catalog, &self.default_schema)
    }

    pub fn contains(&self, name: &TableName) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &TableName) -> Result<&Table, CatalogError> {
        self.tables
            .get(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.clone()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Creates an empty table. Returns `false` when it already exists.
    pub fn create_table(&mut self, name: &TableName, comment: Option<String>) -> bool {
        if self.tables.contains_key(name) {
            return false;
        }
        debug!(table = %name, "creating table");
        self.tables
            .insert(name.clone(), Table::create(name.clone(), comment));
        true
    }

    /// Appends rows, creating the table on first write.
    pub fn append(&mut self, name: &TableName, data: DataFrame) -> Result<u64, CatalogError> {
        self.create_table(name, None);
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.clone()))?;
        let rows = data.height();
        let version = table.commit(CommitOperation::Append, data)?;
        debug!(table = %name, version, rows, "appended rows");
        Ok(version)
    }

    /// Replaces the contents of an existing table.
    pub fn overwrite(&mut self, name: &TableName, data: DataFrame) -> Result<u64, CatalogError> {
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.clone()))?;
        let rows = data.height();
        let version = table.commit(CommitOperation::Overwrite, data)?;
        debug!(table = %name, version, rows, "overwrote table");
        Ok(version)
    }

    /// Current snapshot of a table.
    pub fn read(&self, name: &TableName) -> Result<DataFrame, CatalogError> {
        Ok(self.table(name)?.snapshot().clone())
    }

    /// Rows appended after `after_version`, or since creation when `None`.
    ///
    /// Fails if any of the unread commits rewrote the table, since those changes cannot be
    /// expressed as new rows.
    pub fn read_stream(
        &self,
        name: &TableName,
        after_version: Option<u64>,
    ) -> Result<StreamRead, CatalogError> {
        let table = self.table(name)?;
        let end_version = table.latest_version();

        let mut data: Option<DataFrame> = None;
        let mut commits_read = 0;
        for commit in table
            .commits()
            .iter()
            .filter(|c| after_version.map_or(true, |after| c.version > after))
        {
            match commit.operation {
                CommitOperation::Create => {}
                CommitOperation::Overwrite => {
                    return Err(CatalogError::NonAppendSource {
                        table: name.clone(),
                        version: commit.version,
                    });
                }
                CommitOperation::Append => {
                    commits_read += 1;
                    match data.as_mut() {
                        Some(existing) => {
                            existing.vstack_mut(&commit.data)?;
                        }
                        None => data = Some(commit.data.clone()),
                    }
                }
            }
        }

        Ok(StreamRead {
            data,
            end_version,
            commits_read,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    #[test]
    fn names_resolve_against_defaults() {
        let catalog = Catalog::new("spotify_catalog", "gold");
        assert_eq!(
            catalog.resolve("fact").unwrap().to_string(),
            "spotify_catalog.gold.fact"
        );
        assert_eq!(
            catalog.resolve("silver.factstream").unwrap().to_string(),
            "spotify_catalog.silver.factstream"
        );
        assert!(catalog.resolve("a..b").is_err());
        assert!(catalog.resolve("a.b.c.d").is_err());
    }

    #[test]
    fn stream_reads_only_new_appends() {
        let mut catalog = Catalog::new("main", "default");
        let name = catalog.resolve("events").unwrap();

        let first = catalog
            .append(&name, df!["id" => [1i64, 2]].unwrap())
            .unwrap();
        let initial = catalog.read_stream(&name, None).unwrap();
        assert_eq!(initial.data.unwrap().height(), 2);
        assert_eq!(initial.end_version, first);

        catalog
            .append(&name, df!["id" => [3i64]].unwrap())
            .unwrap();
        let next = catalog.read_stream(&name, Some(first)).unwrap();
        assert_eq!(next.data.unwrap().height(), 1);
        assert_eq!(next.commits_read, 1);

        let idle = catalog.read_stream(&name, Some(next.end_version)).unwrap();
        assert!(idle.data.is_none());
    }

    #[test]
    fn overwritten_tables_are_not_streamable() {
        let mut catalog = Catalog::new("main", "default");
        let name = catalog.resolve("target").unwrap();
        catalog.create_table(&name, None);
        catalog
            .overwrite(&name, df!["id" => [1i64]].unwrap())
            .unwrap();

        assert!(matches!(
            catalog.read_stream(&name, None),
            Err(CatalogError::NonAppendSource { version: 1, .. })
        ));
    }

    #[test]
    fn overwrites_release_superseded_data() {
        let mut catalog = Catalog::new("main", "default");
        let name = catalog.resolve("target").unwrap();
        catalog.create_table(&name, None);
        for n in 1..=5i64 {
            let ids: Vec<i64> = (0..n).collect();
            catalog.overwrite(&name, df!["id" => ids].unwrap()).unwrap();
        }

        let table = catalog.table(&name).unwrap();
        assert_eq!(table.commits().len(), 6);
        assert_eq!(table.retained_rows(), 5);
        assert_eq!(table.commits()[2].rows, 2);
        assert_eq!(table.snapshot().height(), 5);
    }

    #[test]
    fn appends_must_keep_the_schema() {
        let mut catalog = Catalog::new("main", "default");
        let name = catalog.resolve("events").unwrap();
        catalog
            .append(&name, df!["id" => [1i64]].unwrap())
            .unwrap();
        let result = catalog.append(&name, df!["id" => ["x"]].unwrap());
        assert!(matches!(result, Err(CatalogError::SchemaMismatch { .. })));
    }
}
