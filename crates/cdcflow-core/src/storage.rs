// crates/cdcflow-core/src/storage.rs

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use polars::io::parquet::write::{ParquetCompression, ParquetWriter, StatisticsOptions};
use polars::prelude::{DataFrame, ParquetReader, PolarsError, SerReader};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::{Catalog, CatalogError, Commit, CommitOperation, Table, TableName};
use crate::checkpoint::CheckpointSet;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where tables and checkpoints live between runs.
#[derive(Debug, Clone, Default)]
pub struct PipelineStore {
    inner: StoreKind,
}

#[derive(Debug, Clone, Default)]
enum StoreKind {
    /// Nothing is persisted.
    #[default]
    Memory,
    /// Parquet data files and JSON logs under a root directory.
    Local(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct TableLog {
    name: TableName,
    comment: Option<String>,
    commits: Vec<CommitEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitEntry {
    version: u64,
    operation: CommitOperation,
    timestamp: DateTime<Utc>,
    rows: usize,
    data_file: Option<String>,
}

const TABLE_LOG: &str = "_log.json";

impl PipelineStore {
    pub fn memory() -> Self {
        PipelineStore {
            inner: StoreKind::Memory,
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        PipelineStore {
            inner: StoreKind::Local(root.into()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        match &self.inner {
            StoreKind::Memory => None,
            StoreKind::Local(root) => Some(root.as_path()),
        }
    }

    pub fn table_key(name: &TableName) -> PathBuf {
        PathBuf::from("tables")
            .join(&name.catalog)
            .join(&name.schema)
            .join(&name.table)
    }

    pub fn checkpoint_key(pipeline: &str) -> PathBuf {
        PathBuf::from("checkpoints").join(format!("{pipeline}.json"))
    }

    /// Loads every persisted table. A memory store yields an empty catalog.
    pub fn load_catalog(
        &self,
        default_catalog: &str,
        default_schema: &str,
    ) -> Result<Catalog, StorageError> {
        let mut catalog = Catalog::new(default_catalog, default_schema);
        let StoreKind::Local(root) = &self.inner else {
            return Ok(catalog);
        };

        let tables_root = root.join("tables");
        if !tables_root.exists() {
            return Ok(catalog);
        }

        for catalog_dir in subdirectories(&tables_root)? {
            for schema_dir in subdirectories(&catalog_dir)? {
                for table_dir in subdirectories(&schema_dir)? {
                    if table_dir.join(TABLE_LOG).exists() {
                        catalog.insert_table(load_table(&table_dir)?);
                    }
                }
            }
        }

        Ok(catalog)
    }

    pub fn save_catalog(&self, catalog: &Catalog) -> Result<(), StorageError> {
        for table in catalog.tables() {
            self.save_table(table)?;
        }
        Ok(())
    }

    /// Writes any commits not yet on disk, then rewrites the table log.
    pub fn save_table(&self, table: &Table) -> Result<(), StorageError> {
        let StoreKind::Local(root) = &self.inner else {
            return Ok(());
        };

        let dir = root.join(Self::table_key(&table.name));
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let mut entries = Vec::with_capacity(table.commits().len());
        for commit in table.commits() {
            let data_file = if commit.data.width() == 0 {
                None
            } else {
                let file_name = format!("{:020}.parquet", commit.version);
                let path = dir.join(&file_name);
                if !path.exists() {
                    write_parquet(&path, &commit.data)?;
                    debug!(table = %table.name, version = commit.version, "wrote data file");
                }
                Some(file_name)
            };
            entries.push(CommitEntry {
                version: commit.version,
                operation: commit.operation,
                timestamp: commit.timestamp,
                rows: commit.rows,
                data_file,
            });
        }

        let live: HashSet<String> = entries
            .iter()
            .filter_map(|entry| entry.data_file.clone())
            .collect();
        let log = TableLog {
            name: table.name.clone(),
            comment: table.comment.clone(),
            commits: entries,
        };
        write_json_atomic(&dir.join(TABLE_LOG), &serde_json::to_vec_pretty(&log)?)?;

        // Files of superseded commits go only after the log stops referencing them.
        for entry in fs::read_dir(&dir).map_err(io_error(&dir))? {
            let path = entry.map_err(io_error(&dir))?.path();
            let stale = path.extension().is_some_and(|ext| ext == "parquet")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| !live.contains(name));
            if stale {
                fs::remove_file(&path).map_err(io_error(&path))?;
                debug!(table = %table.name, path = %path.display(), "removed superseded data file");
            }
        }
        Ok(())
    }

    pub fn load_checkpoints(&self, pipeline: &str) -> Result<CheckpointSet, StorageError> {
        let StoreKind::Local(root) = &self.inner else {
            return Ok(CheckpointSet::new(pipeline));
        };

        let path = root.join(Self::checkpoint_key(pipeline));
        if !path.exists() {
            return Ok(CheckpointSet::new(pipeline));
        }
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save_checkpoints(&self, checkpoints: &CheckpointSet) -> Result<(), StorageError> {
        let StoreKind::Local(root) = &self.inner else {
            return Ok(());
        };

        let path = root.join(Self::checkpoint_key(&checkpoints.pipeline));
        write_json_atomic(&path, &serde_json::to_vec_pretty(checkpoints)?)
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn load_table(dir: &Path) -> Result<Table, StorageError> {
    let log_path = dir.join(TABLE_LOG);
    let bytes = fs::read(&log_path).map_err(io_error(&log_path))?;
    let log: TableLog = serde_json::from_slice(&bytes)?;

    // Only the last overwrite and the appends after it contribute to the snapshot.
    let live_from = log
        .commits
        .iter()
        .rposition(|entry| entry.operation == CommitOperation::Overwrite)
        .unwrap_or(0);

    let mut commits = Vec::with_capacity(log.commits.len());
    for (idx, entry) in log.commits.into_iter().enumerate() {
        let data = match entry.data_file {
            Some(file_name) if idx >= live_from => read_parquet(&dir.join(file_name))?,
            _ => DataFrame::empty(),
        };
        commits.push(Commit {
            version: entry.version,
            operation: entry.operation,
            timestamp: entry.timestamp,
            rows: entry.rows,
            data,
        });
    }

    Ok(Table::from_commits(log.name, log.comment, commits)?)
}

fn write_parquet(path: &Path, df: &DataFrame) -> Result<(), StorageError> {
    let mut file = File::create(path).map_err(io_error(path))?;
    let mut clone = df.clone();
    ParquetWriter::new(&mut file)
        .with_compression(ParquetCompression::Zstd(None))
        .with_statistics(StatisticsOptions::default())
        .finish(&mut clone)?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<DataFrame, StorageError> {
    let file = File::open(path).map_err(io_error(path))?;
    Ok(ParquetReader::new(file).finish()?)
}

fn write_json_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
        file.write_all(bytes).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_error(path))
}
