// crates/cdcflow-core/src/ingest.rs

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use polars::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot infer the format of {0}; pass it explicitly")]
    UnknownFormat(PathBuf),
    #[error("unsupported format '{0}' (expected csv, json or parquet)")]
    UnsupportedFormat(String),
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    /// Newline-delimited JSON.
    Json,
    Parquet,
}

impl FromStr for SourceFormat {
    type Err = IngestError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "json" | "jsonl" | "ndjson" => Ok(SourceFormat::Json),
            "parquet" | "pq" => Ok(SourceFormat::Parquet),
            other => Err(IngestError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| IngestError::UnknownFormat(path.to_path_buf()))?
            .parse()
            .map_err(|_| IngestError::UnknownFormat(path.to_path_buf()))
    }
}

/// Reads one batch of change events from a file.
pub fn read_source_file(path: &Path, format: SourceFormat) -> Result<DataFrame, IngestError> {
    let df = match format {
        SourceFormat::Csv => CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?,
        SourceFormat::Json => {
            let file = open(path)?;
            JsonReader::new(file)
                .with_json_format(JsonFormat::JsonLines)
                .finish()?
        }
        SourceFormat::Parquet => {
            let file = open(path)?;
            ParquetReader::new(file).finish()?
        }
    };
    Ok(df)
}

fn open(path: &Path) -> Result<File, IngestError> {
    File::open(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })
}
