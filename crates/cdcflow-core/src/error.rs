// crates/cdcflow-core/src/error.rs

use polars::prelude::PolarsError;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::merge::CdcError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("flow '{flow}' failed: {source}")]
    Merge {
        flow: String,
        #[source]
        source: CdcError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] PolarsError),

    #[error("failed to fingerprint definition: {0}")]
    Fingerprint(#[from] serde_json::Error),

    #[error("{kind} '{name}' is already declared with a different definition")]
    ConflictingDefinition { kind: &'static str, name: String },

    #[error("invalid flow '{flow}': {reason}")]
    InvalidFlow { flow: String, reason: String },

    #[error("flow '{flow}' reads from undeclared view '{view}'")]
    UndeclaredView { flow: String, view: String },

    #[error("flow '{flow}' writes to undeclared streaming table '{table}'")]
    UndeclaredTarget { flow: String, table: String },

    #[error("streaming table '{table}' is already the target of auto CDC flow '{flow}'")]
    DuplicateTarget { table: String, flow: String },

    #[error("view '{view}' reads from missing source table '{table}'")]
    MissingSource { view: String, table: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
