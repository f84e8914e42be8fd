pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod flow;
pub mod ingest;
pub mod merge;
pub mod pipeline;
pub mod pipelines;
pub mod runtime;
pub mod scalar;
pub mod storage;
pub mod view;

pub use catalog::{Catalog, TableName};
pub use error::{PipelineError, Result};
pub use flow::{AutoCdcFlow, DeleteCondition, ScdType};
pub use pipeline::{Pipeline, UpdateReport};
pub use view::{StreamingTableDefinition, ViewDefinition, ViewQuery};
