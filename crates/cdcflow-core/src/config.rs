// crates/cdcflow-core/src/config.rs

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::error::PipelineError;
use crate::flow::AutoCdcFlow;
use crate::pipeline::Pipeline;
use crate::storage::PipelineStore;
use crate::view::{StreamingTableDefinition, ViewDefinition, ViewQuery};

pub const DATA_DIR_ENV: &str = "CDCFLOW_DATA_DIR";
pub const TRIGGER_INTERVAL_ENV: &str = "CDCFLOW_TRIGGER_INTERVAL_SECS";
pub const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pipeline file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid pipeline file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: &'static str, value: String },
    #[error("trigger_interval_secs must be at least 1")]
    ZeroTriggerInterval,
}

/// Parses a trigger interval given in whole seconds. Zero is rejected.
pub fn parse_trigger_interval(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidEnv {
            var: TRIGGER_INTERVAL_ENV,
            value: raw.to_string(),
        }),
    }
}

/// A pipeline declared in TOML.
///
/// ```toml
/// [pipeline]
/// name = "gold_fact"
/// default_catalog = "spotify_catalog"
/// default_schema = "gold"
///
/// [[views]]
/// name = "fact_stg"
/// source = "spotify_catalog.silver.factstream"
///
/// [[streaming_tables]]
/// name = "fact"
///
/// [[flows]]
/// target = "fact"
/// source = "fact_stg"
/// keys = ["stream_id"]
/// sequence_by = "stream_timestamp"
/// stored_as_scd_type = 1
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub views: Vec<ViewConfig>,
    #[serde(default)]
    pub streaming_tables: Vec<StreamingTableDefinition>,
    #[serde(default)]
    pub flows: Vec<AutoCdcFlow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub name: String,
    #[serde(default = "default_catalog")]
    pub default_catalog: String,
    #[serde(default = "default_schema")]
    pub default_schema: String,
    #[serde(default)]
    pub storage: Option<PathBuf>,
    #[serde(default)]
    pub trigger_interval_secs: Option<u64>,
}

fn default_catalog() -> String {
    "main".to_string()
}

fn default_schema() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    pub source: String,
    /// Columns to project; all columns pass through when absent.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ViewConfig {
    pub fn to_definition(&self) -> ViewDefinition {
        let query = match &self.columns {
            Some(columns) => ViewQuery::Project(columns.clone()),
            None => ViewQuery::Passthrough,
        };
        let mut view = ViewDefinition::new(&self.name, &self.source).with_query(query);
        view.comment = self.comment.clone();
        view
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        if config.pipeline.trigger_interval_secs == Some(0) {
            return Err(ConfigError::ZeroTriggerInterval);
        }
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;

        if let Some(storage) = config.pipeline.storage.as_mut() {
            if storage.is_relative() {
                if let Some(parent) = path.parent() {
                    *storage = parent.join(&*storage);
                }
            }
        }
        Ok(config)
    }

    /// Applies `CDCFLOW_*` environment overrides (after loading `.env`, if any).
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        dotenvy::dotenv().ok();

        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.pipeline.storage = Some(PathBuf::from(dir));
            }
        }
        if let Ok(raw) = env::var(TRIGGER_INTERVAL_ENV) {
            let interval = parse_trigger_interval(&raw)?;
            self.pipeline.trigger_interval_secs = Some(interval.as_secs());
        }
        Ok(())
    }

    pub fn trigger_interval(&self) -> Duration {
        self.pipeline
            .trigger_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TRIGGER_INTERVAL)
    }

    pub fn store(&self) -> PipelineStore {
        match &self.pipeline.storage {
            Some(dir) => PipelineStore::local(dir),
            None => PipelineStore::memory(),
        }
    }

    /// Opens the pipeline's store and declares every view, table and flow in file order.
    pub fn build(&self) -> Result<Pipeline, PipelineError> {
        let mut pipeline = Pipeline::open(
            &self.pipeline.name,
            self.store(),
            &self.pipeline.default_catalog,
            &self.pipeline.default_schema,
        )?;
        self.declare(&mut pipeline)?;
        Ok(pipeline)
    }

    pub fn declare(&self, pipeline: &mut Pipeline) -> Result<(), PipelineError> {
        for view in &self.views {
            pipeline.table(view.to_definition())?;
        }
        for table in &self.streaming_tables {
            pipeline.create_streaming_table(table.clone())?;
        }
        for flow in &self.flows {
            pipeline.create_auto_cdc_flow(flow.clone())?;
        }
        Ok(())
    }
}
