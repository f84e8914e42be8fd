// crates/cdcflow-core/src/pipeline.rs

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, TableName};
use crate::checkpoint::{CheckpointSet, FlowCheckpoint};
use crate::error::{PipelineError, Result};
use crate::flow::AutoCdcFlow;
use crate::merge::{self, MergeStats};
use crate::storage::PipelineStore;
use crate::view::{StreamingTableDefinition, ViewDefinition};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Completed,
    NoNewData,
    SkippedOnce,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub flow: String,
    pub source: String,
    pub target: String,
    pub status: FlowStatus,
    pub source_version: Option<u64>,
    pub target_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<MergeStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub update_id: Uuid,
    pub pipeline: String,
    pub full_refresh: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub flows: Vec<FlowReport>,
}

impl UpdateReport {
    pub fn flow(&self, name: &str) -> Option<&FlowReport> {
        self.flows.iter().find(|f| f.flow == name)
    }

    pub fn processed_rows(&self) -> usize {
        self.flows
            .iter()
            .filter_map(|f| f.stats.as_ref())
            .map(|s| s.input_rows)
            .sum()
    }
}

/// Hex blake3 digest of a definition's canonical JSON form.
pub fn fingerprint(descriptor: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(descriptor)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// A pipeline graph: staging views, streaming tables and the auto CDC flows binding them.
///
/// Declarations are idempotent: declaring an identical definition again is a no-op, while a
/// different definition under an existing name is rejected.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    catalog: Catalog,
    store: PipelineStore,
    views: BTreeMap<String, ViewDefinition>,
    streaming_tables: BTreeMap<TableName, StreamingTableDefinition>,
    flows: Vec<AutoCdcFlow>,
    fingerprints: HashMap<(&'static str, String), String>,
    checkpoints: CheckpointSet,
}

impl Pipeline {
    /// In-memory pipeline over `catalog`.
    pub fn new(name: impl Into<String>, catalog: Catalog) -> Self {
        let name = name.into();
        Self {
            checkpoints: CheckpointSet::new(name.clone()),
            name,
            catalog,
            store: PipelineStore::memory(),
            views: BTreeMap::new(),
            streaming_tables: BTreeMap::new(),
            flows: Vec::new(),
            fingerprints: HashMap::new(),
        }
    }

    /// Pipeline whose tables and checkpoints are loaded from, and written back to, `store`.
    pub fn open(
        name: impl Into<String>,
        store: PipelineStore,
        default_catalog: &str,
        default_schema: &str,
    ) -> Result<Self> {
        let name = name.into();
        let catalog = store.load_catalog(default_catalog, default_schema)?;
        let checkpoints = store.load_checkpoints(&name)?;
        debug!(
            pipeline = %name,
            tables = catalog.tables().count(),
            flows = checkpoints.flows.len(),
            "opened pipeline store"
        );

        let mut pipeline = Self::new(name, catalog);
        pipeline.store = store;
        pipeline.checkpoints = checkpoints;
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn views(&self) -> impl Iterator<Item = &ViewDefinition> {
        self.views.values()
    }

    pub fn streaming_tables(
        &self,
    ) -> impl Iterator<Item = (&TableName, &StreamingTableDefinition)> {
        self.streaming_tables.iter()
    }

    pub fn flows(&self) -> &[AutoCdcFlow] {
        &self.flows
    }

    pub fn checkpoint(&self, flow: &str) -> Option<&FlowCheckpoint> {
        self.checkpoints.get(flow)
    }

    /// Reads the current snapshot of a table by (possibly unqualified) name.
    pub fn read(&self, table: &str) -> Result<DataFrame> {
        let name = self.catalog.resolve(table)?;
        Ok(self.catalog.read(&name)?)
    }

    /// Appends change events to a source table and persists it.
    pub fn append(&mut self, table: &str, data: DataFrame) -> Result<u64> {
        let name = self.catalog.resolve(table)?;
        let version = self.catalog.append(&name, data)?;
        self.store.save_table(self.catalog.table(&name)?)?;
        Ok(version)
    }

    fn register(&mut self, kind: &'static str, name: String, descriptor: Value) -> Result<bool> {
        let digest = fingerprint(&descriptor)?;
        match self.fingerprints.get(&(kind, name.clone())) {
            Some(existing) if *existing == digest => {
                debug!(kind, name = %name, "identical re-declaration ignored");
                Ok(false)
            }
            Some(_) => Err(PipelineError::ConflictingDefinition { kind, name }),
            None => {
                self.fingerprints.insert((kind, name), digest);
                Ok(true)
            }
        }
    }

    /// Declares a staging view.
    pub fn table(&mut self, view: ViewDefinition) -> Result<()> {
        if self.register("view", view.name.clone(), view.descriptor())? {
            info!(pipeline = %self.name, view = %view.name, source = %view.source, "declared view");
            self.views.insert(view.name.clone(), view);
        }
        Ok(())
    }

    /// Declares a streaming table, creating it in the catalog if absent.
    pub fn create_streaming_table(
        &mut self,
        definition: StreamingTableDefinition,
    ) -> Result<TableName> {
        let name = self.catalog.resolve(&definition.name)?;
        let descriptor = serde_json::to_value(&definition)?;
        if self.register("streaming table", name.to_string(), descriptor)? {
            let created = self.catalog.create_table(&name, definition.comment.clone());
            info!(pipeline = %self.name, table = %name, created, "declared streaming table");
            self.streaming_tables.insert(name.clone(), definition);
        }
        Ok(name)
    }

    /// Declares an auto CDC flow from a staging view into a streaming table.
    pub fn create_auto_cdc_flow(&mut self, flow: AutoCdcFlow) -> Result<()> {
        flow.validate()?;
        let descriptor = serde_json::to_value(&flow)?;
        if self.register("flow", flow.flow_name().to_string(), descriptor)? {
            info!(
                pipeline = %self.name,
                flow = flow.flow_name(),
                source = %flow.source,
                target = %flow.target,
                scd = %flow.stored_as_scd_type,
                "declared auto CDC flow"
            );
            self.flows.push(flow);
        }
        Ok(())
    }

    /// Checks that the declared graph is complete and its sources exist.
    pub fn validate(&self) -> Result<()> {
        let mut targets: HashMap<TableName, &str> = HashMap::new();

        for flow in &self.flows {
            if !self.views.contains_key(&flow.source) {
                return Err(PipelineError::UndeclaredView {
                    flow: flow.flow_name().to_string(),
                    view: flow.source.clone(),
                });
            }

            let target = self.catalog.resolve(&flow.target)?;
            if !self.streaming_tables.contains_key(&target) {
                return Err(PipelineError::UndeclaredTarget {
                    flow: flow.flow_name().to_string(),
                    table: target.to_string(),
                });
            }
            if let Some(existing) = targets.insert(target.clone(), flow.flow_name()) {
                return Err(PipelineError::DuplicateTarget {
                    table: target.to_string(),
                    flow: existing.to_string(),
                });
            }
        }

        for view in self.views.values() {
            let source = self.catalog.resolve(&view.source)?;
            if !self.catalog.contains(&source) {
                return Err(PipelineError::MissingSource {
                    view: view.name.clone(),
                    table: source.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Runs every flow once over the source rows committed since its checkpoint.
    pub fn update(&mut self) -> Result<UpdateReport> {
        self.run_update(false)
    }

    /// Empties every streaming table and clears all checkpoints, then reprocesses the sources
    /// from the beginning.
    pub fn full_refresh(&mut self) -> Result<UpdateReport> {
        let tables: Vec<TableName> = self.streaming_tables.keys().cloned().collect();
        for table in &tables {
            self.catalog.overwrite(table, DataFrame::empty())?;
            self.store.save_table(self.catalog.table(table)?)?;
        }
        self.checkpoints.reset();
        self.store.save_checkpoints(&self.checkpoints)?;
        info!(
            pipeline = %self.name,
            tables = tables.len(),
            "reset streaming tables for full refresh"
        );
        self.run_update(true)
    }

    fn run_update(&mut self, full_refresh: bool) -> Result<UpdateReport> {
        self.validate()?;

        let update_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(pipeline = %self.name, %update_id, full_refresh, "starting update");

        let flows = self.flows.clone();
        let mut reports = Vec::with_capacity(flows.len());
        for flow in &flows {
            reports.push(self.run_flow(flow)?);
        }

        self.store.save_checkpoints(&self.checkpoints)?;

        let report = UpdateReport {
            update_id,
            pipeline: self.name.clone(),
            full_refresh,
            started_at,
            finished_at: Utc::now(),
            flows: reports,
        };
        info!(
            pipeline = %self.name,
            %update_id,
            rows = report.processed_rows(),
            "update finished"
        );
        Ok(report)
    }

    fn run_flow(&mut self, flow: &AutoCdcFlow) -> Result<FlowReport> {
        let flow_name = flow.flow_name().to_string();
        let definition = fingerprint(&serde_json::to_value(flow)?)?;
        let previous = self.checkpoints.get(&flow_name).cloned().unwrap_or_default();

        if previous
            .definition
            .as_ref()
            .is_some_and(|recorded| *recorded != definition)
        {
            warn!(
                flow = %flow_name,
                "flow definition changed since the last checkpoint; run a full refresh to rebuild the target"
            );
        }

        let view = self
            .views
            .get(&flow.source)
            .cloned()
            .ok_or_else(|| PipelineError::UndeclaredView {
                flow: flow_name.clone(),
                view: flow.source.clone(),
            })?;
        let source = self.catalog.resolve(&view.source)?;
        let target = self.catalog.resolve(&flow.target)?;

        let mut report = FlowReport {
            flow: flow_name.clone(),
            source: source.to_string(),
            target: target.to_string(),
            status: FlowStatus::Completed,
            source_version: previous.source_version,
            target_version: None,
            stats: None,
        };

        if flow.once && previous.completed_once {
            debug!(flow = %flow_name, "once flow already completed");
            report.status = FlowStatus::SkippedOnce;
            return Ok(report);
        }

        let stream = self.catalog.read_stream(&source, previous.source_version)?;
        report.source_version = Some(stream.end_version);

        let Some(batch) = stream.data else {
            debug!(flow = %flow_name, source = %source, "no new source commits");
            self.checkpoints.set(
                flow_name,
                FlowCheckpoint {
                    source_version: Some(stream.end_version),
                    definition: Some(definition),
                    completed_once: previous.completed_once || flow.once,
                    updated_at: Some(Utc::now()),
                    ..previous
                },
            );
            report.status = FlowStatus::NoNewData;
            return Ok(report);
        };

        let staged = view.query.apply(batch)?;
        let current = self.catalog.read(&target)?;
        let mut tombstones = previous.tombstones;

        let outcome = merge::apply_changes(&current, &staged, flow, &mut tombstones).map_err(
            |source| PipelineError::Merge {
                flow: flow_name.clone(),
                source,
            },
        )?;

        let version = self.catalog.overwrite(&target, outcome.target)?;
        self.store.save_table(self.catalog.table(&target)?)?;

        info!(
            flow = %flow_name,
            target = %target,
            version,
            commits = stream.commits_read,
            rows = outcome.stats.input_rows,
            upserts = outcome.stats.upserts_applied,
            deletes = outcome.stats.deletes_applied,
            stale = outcome.stats.stale_ignored,
            "merged micro-batch"
        );

        self.checkpoints.set(
            flow_name,
            FlowCheckpoint {
                source_version: Some(stream.end_version),
                definition: Some(definition),
                completed_once: previous.completed_once || flow.once,
                tombstones,
                updated_at: Some(Utc::now()),
            },
        );
        self.store.save_checkpoints(&self.checkpoints)?;

        report.target_version = Some(version);
        report.stats = Some(outcome.stats);
        Ok(report)
    }
}
