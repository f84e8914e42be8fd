// crates/cdcflow-core/src/checkpoint.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::merge::Tombstones;

/// Progress of one flow through its source stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    /// Last source commit version merged into the target.
    pub source_version: Option<u64>,
    /// Fingerprint of the flow definition the checkpoint was written under.
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub completed_once: bool,
    #[serde(default)]
    pub tombstones: Tombstones,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSet {
    pub pipeline: String,
    #[serde(default)]
    pub flows: BTreeMap<String, FlowCheckpoint>,
}

impl CheckpointSet {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            flows: BTreeMap::new(),
        }
    }

    pub fn get(&self, flow: &str) -> Option<&FlowCheckpoint> {
        self.flows.get(flow)
    }

    pub fn set(&mut self, flow: impl Into<String>, checkpoint: FlowCheckpoint) {
        self.flows.insert(flow.into(), checkpoint);
    }

    pub fn reset(&mut self) {
        self.flows.clear();
    }
}
