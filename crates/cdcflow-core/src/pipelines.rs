// crates/cdcflow-core/src/pipelines.rs

use once_cell::sync::Lazy;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::flow::{AutoCdcFlow, ScdType};
use crate::pipeline::Pipeline;
use crate::storage::PipelineStore;
use crate::view::{StreamingTableDefinition, ViewDefinition};

#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub code: &'static str,
    pub version: &'static str,
    pub default_catalog: &'static str,
    pub default_schema: &'static str,
    pub description: &'static str,
    declare: fn(&mut Pipeline) -> Result<()>,
}

impl PipelineDescriptor {
    pub fn declare(&self, pipeline: &mut Pipeline) -> Result<()> {
        (self.declare)(pipeline)
    }

    /// In-memory pipeline with this declaration applied.
    pub fn build(&self) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new(
            self.code,
            Catalog::new(self.default_catalog, self.default_schema),
        );
        self.declare(&mut pipeline)?;
        Ok(pipeline)
    }

    /// Pipeline backed by `store` with this declaration applied.
    pub fn open(&self, store: PipelineStore) -> Result<Pipeline> {
        let mut pipeline =
            Pipeline::open(self.code, store, self.default_catalog, self.default_schema)?;
        self.declare(&mut pipeline)?;
        Ok(pipeline)
    }
}

static PIPELINES: Lazy<Vec<PipelineDescriptor>> = Lazy::new(|| {
    vec![PipelineDescriptor {
        code: "gold_fact",
        version: "0.1.0",
        default_catalog: "spotify_catalog",
        default_schema: "gold",
        description: "Silver fact stream merged into gold.fact (SCD1 on stream_id by stream_timestamp)",
        declare: declare_gold_fact,
    }]
});

pub fn all_pipeline_descriptors() -> &'static [PipelineDescriptor] {
    PIPELINES.as_slice()
}

pub fn find_pipeline(code: &str) -> Option<&'static PipelineDescriptor> {
    PIPELINES.iter().find(|p| p.code == code)
}

pub const FACT_SOURCE: &str = "spotify_catalog.silver.factstream";

/// Staging view `fact_stg` over the silver fact stream, streaming table `fact`, and an SCD
/// type 1 auto CDC flow keyed by `stream_id` and sequenced by `stream_timestamp`.
pub fn declare_gold_fact(pipeline: &mut Pipeline) -> Result<()> {
    pipeline.table(ViewDefinition::new("fact_stg", FACT_SOURCE))?;
    pipeline.create_streaming_table(StreamingTableDefinition::new("fact"))?;
    pipeline.create_auto_cdc_flow(
        AutoCdcFlow::new("fact", "fact_stg", ["stream_id"], "stream_timestamp")
            .stored_as(ScdType::Type1)
            .once(false),
    )
}
