// crates/cdcflow-core/src/view.rs

use std::fmt;
use std::sync::Arc;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub type ViewTransform = Arc<dyn Fn(LazyFrame) -> LazyFrame + Send + Sync>;

/// Query a staging view runs over every micro-batch of its source stream.
#[derive(Clone, Default)]
pub enum ViewQuery {
    #[default]
    Passthrough,
    Project(Vec<String>),
    /// A caller-supplied transform. `label` names it for re-declaration checks, so two
    /// declarations with the same label are treated as the same query.
    Custom {
        label: String,
        transform: ViewTransform,
    },
}

impl fmt::Debug for ViewQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewQuery::Passthrough => f.write_str("Passthrough"),
            ViewQuery::Project(columns) => f.debug_tuple("Project").field(columns).finish(),
            ViewQuery::Custom { label, .. } => {
                f.debug_struct("Custom").field("label", label).finish()
            }
        }
    }
}

impl ViewQuery {
    pub fn custom<F>(label: impl Into<String>, transform: F) -> Self
    where
        F: Fn(LazyFrame) -> LazyFrame + Send + Sync + 'static,
    {
        ViewQuery::Custom {
            label: label.into(),
            transform: Arc::new(transform),
        }
    }

    pub fn apply(&self, batch: DataFrame) -> PolarsResult<DataFrame> {
        match self {
            ViewQuery::Passthrough => Ok(batch),
            ViewQuery::Project(columns) => batch
                .lazy()
                .select(
                    columns
                        .iter()
                        .map(|name| col(name.as_str()))
                        .collect::<Vec<_>>(),
                )
                .collect(),
            ViewQuery::Custom { transform, .. } => transform(batch.lazy()).collect(),
        }
    }

    fn descriptor(&self) -> Value {
        match self {
            ViewQuery::Passthrough => json!({ "kind": "passthrough" }),
            ViewQuery::Project(columns) => json!({ "kind": "project", "columns": columns }),
            ViewQuery::Custom { label, .. } => json!({ "kind": "custom", "label": label }),
        }
    }
}

/// A staging view: a named query re-evaluated over the new rows of a streaming source.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub source: String,
    pub query: ViewQuery,
    pub comment: Option<String>,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            query: ViewQuery::Passthrough,
            comment: None,
        }
    }

    pub fn with_query(mut self, query: ViewQuery) -> Self {
        self.query = query;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub(crate) fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "source": self.source,
            "query": self.query.descriptor(),
            "comment": self.comment,
        })
    }
}

/// Target table declaration. The schema is inferred from the first merged micro-batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingTableDefinition {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl StreamingTableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
