// crates/cdcflow-core/src/flow.rs

use std::fmt;

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// History policy of an auto CDC target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ScdType {
    /// Only the latest state per key is kept.
    #[default]
    Type1,
    /// Every change to a tracked column opens a new version with `__START_AT`/`__END_AT`.
    Type2,
}

impl TryFrom<u8> for ScdType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ScdType::Type1),
            2 => Ok(ScdType::Type2),
            other => Err(format!("stored_as_scd_type must be 1 or 2, got {other}")),
        }
    }
}

impl From<ScdType> for u8 {
    fn from(value: ScdType) -> Self {
        match value {
            ScdType::Type1 => 1,
            ScdType::Type2 => 2,
        }
    }
}

impl fmt::Display for ScdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCD{}", u8::from(*self))
    }
}

/// Which non-key columns open a new SCD type 2 version when they change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackHistory {
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

/// Marks change events that delete their key instead of upserting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeleteCondition {
    /// The column, rendered as text, equals `value` (e.g. `operation = "DELETE"`).
    Equals { column: String, value: String },
    /// The boolean column is true.
    IsTrue { column: String },
}

impl DeleteCondition {
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        DeleteCondition::Equals {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn is_true(column: impl Into<String>) -> Self {
        DeleteCondition::IsTrue {
            column: column.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            DeleteCondition::Equals { column, .. } | DeleteCondition::IsTrue { column } => column,
        }
    }

    pub fn to_expr(&self) -> Expr {
        match self {
            DeleteCondition::Equals { column, value } => col(column.as_str())
                .cast(DataType::String)
                .eq(lit(value.as_str())),
            DeleteCondition::IsTrue { column } => col(column.as_str()).cast(DataType::Boolean),
        }
    }
}

/// Declarative CDC merge of a staging view into a streaming table.
///
/// Field names follow the declaration surface: `keys` identify an entity, `sequence_by`
/// orders its events, and `stored_as_scd_type` picks the history policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoCdcFlow {
    pub target: String,
    pub source: String,
    pub keys: Vec<String>,
    pub sequence_by: String,
    #[serde(default)]
    pub stored_as_scd_type: ScdType,
    #[serde(default)]
    pub track_history_column_list: Option<Vec<String>>,
    #[serde(default)]
    pub track_history_except_column_list: Option<Vec<String>>,
    #[serde(default)]
    pub column_list: Option<Vec<String>>,
    #[serde(default)]
    pub except_column_list: Option<Vec<String>>,
    #[serde(default)]
    pub apply_as_deletes: Option<DeleteCondition>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub once: bool,
}

impl AutoCdcFlow {
    pub fn new<K, S>(
        target: impl Into<String>,
        source: impl Into<String>,
        keys: K,
        sequence_by: impl Into<String>,
    ) -> Self
    where
        K: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            source: source.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            sequence_by: sequence_by.into(),
            stored_as_scd_type: ScdType::Type1,
            track_history_column_list: None,
            track_history_except_column_list: None,
            column_list: None,
            except_column_list: None,
            apply_as_deletes: None,
            name: None,
            once: false,
        }
    }

    pub fn stored_as(mut self, scd_type: ScdType) -> Self {
        self.stored_as_scd_type = scd_type;
        self
    }

    pub fn track_history_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.track_history_column_list = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn track_history_except<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.track_history_except_column_list =
            Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.column_list = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn except_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.except_column_list = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn apply_as_deletes(mut self, condition: DeleteCondition) -> Self {
        self.apply_as_deletes = Some(condition);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    /// Flow name, defaulting to the target name when none was given.
    pub fn flow_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.target)
    }

    pub fn track_history(&self) -> TrackHistory {
        match (
            &self.track_history_column_list,
            &self.track_history_except_column_list,
        ) {
            (Some(only), _) => TrackHistory::Only(only.clone()),
            (None, Some(except)) => TrackHistory::Except(except.clone()),
            (None, None) => TrackHistory::All,
        }
    }

    /// Checks the options against each other. Column existence is checked per micro-batch.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidFlow {
            flow: self.flow_name().to_string(),
            reason,
        };

        if self.target.trim().is_empty() {
            return Err(invalid("target must be set".into()));
        }
        if self.source.trim().is_empty() {
            return Err(invalid("source must be set".into()));
        }
        if self.keys.is_empty() {
            return Err(invalid("at least one key column is required".into()));
        }
        if self.sequence_by.trim().is_empty() {
            return Err(invalid("sequence_by must be set".into()));
        }
        if self.keys.contains(&self.sequence_by) {
            return Err(invalid(format!(
                "sequence column '{}' cannot also be a key",
                self.sequence_by
            )));
        }
        if self.column_list.is_some() && self.except_column_list.is_some() {
            return Err(invalid(
                "column_list and except_column_list are mutually exclusive".into(),
            ));
        }
        if self.track_history_column_list.is_some()
            && self.track_history_except_column_list.is_some()
        {
            return Err(invalid(
                "track_history_column_list and track_history_except_column_list are mutually exclusive"
                    .into(),
            ));
        }
        if self.stored_as_scd_type == ScdType::Type1
            && (self.track_history_column_list.is_some()
                || self.track_history_except_column_list.is_some())
        {
            return Err(invalid(
                "history tracking lists only apply to stored_as_scd_type = 2".into(),
            ));
        }

        let required = self.keys.iter().chain(std::iter::once(&self.sequence_by));
        for column in required {
            if let Some(list) = &self.column_list {
                if !list.contains(column) {
                    return Err(invalid(format!(
                        "column_list must include key/sequence column '{column}'"
                    )));
                }
            }
            if let Some(except) = &self.except_column_list {
                if except.contains(column) {
                    return Err(invalid(format!(
                        "except_column_list cannot exclude key/sequence column '{column}'"
                    )));
                }
            }
        }

        Ok(())
    }
}
