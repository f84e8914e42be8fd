// crates/cdcflow-core/src/merge/mod.rs

//! Change-data-capture merge executor.
//!
//! A micro-batch of change events is folded into the current snapshot of a target table.
//! Events are upserts unless the flow's delete condition marks them as deletes. For every key
//! the event with the greatest `(sequence, arrival)` pair wins, where arrival is the position of
//! the event in the union of the existing target rows followed by the batch rows. Equal sequence
//! values are therefore resolved in favour of the later arrival.

mod scd1;
mod scd2;

use std::collections::{BTreeSet, HashMap};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::{AutoCdcFlow, ScdType};
use crate::scalar::{self, RowKey, Scalar, ScalarError};

pub const START_AT_COLUMN: &str = "__START_AT";
pub const END_AT_COLUMN: &str = "__END_AT";
const DELETE_MASK_COLUMN: &str = "__cdc_is_delete";

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("column '{column}' is missing from the change feed")]
    MissingColumn { column: String },
    #[error("column '{column}' changed type: target has {expected}, change feed has {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },
    #[error("column '{column}' is not present in the target table")]
    UnexpectedColumn { column: String },
    #[error("sequence column '{column}' is null in change row {row}")]
    NullSequence { column: String, row: usize },
    #[error(transparent)]
    Sequence(#[from] ScalarError),
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),
}

/// Delete sequences recorded per key, so an older upsert arriving after a delete does not
/// bring the key back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TombstoneEntry>", into = "Vec<TombstoneEntry>")]
pub struct Tombstones {
    entries: HashMap<RowKey, BTreeSet<Scalar>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub key: RowKey,
    pub sequences: Vec<Scalar>,
}

impl From<Vec<TombstoneEntry>> for Tombstones {
    fn from(entries: Vec<TombstoneEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.key, entry.sequences.into_iter().collect()))
                .collect(),
        }
    }
}

impl From<Tombstones> for Vec<TombstoneEntry> {
    fn from(tombstones: Tombstones) -> Self {
        let mut entries: Vec<TombstoneEntry> = tombstones
            .entries
            .into_iter()
            .map(|(key, sequences)| TombstoneEntry {
                key,
                sequences: sequences.into_iter().collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

impl Tombstones {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Greatest delete sequence recorded for `key`.
    pub fn latest(&self, key: &RowKey) -> Option<&Scalar> {
        self.entries.get(key).and_then(|set| set.iter().next_back())
    }

    pub fn sequences(&self, key: &RowKey) -> impl Iterator<Item = &Scalar> {
        self.entries.get(key).into_iter().flat_map(|set| set.iter())
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> {
        self.entries.keys()
    }

    /// Records a delete, keeping only the latest one when `keep_history` is false.
    pub fn record(&mut self, key: RowKey, sequence: Scalar, keep_history: bool) {
        let set = self.entries.entry(key).or_default();
        if !keep_history {
            if set.iter().next_back().is_some_and(|latest| *latest >= sequence) {
                return;
            }
            set.clear();
        }
        set.insert(sequence);
    }

    pub fn forget(&mut self, key: &RowKey) {
        self.entries.remove(key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub input_rows: usize,
    pub upserts_applied: usize,
    pub deletes_applied: usize,
    pub stale_ignored: usize,
    pub target_rows: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub target: DataFrame,
    pub stats: MergeStats,
}

/// Change events of one micro-batch, lined up after the current target rows.
pub(crate) struct ChangeSet {
    /// Existing target payload rows followed by the batch rows.
    pub combined: DataFrame,
    pub target_rows: usize,
    pub keys: Vec<RowKey>,
    pub sequences: Vec<Scalar>,
    pub is_delete: Vec<bool>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_batch_row(&self, idx: usize) -> bool {
        idx >= self.target_rows
    }

    pub fn take(&self, indices: Vec<IdxSize>) -> PolarsResult<DataFrame> {
        let indices = IdxCa::from_vec("take".into(), indices);
        self.combined.take(&indices)
    }
}

/// Folds `batch` into `target` according to `flow`, updating `tombstones` in place.
pub fn apply_changes(
    target: &DataFrame,
    batch: &DataFrame,
    flow: &AutoCdcFlow,
    tombstones: &mut Tombstones,
) -> Result<MergeOutcome, CdcError> {
    for column in flow.keys.iter().chain(std::iter::once(&flow.sequence_by)) {
        if batch.column(column).is_err() {
            return Err(CdcError::MissingColumn {
                column: column.clone(),
            });
        }
    }

    let is_delete = delete_mask(batch, flow)?;
    let batch = project_columns(batch, flow)?;

    match flow.stored_as_scd_type {
        ScdType::Type1 => {
            let changes = line_up(target, &batch, is_delete, flow)?;
            scd1::merge(changes, tombstones)
        }
        ScdType::Type2 => {
            let payload = drop_history_columns(target)?;
            let changes = line_up(&payload, &batch, is_delete, flow)?;
            let version_starts = if target.column(START_AT_COLUMN).is_ok() {
                scalar::sequence_scalars(target, START_AT_COLUMN)?
            } else {
                changes.sequences[..changes.target_rows].to_vec()
            };
            let sequence_dtype = batch.column(&flow.sequence_by)?.dtype().clone();
            scd2::merge(changes, flow, &sequence_dtype, version_starts, tombstones)
        }
    }
}

fn delete_mask(batch: &DataFrame, flow: &AutoCdcFlow) -> Result<Vec<bool>, CdcError> {
    let Some(condition) = flow.apply_as_deletes.as_ref() else {
        return Ok(vec![false; batch.height()]);
    };

    if batch.column(condition.column()).is_err() {
        return Err(CdcError::MissingColumn {
            column: condition.column().to_string(),
        });
    }

    let mask = batch
        .clone()
        .lazy()
        .select([condition
            .to_expr()
            .fill_null(lit(false))
            .alias(DELETE_MASK_COLUMN)])
        .collect()?;
    let values = mask
        .column(DELETE_MASK_COLUMN)?
        .as_materialized_series()
        .bool()?
        .into_iter()
        .map(|v| v.unwrap_or(false))
        .collect();
    Ok(values)
}

fn project_columns(batch: &DataFrame, flow: &AutoCdcFlow) -> Result<DataFrame, CdcError> {
    let names: Vec<String> = batch
        .get_columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let selected: Vec<String> = if let Some(list) = flow.column_list.as_ref() {
        for column in list {
            if !names.contains(column) {
                return Err(CdcError::MissingColumn {
                    column: column.clone(),
                });
            }
        }
        names.into_iter().filter(|n| list.contains(n)).collect()
    } else if let Some(except) = flow.except_column_list.as_ref() {
        names.into_iter().filter(|n| !except.contains(n)).collect()
    } else {
        return Ok(batch.clone());
    };

    Ok(batch.select(selected)?)
}

fn drop_history_columns(target: &DataFrame) -> PolarsResult<DataFrame> {
    let mut payload = target.clone();
    for column in [START_AT_COLUMN, END_AT_COLUMN] {
        if payload.column(column).is_ok() {
            payload = payload.drop(column)?;
        }
    }
    Ok(payload)
}

/// Stacks the batch under the target payload after checking the two agree on their columns.
fn line_up(
    payload: &DataFrame,
    batch: &DataFrame,
    is_delete: Vec<bool>,
    flow: &AutoCdcFlow,
) -> Result<ChangeSet, CdcError> {
    let combined = if payload.width() == 0 {
        batch.clone()
    } else {
        for column in batch.get_columns() {
            if payload.column(column.name().as_str()).is_err() {
                return Err(CdcError::UnexpectedColumn {
                    column: column.name().to_string(),
                });
            }
        }

        let mut order = Vec::with_capacity(payload.width());
        for column in payload.get_columns() {
            let name = column.name().to_string();
            let incoming = batch
                .column(&name)
                .map_err(|_| CdcError::MissingColumn {
                    column: name.clone(),
                })?;
            if incoming.dtype() != column.dtype() {
                return Err(CdcError::TypeMismatch {
                    column: name,
                    expected: column.dtype().to_string(),
                    found: incoming.dtype().to_string(),
                });
            }
            order.push(name);
        }

        payload.vstack(&batch.select(order)?)?
    };

    let target_rows = combined.height() - batch.height();
    let keys = scalar::row_keys(&combined, &flow.keys)?;
    let sequences = scalar::sequence_scalars(&combined, &flow.sequence_by)?;

    if let Some(row) = sequences
        .iter()
        .enumerate()
        .skip(target_rows)
        .find_map(|(idx, value)| value.is_null().then_some(idx - target_rows))
    {
        return Err(CdcError::NullSequence {
            column: flow.sequence_by.clone(),
            row,
        });
    }

    let mut deletes = vec![false; target_rows];
    deletes.extend(is_delete);

    Ok(ChangeSet {
        combined,
        target_rows,
        keys,
        sequences,
        is_delete: deletes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstones_keep_latest_only_without_history() {
        let key = vec![Scalar::Int(1)];
        let mut tombstones = Tombstones::default();
        tombstones.record(key.clone(), Scalar::Int(5), false);
        tombstones.record(key.clone(), Scalar::Int(3), false);
        tombstones.record(key.clone(), Scalar::Int(9), false);

        assert_eq!(tombstones.latest(&key), Some(&Scalar::Int(9)));
        assert_eq!(tombstones.sequences(&key).count(), 1);
    }

    #[test]
    fn tombstones_serialize_as_entry_list() {
        let mut tombstones = Tombstones::default();
        tombstones.record(vec![Scalar::Str("a".into())], Scalar::Int(2), true);
        tombstones.record(vec![Scalar::Str("a".into())], Scalar::Int(7), true);

        let json = serde_json::to_string(&tombstones).expect("serialize");
        let restored: Tombstones = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, tombstones);
        assert_eq!(
            restored.sequences(&vec![Scalar::Str("a".into())]).count(),
            2
        );
    }
}
