// crates/cdcflow-core/src/merge/scd1.rs

use std::collections::HashMap;

use polars::prelude::IdxSize;

use super::{CdcError, ChangeSet, MergeOutcome, MergeStats, Tombstones};
use crate::scalar::Scalar;

struct Winner {
    row: usize,
    sequence: Scalar,
    is_delete: bool,
}

/// Keeps one row per key: the latest event by `(sequence, arrival)`, or none if that event is a
/// delete.
pub(super) fn merge(
    changes: ChangeSet,
    tombstones: &mut Tombstones,
) -> Result<MergeOutcome, CdcError> {
    let mut stats = MergeStats {
        input_rows: changes.len() - changes.target_rows,
        ..MergeStats::default()
    };

    let mut winners: HashMap<&[Scalar], Winner> = HashMap::with_capacity(changes.len());
    let mut first_seen: Vec<&[Scalar]> = Vec::new();

    for idx in 0..changes.len() {
        let key = changes.keys[idx].as_slice();
        let sequence = &changes.sequences[idx];
        let is_delete = changes.is_delete[idx];

        if changes.is_batch_row(idx) && !is_delete {
            if let Some(deleted_at) = tombstones.latest(&changes.keys[idx]) {
                if sequence < deleted_at {
                    stats.stale_ignored += 1;
                    continue;
                }
            }
        }

        match winners.get_mut(key) {
            Some(current) => {
                if *sequence >= current.sequence {
                    current.row = idx;
                    current.sequence = sequence.clone();
                    current.is_delete = is_delete;
                } else {
                    stats.stale_ignored += 1;
                }
            }
            None => {
                first_seen.push(key);
                winners.insert(
                    key,
                    Winner {
                        row: idx,
                        sequence: sequence.clone(),
                        is_delete,
                    },
                );
            }
        }
    }

    let mut indices: Vec<IdxSize> = Vec::with_capacity(first_seen.len());
    for key in first_seen {
        let winner = &winners[key];
        let from_batch = changes.is_batch_row(winner.row);
        let row_key = &changes.keys[winner.row];

        if winner.is_delete {
            tombstones.record(row_key.clone(), winner.sequence.clone(), false);
            stats.deletes_applied += 1;
            continue;
        }

        if from_batch {
            stats.upserts_applied += 1;
            if tombstones
                .latest(row_key)
                .is_some_and(|deleted_at| winner.sequence >= *deleted_at)
            {
                tombstones.forget(row_key);
            }
        }
        indices.push(winner.row as IdxSize);
    }

    let target = changes.take(indices)?;
    stats.target_rows = target.height();

    Ok(MergeOutcome { target, stats })
}
