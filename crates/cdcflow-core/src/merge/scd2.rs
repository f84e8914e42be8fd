// crates/cdcflow-core/src/merge/scd2.rs

use std::collections::HashMap;

use polars::prelude::{DataType, IdxSize};

use super::{
    CdcError, ChangeSet, MergeOutcome, MergeStats, Tombstones, END_AT_COLUMN, START_AT_COLUMN,
};
use crate::flow::{AutoCdcFlow, TrackHistory};
use crate::scalar::{self, Scalar};

enum EventKind {
    Upsert { row: usize },
    Delete { from_batch: bool },
}

struct Event {
    sequence: Scalar,
    arrival: usize,
    kind: EventKind,
}

struct Version {
    row: usize,
    start: Scalar,
    end: Option<Scalar>,
}

/// Rebuilds the version history of every key from its existing versions, its recorded deletes
/// and the new events, replayed in `(sequence, arrival)` order.
///
/// `version_starts` holds the `__START_AT` of each existing target row.
pub(super) fn merge(
    changes: ChangeSet,
    flow: &AutoCdcFlow,
    sequence_dtype: &DataType,
    version_starts: Vec<Scalar>,
    tombstones: &mut Tombstones,
) -> Result<MergeOutcome, CdcError> {
    let mut stats = MergeStats {
        input_rows: changes.len() - changes.target_rows,
        ..MergeStats::default()
    };

    let tracked = tracked_values(&changes, flow)?;
    let same_tracked =
        |a: usize, b: usize| tracked.iter().all(|values| values[a] == values[b]);

    let mut events_by_key: HashMap<&[Scalar], Vec<Event>> = HashMap::new();
    let mut key_order: Vec<&[Scalar]> = Vec::new();

    for idx in 0..changes.len() {
        let key = changes.keys[idx].as_slice();
        let events = events_by_key.entry(key).or_insert_with(|| {
            key_order.push(key);
            tombstones
                .sequences(&changes.keys[idx])
                .map(|sequence| Event {
                    sequence: sequence.clone(),
                    arrival: 0,
                    kind: EventKind::Delete { from_batch: false },
                })
                .collect()
        });

        let from_batch = changes.is_batch_row(idx);
        let sequence = if from_batch {
            changes.sequences[idx].clone()
        } else {
            version_starts[idx].clone()
        };
        let kind = if changes.is_delete[idx] {
            EventKind::Delete { from_batch }
        } else {
            EventKind::Upsert { row: idx }
        };
        events.push(Event {
            sequence,
            arrival: idx + 1,
            kind,
        });
    }

    let mut indices: Vec<IdxSize> = Vec::new();
    let mut starts: Vec<Scalar> = Vec::new();
    let mut ends: Vec<Scalar> = Vec::new();

    for key in key_order {
        let Some(mut events) = events_by_key.remove(key) else {
            continue;
        };
        events.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.arrival.cmp(&b.arrival))
        });

        let mut versions: Vec<Version> = Vec::new();
        let mut open = false;

        for event in events {
            match event.kind {
                EventKind::Delete { from_batch } => {
                    if from_batch {
                        tombstones.record(key.to_vec(), event.sequence.clone(), true);
                        stats.deletes_applied += 1;
                    }
                    if open {
                        let replaced = versions
                            .last()
                            .is_some_and(|current| current.start == event.sequence);
                        if replaced {
                            versions.pop();
                        } else if let Some(current) = versions.last_mut() {
                            current.end = Some(event.sequence);
                        }
                        open = false;
                    }
                }
                EventKind::Upsert { row } => {
                    if changes.is_batch_row(row) {
                        stats.upserts_applied += 1;
                    }
                    match versions.last_mut() {
                        Some(current)
                            if open
                                && (current.start == event.sequence
                                    || same_tracked(current.row, row)) =>
                        {
                            current.row = row;
                        }
                        Some(current) if open => {
                            current.end = Some(event.sequence.clone());
                            versions.push(Version {
                                row,
                                start: event.sequence,
                                end: None,
                            });
                        }
                        _ => {
                            versions.push(Version {
                                row,
                                start: event.sequence,
                                end: None,
                            });
                            open = true;
                        }
                    }
                }
            }
        }

        for version in versions {
            indices.push(version.row as IdxSize);
            starts.push(version.start);
            ends.push(version.end.unwrap_or(Scalar::Null));
        }
    }

    let mut target = changes.take(indices)?;
    target.with_column(scalar::scalars_to_series(
        START_AT_COLUMN,
        &starts,
        sequence_dtype,
    )?)?;
    target.with_column(scalar::scalars_to_series(
        END_AT_COLUMN,
        &ends,
        sequence_dtype,
    )?)?;
    stats.target_rows = target.height();

    Ok(MergeOutcome { target, stats })
}

/// Values of the columns whose changes open a new version.
fn tracked_values(changes: &ChangeSet, flow: &AutoCdcFlow) -> Result<Vec<Vec<Scalar>>, CdcError> {
    let track = flow.track_history();
    let mut values = Vec::new();
    for column in changes.combined.get_columns() {
        let name = column.name().as_str();
        if flow.keys.iter().any(|k| k == name) || name == flow.sequence_by {
            continue;
        }
        let include = match &track {
            TrackHistory::All => true,
            TrackHistory::Only(columns) => columns.iter().any(|c| c == name),
            TrackHistory::Except(columns) => !columns.iter().any(|c| c == name),
        };
        if include {
            values.push(scalar::column_scalars(&changes.combined, name)?);
        }
    }
    Ok(values)
}
