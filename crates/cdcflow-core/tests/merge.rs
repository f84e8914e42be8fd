use std::collections::BTreeMap;

use anyhow::Result;
use polars::prelude::*;

use cdcflow_core::flow::{AutoCdcFlow, DeleteCondition, ScdType};
use cdcflow_core::merge::{apply_changes, CdcError, Tombstones, END_AT_COLUMN, START_AT_COLUMN};

fn flow() -> AutoCdcFlow {
    AutoCdcFlow::new("target", "source", ["id"], "ts")
}

fn events(ids: &[i64], ts: &[i64], vals: &[&str]) -> DataFrame {
    df![
        "id" => ids,
        "ts" => ts,
        "val" => vals,
    ]
    .expect("valid frame")
}

fn ops(ids: &[i64], ts: &[i64], vals: &[Option<&str>], op: &[&str]) -> DataFrame {
    df![
        "id" => ids,
        "ts" => ts,
        "val" => vals,
        "op" => op,
    ]
    .expect("valid frame")
}

fn values_by_id(df: &DataFrame) -> PolarsResult<BTreeMap<i64, String>> {
    let ids = df.column("id")?.i64()?;
    let vals = df.column("val")?.str()?;
    Ok(ids
        .into_iter()
        .zip(vals)
        .filter_map(|(id, val)| Some((id?, val?.to_string())))
        .collect())
}

/// Applies each batch in turn, starting from an empty target.
fn merge_all(flow: &AutoCdcFlow, batches: &[DataFrame]) -> Result<(DataFrame, Tombstones)> {
    let mut target = DataFrame::empty();
    let mut tombstones = Tombstones::default();
    for batch in batches {
        target = apply_changes(&target, batch, flow, &mut tombstones)?.target;
    }
    Ok((target, tombstones))
}

#[test]
fn later_sequence_wins_in_either_arrival_order() -> Result<()> {
    let older = events(&[1], &[5], &["b"]);
    let newer = events(&[1], &[10], &["a"]);

    let (forward, _) = merge_all(&flow(), &[older.clone(), newer.clone()])?;
    let (backward, _) = merge_all(&flow(), &[newer, older])?;

    assert_eq!(values_by_id(&forward)?, BTreeMap::from([(1, "a".to_string())]));
    assert_eq!(values_by_id(&backward)?, BTreeMap::from([(1, "a".to_string())]));
    assert_eq!(forward.height(), 1);
    assert_eq!(backward.height(), 1);
    Ok(())
}

#[test]
fn out_of_sequence_event_in_one_batch_is_ignored() -> Result<()> {
    let batch = events(&[1, 1], &[10, 5], &["a", "b"]);
    let mut tombstones = Tombstones::default();
    let outcome = apply_changes(&DataFrame::empty(), &batch, &flow(), &mut tombstones)?;

    assert_eq!(values_by_id(&outcome.target)?[&1], "a");
    assert_eq!(outcome.stats.input_rows, 2);
    assert_eq!(outcome.stats.stale_ignored, 1);
    assert_eq!(outcome.stats.upserts_applied, 1);
    Ok(())
}

#[test]
fn distinct_keys_are_merged_independently() -> Result<()> {
    let (target, _) = merge_all(
        &flow(),
        &[
            events(&[1, 2], &[1, 1], &["one", "two"]),
            events(&[2], &[2], &["two-updated"]),
        ],
    )?;

    let values = values_by_id(&target)?;
    assert_eq!(values.len(), 2);
    assert_eq!(values[&1], "one");
    assert_eq!(values[&2], "two-updated");
    Ok(())
}

#[test]
fn equal_sequence_is_resolved_by_arrival() -> Result<()> {
    let (same_batch, _) = merge_all(&flow(), &[events(&[1, 1], &[7, 7], &["first", "second"])])?;
    assert_eq!(values_by_id(&same_batch)?[&1], "second");

    let (across_batches, _) = merge_all(
        &flow(),
        &[events(&[1], &[7], &["first"]), events(&[1], &[7], &["second"])],
    )?;
    assert_eq!(values_by_id(&across_batches)?[&1], "second");
    Ok(())
}

#[test]
fn merged_sequence_never_regresses() -> Result<()> {
    let batches = [
        events(&[1, 2], &[3, 8], &["a3", "b8"]),
        events(&[1, 2], &[9, 4], &["a9", "b4"]),
        events(&[1, 2], &[6, 8], &["a6", "b8-again"]),
    ];

    let mut target = DataFrame::empty();
    let mut tombstones = Tombstones::default();
    let mut high_water: BTreeMap<i64, i64> = BTreeMap::new();

    for batch in &batches {
        target = apply_changes(&target, batch, &flow(), &mut tombstones)?.target;
        let ids = target.column("id")?.i64()?;
        let ts = target.column("ts")?.i64()?;
        for (id, ts) in ids.into_iter().zip(ts) {
            let (id, ts) = (id.unwrap(), ts.unwrap());
            let previous = high_water.insert(id, ts).unwrap_or(i64::MIN);
            assert!(ts >= previous, "key {id} regressed from {previous} to {ts}");
        }
    }

    let values = values_by_id(&target)?;
    assert_eq!(values[&1], "a9");
    assert_eq!(values[&2], "b8-again");
    Ok(())
}

#[test]
fn composite_keys_identify_entities() -> Result<()> {
    let flow = AutoCdcFlow::new("target", "source", ["region", "id"], "ts");
    let batch = df![
        "region" => ["eu", "us", "eu"],
        "id" => [1i64, 1, 1],
        "ts" => [1i64, 1, 2],
        "val" => ["eu-1", "us-1", "eu-2"],
    ]?;

    let (target, _) = merge_all(&flow, &[batch])?;
    assert_eq!(target.height(), 2);
    Ok(())
}

#[test]
fn deletes_remove_keys_and_block_older_upserts() -> Result<()> {
    let flow = flow().apply_as_deletes(DeleteCondition::equals("op", "DELETE"));
    let mut tombstones = Tombstones::default();

    let first = ops(
        &[1, 2],
        &[1, 1],
        &[Some("a"), Some("b")],
        &["UPSERT", "UPSERT"],
    );
    let mut target = apply_changes(&DataFrame::empty(), &first, &flow, &mut tombstones)?.target;

    let delete = ops(&[1], &[5], &[None], &["DELETE"]);
    let outcome = apply_changes(&target, &delete, &flow, &mut tombstones)?;
    assert_eq!(outcome.stats.deletes_applied, 1);
    target = outcome.target;
    assert_eq!(values_by_id(&target)?.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(tombstones.len(), 1);

    let late = ops(&[1], &[3], &[Some("stale")], &["UPSERT"]);
    let outcome = apply_changes(&target, &late, &flow, &mut tombstones)?;
    assert_eq!(outcome.stats.stale_ignored, 1);
    target = outcome.target;
    assert!(!values_by_id(&target)?.contains_key(&1));

    let newer = ops(&[1], &[7], &[Some("back")], &["UPSERT"]);
    target = apply_changes(&target, &newer, &flow, &mut tombstones)?.target;
    assert_eq!(values_by_id(&target)?[&1], "back");
    assert!(tombstones.is_empty());
    Ok(())
}

#[test]
fn except_column_list_drops_columns_from_target() -> Result<()> {
    let flow = flow()
        .apply_as_deletes(DeleteCondition::equals("op", "DELETE"))
        .except_columns(["op"]);
    let batch = ops(&[1, 2], &[1, 2], &[Some("a"), None], &["UPSERT", "DELETE"]);

    let (target, tombstones) = merge_all(&flow, &[batch])?;
    assert!(target.column("op").is_err());
    assert_eq!(target.height(), 1);
    assert_eq!(tombstones.len(), 1);
    Ok(())
}

#[test]
fn malformed_batches_are_rejected() -> Result<()> {
    let mut tombstones = Tombstones::default();
    let (target, _) = merge_all(&flow(), &[events(&[1], &[1], &["a"])])?;

    let missing_sequence = df!["id" => [1i64], "val" => ["x"]]?;
    assert!(matches!(
        apply_changes(&target, &missing_sequence, &flow(), &mut tombstones),
        Err(CdcError::MissingColumn { column }) if column == "ts"
    ));

    let retyped = df!["id" => [1i64], "ts" => [2i64], "val" => [3i32]]?;
    assert!(matches!(
        apply_changes(&target, &retyped, &flow(), &mut tombstones),
        Err(CdcError::TypeMismatch { column, .. }) if column == "val"
    ));

    let extra = df!["id" => [1i64], "ts" => [2i64], "val" => ["x"], "new_col" => [true]]?;
    assert!(matches!(
        apply_changes(&target, &extra, &flow(), &mut tombstones),
        Err(CdcError::UnexpectedColumn { column }) if column == "new_col"
    ));

    let null_sequence = df!["id" => [1i64, 2], "ts" => [Some(3i64), None], "val" => ["x", "y"]]?;
    assert!(matches!(
        apply_changes(&target, &null_sequence, &flow(), &mut tombstones),
        Err(CdcError::NullSequence { row: 1, .. })
    ));
    Ok(())
}

fn versions(df: &DataFrame) -> PolarsResult<Vec<(String, i64, Option<i64>)>> {
    let vals = df.column("val")?.str()?;
    let starts = df.column(START_AT_COLUMN)?.i64()?;
    let ends = df.column(END_AT_COLUMN)?.i64()?;
    let mut rows: Vec<(String, i64, Option<i64>)> = vals
        .into_iter()
        .zip(starts)
        .zip(ends)
        .map(|((val, start), end)| (val.unwrap_or_default().to_string(), start.unwrap(), end))
        .collect();
    rows.sort_by_key(|(_, start, _)| *start);
    Ok(rows)
}

#[test]
fn scd2_keeps_every_version_including_late_arrivals() -> Result<()> {
    let flow = flow().stored_as(ScdType::Type2);
    let (target, _) = merge_all(
        &flow,
        &[
            events(&[1, 1], &[1, 3], &["a", "b"]),
            events(&[1], &[2], &["c"]),
        ],
    )?;

    assert_eq!(
        versions(&target)?,
        vec![
            ("a".to_string(), 1, Some(2)),
            ("c".to_string(), 2, Some(3)),
            ("b".to_string(), 3, None),
        ]
    );
    assert_eq!(target.column(START_AT_COLUMN)?.dtype(), &DataType::Int64);
    Ok(())
}

#[test]
fn scd2_untracked_changes_update_in_place() -> Result<()> {
    let flow = flow()
        .stored_as(ScdType::Type2)
        .track_history_except(["plays"]);
    let first = df!["id" => [1i64], "ts" => [1i64], "val" => ["a"], "plays" => [1i64]]?;
    let second = df!["id" => [1i64], "ts" => [2i64], "val" => ["a"], "plays" => [5i64]]?;

    let (target, _) = merge_all(&flow, &[first, second])?;
    assert_eq!(target.height(), 1);
    assert_eq!(target.column("plays")?.i64()?.get(0), Some(5));
    assert_eq!(versions(&target)?, vec![("a".to_string(), 1, None)]);
    Ok(())
}

#[test]
fn scd2_deletes_close_versions_and_survive_late_data() -> Result<()> {
    let flow = flow()
        .stored_as(ScdType::Type2)
        .apply_as_deletes(DeleteCondition::equals("op", "DELETE"));

    let (target, _) = merge_all(
        &flow,
        &[
            ops(&[1, 1], &[1, 4], &[Some("a"), None], &["UPSERT", "DELETE"]),
            ops(&[1], &[6], &[Some("z")], &["UPSERT"]),
            ops(&[1], &[2], &[Some("q")], &["UPSERT"]),
        ],
    )?;

    assert_eq!(
        versions(&target)?,
        vec![
            ("a".to_string(), 1, Some(2)),
            ("q".to_string(), 2, Some(4)),
            ("z".to_string(), 6, None),
        ]
    );
    Ok(())
}

fn deleting(flow: AutoCdcFlow) -> AutoCdcFlow {
    flow.apply_as_deletes(DeleteCondition::equals("op", "DELETE"))
}

#[test]
fn delete_and_upsert_at_equal_sequence_follow_arrival() -> Result<()> {
    let flow = deleting(flow());

    let (deleted, tombstones) = merge_all(
        &flow,
        &[ops(&[1, 1], &[5, 5], &[Some("a"), None], &["UPSERT", "DELETE"])],
    )?;
    assert_eq!(deleted.height(), 0);
    assert_eq!(tombstones.len(), 1);

    let (kept, tombstones) = merge_all(
        &flow,
        &[ops(&[1, 1], &[5, 5], &[None, Some("b")], &["DELETE", "UPSERT"])],
    )?;
    assert_eq!(values_by_id(&kept)?[&1], "b");
    assert!(tombstones.is_empty());

    let (deleted_later, _) = merge_all(
        &flow,
        &[
            ops(&[1], &[5], &[Some("a")], &["UPSERT"]),
            ops(&[1], &[5], &[None], &["DELETE"]),
        ],
    )?;
    assert_eq!(deleted_later.height(), 0);

    let (upserted_later, tombstones) = merge_all(
        &flow,
        &[
            ops(&[1], &[5], &[None], &["DELETE"]),
            ops(&[1], &[5], &[Some("c")], &["UPSERT"]),
        ],
    )?;
    assert_eq!(values_by_id(&upserted_later)?[&1], "c");
    assert!(tombstones.is_empty());
    Ok(())
}

#[test]
fn scd2_delete_at_a_version_start_removes_the_version() -> Result<()> {
    let flow = deleting(flow()).stored_as(ScdType::Type2);

    let (same_batch, _) = merge_all(
        &flow,
        &[ops(&[1, 1], &[5, 5], &[Some("a"), None], &["UPSERT", "DELETE"])],
    )?;
    assert_eq!(same_batch.height(), 0);

    let (later_batch, _) = merge_all(
        &flow,
        &[
            ops(&[1, 1], &[1, 5], &[Some("a"), Some("b")], &["UPSERT", "UPSERT"]),
            ops(&[1], &[5], &[None], &["DELETE"]),
        ],
    )?;
    assert_eq!(
        versions(&later_batch)?,
        vec![("a".to_string(), 1, Some(5))]
    );

    let (upsert_after_delete, _) = merge_all(
        &flow,
        &[
            ops(&[1, 1], &[5, 5], &[None, Some("b")], &["DELETE", "UPSERT"]),
            ops(&[2], &[1], &[Some("x")], &["UPSERT"]),
        ],
    )?;
    let history = versions(&upsert_after_delete)?;
    assert!(history.contains(&("b".to_string(), 5, None)));
    assert_eq!(history.len(), 2);
    Ok(())
}

fn version_bounds(df: &DataFrame) -> PolarsResult<Vec<(i64, Option<i64>)>> {
    let starts = df.column(START_AT_COLUMN)?.cast(&DataType::Int64)?;
    let ends = df.column(END_AT_COLUMN)?.cast(&DataType::Int64)?;
    let mut bounds: Vec<(i64, Option<i64>)> = starts
        .i64()?
        .into_iter()
        .zip(ends.i64()?)
        .map(|(start, end)| (start.unwrap(), end))
        .collect();
    bounds.sort();
    Ok(bounds)
}

fn scd2_over(sequence_type: DataType, cast_via: Option<DataType>) -> Result<DataFrame> {
    let retype = |df: DataFrame| -> PolarsResult<DataFrame> {
        let ts = match &cast_via {
            Some(via) => col("ts").cast(via.clone()).cast(sequence_type.clone()),
            None => col("ts").cast(sequence_type.clone()),
        };
        df.lazy().with_column(ts).collect()
    };
    let flow = flow().stored_as(ScdType::Type2);
    let (target, _) = merge_all(
        &flow,
        &[
            retype(events(&[1, 1], &[10, 30], &["a", "b"]))?,
            retype(events(&[1], &[20], &["c"]))?,
        ],
    )?;
    Ok(target)
}

#[test]
fn scd2_history_keeps_the_sequence_type() -> Result<()> {
    let expected = vec![(10, Some(20)), (20, Some(30)), (30, None)];

    for (sequence_type, cast_via) in [
        (DataType::Datetime(TimeUnit::Milliseconds, None), None),
        (DataType::Date, Some(DataType::Int32)),
        (DataType::UInt64, None),
    ] {
        let target = scd2_over(sequence_type.clone(), cast_via)?;
        assert_eq!(target.column(START_AT_COLUMN)?.dtype(), &sequence_type);
        assert_eq!(target.column(END_AT_COLUMN)?.dtype(), &sequence_type);
        assert_eq!(version_bounds(&target)?, expected);
    }
    Ok(())
}
