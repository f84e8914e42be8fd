use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScalarError {
    #[error("column '{column}' has type {dtype}, which cannot be used for sequencing")]
    UnorderedType { column: String, dtype: String },
    #[error(transparent)]
    Polars(#[from] PolarsError),
}

/// `f64` with a total order so it can take part in keys and sequence comparisons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TotalF64(pub f64);

impl PartialEq for TotalF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for TotalF64 {}

impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for TotalF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A single cell value lifted out of a polars column.
///
/// Values taken from one column always share a variant (or are `Null`), so the derived
/// ordering is the natural ordering of that column's physical type. Temporal columns are
/// carried as their physical integer representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(TotalF64),
    Str(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

/// Composite key built from the key columns of one row, in declaration order.
pub type RowKey = Vec<Scalar>;

enum Physical {
    Bool,
    Int,
    UInt,
    Float,
    Str,
}

fn physical_of(dtype: &DataType) -> Option<Physical> {
    if dtype.is_bool() {
        Some(Physical::Bool)
    } else if dtype.is_unsigned_integer() {
        Some(Physical::UInt)
    } else if dtype.is_signed_integer() || dtype.is_temporal() {
        Some(Physical::Int)
    } else if dtype.is_float() {
        Some(Physical::Float)
    } else if dtype.is_string() {
        Some(Physical::Str)
    } else {
        None
    }
}

fn typed_scalars(series: &Series, physical: Physical) -> PolarsResult<Vec<Scalar>> {
    let values = match physical {
        Physical::Bool => series
            .bool()?
            .into_iter()
            .map(|v| v.map_or(Scalar::Null, Scalar::Bool))
            .collect(),
        Physical::Int => series
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|v| v.map_or(Scalar::Null, Scalar::Int))
            .collect(),
        Physical::UInt => series
            .cast(&DataType::UInt64)?
            .u64()?
            .into_iter()
            .map(|v| v.map_or(Scalar::Null, Scalar::UInt))
            .collect(),
        Physical::Float => series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| v.map_or(Scalar::Null, |f| Scalar::Float(TotalF64(f))))
            .collect(),
        Physical::Str => series
            .str()?
            .into_iter()
            .map(|v| v.map_or(Scalar::Null, |s| Scalar::Str(s.to_string())))
            .collect(),
    };
    Ok(values)
}

/// Lifts every value of `column` into a [`Scalar`].
///
/// Columns without a scalar physical type (lists, structs, ...) fall back to their rendered
/// text, which is enough for equality checks but carries no meaningful ordering.
pub fn column_scalars(df: &DataFrame, column: &str) -> PolarsResult<Vec<Scalar>> {
    let series = df.column(column)?.as_materialized_series();
    match physical_of(series.dtype()) {
        Some(physical) => typed_scalars(series, physical),
        None => {
            let mut values = Vec::with_capacity(series.len());
            for idx in 0..series.len() {
                let value = series.get(idx)?;
                if matches!(value, AnyValue::Null) {
                    values.push(Scalar::Null);
                } else {
                    values.push(Scalar::Str(value.to_string()));
                }
            }
            Ok(values)
        }
    }
}

/// Like [`column_scalars`] but only accepts columns whose values are totally ordered.
pub fn sequence_scalars(df: &DataFrame, column: &str) -> Result<Vec<Scalar>, ScalarError> {
    let series = df.column(column)?.as_materialized_series();
    let physical = physical_of(series.dtype()).ok_or_else(|| ScalarError::UnorderedType {
        column: column.to_string(),
        dtype: series.dtype().to_string(),
    })?;
    Ok(typed_scalars(series, physical)?)
}

/// Builds the composite key of every row from the given key columns.
pub fn row_keys(df: &DataFrame, keys: &[String]) -> PolarsResult<Vec<RowKey>> {
    let mut per_column = Vec::with_capacity(keys.len());
    for key in keys {
        per_column.push(column_scalars(df, key)?);
    }

    let mut rows: Vec<RowKey> = (0..df.height())
        .map(|_| Vec::with_capacity(keys.len()))
        .collect();
    for values in per_column {
        for (row, value) in rows.iter_mut().zip(values) {
            row.push(value);
        }
    }
    Ok(rows)
}

/// Rebuilds a series of `dtype` from scalars previously lifted out of a column of that type.
pub fn scalars_to_series(name: &str, values: &[Scalar], dtype: &DataType) -> PolarsResult<Series> {
    let physical = physical_of(dtype).ok_or_else(|| {
        PolarsError::ComputeError(format!("cannot rebuild column {name} of type {dtype}").into())
    })?;

    let series = match physical {
        Physical::Bool => Series::new(
            name.into(),
            values
                .iter()
                .map(|v| match v {
                    Scalar::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<Option<bool>>>(),
        ),
        Physical::Int => Series::new(
            name.into(),
            values
                .iter()
                .map(|v| match v {
                    Scalar::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<Option<i64>>>(),
        ),
        Physical::UInt => Series::new(
            name.into(),
            values
                .iter()
                .map(|v| match v {
                    Scalar::UInt(u) => Some(*u),
                    _ => None,
                })
                .collect::<Vec<Option<u64>>>(),
        ),
        Physical::Float => Series::new(
            name.into(),
            values
                .iter()
                .map(|v| match v {
                    Scalar::Float(f) => Some(f.0),
                    _ => None,
                })
                .collect::<Vec<Option<f64>>>(),
        ),
        Physical::Str => Series::new(
            name.into(),
            values
                .iter()
                .map(|v| match v {
                    Scalar::Str(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<Vec<Option<&str>>>(),
        ),
    };

    // Date is stored as Int32, so narrow to the physical type before restoring the logical one.
    series.cast(&dtype.to_physical())?.cast(dtype)
}
