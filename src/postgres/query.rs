use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::{Row, Statement};

use crate::error::SqlBlockError;
use crate::results::{CustomDbRow, ResultSet, RowShape};
use crate::types::RowValues;

/// Row layout of a prepared statement.
#[must_use]
pub fn statement_shape(stmt: &Statement) -> RowShape {
    RowShape::new(
        stmt.columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect(),
    )
}

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
///
/// # Errors
/// Returns `SqlBlockError` if the column cannot be retrieved.
pub fn postgres_extract_value(row: &Row, idx: usize) -> Result<RowValues, SqlBlockError> {
    let type_info = row.columns()[idx].type_();

    match type_info.name() {
        "int2" => {
            let val: Option<i16> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))))
        }
        "int4" => {
            let val: Option<i32> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))))
        }
        "int8" => {
            let val: Option<i64> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Int))
        }
        "float4" => {
            let val: Option<f32> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Float(f64::from(v))))
        }
        "float8" => {
            let val: Option<f64> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Float))
        }
        "bool" => {
            let val: Option<bool> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Bool))
        }
        "timestamp" => {
            let val: Option<NaiveDateTime> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Timestamp))
        }
        "timestamptz" => {
            let val: Option<DateTime<Utc>> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, |v| RowValues::Timestamp(v.naive_utc())))
        }
        "date" => {
            let val: Option<NaiveDate> = row.try_get(idx)?;
            Ok(val
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map_or(RowValues::Null, RowValues::Timestamp))
        }
        "json" | "jsonb" => {
            let val: Option<Value> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::JSON))
        }
        "bytea" => {
            let val: Option<Vec<u8>> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Blob))
        }
        _ => {
            // text, varchar, name and anything else text-like
            let val: Option<String> = row.try_get(idx)?;
            Ok(val.map_or(RowValues::Null, RowValues::Text))
        }
    }
}

/// Decode every column of `row` into a row of `shape`.
///
/// # Errors
/// Returns `SqlBlockError` if any column cannot be decoded.
pub fn extract_row(row: &Row, shape: &RowShape) -> Result<CustomDbRow, SqlBlockError> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        values.push(postgres_extract_value(row, idx)?);
    }
    Ok(shape.row(values))
}

/// Build a result set from rows of a prepared statement.
///
/// # Errors
/// Returns errors from row value extraction.
pub fn build_result_set(stmt: &Statement, rows: &[Row]) -> Result<ResultSet, SqlBlockError> {
    let shape = statement_shape(stmt);
    let mut result_set = ResultSet::with_capacity(shape.clone(), rows.len());
    for row in rows {
        result_set.results.push(extract_row(row, &shape)?);
    }
    result_set.rows_affected = rows.len();
    Ok(result_set)
}
