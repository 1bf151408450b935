use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

use crate::error::SqlBlockError;
use crate::types::RowValues;

use super::row::CustomDbRow;

/// Conversion from a single row value.
pub trait FromRowValue: Sized {
    fn from_row_value(value: &RowValues) -> Option<Self>;
}

impl FromRowValue for RowValues {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromRowValue for i64 {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_int().copied()
    }
}

impl FromRowValue for i32 {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_int().and_then(|i| i32::try_from(*i).ok())
    }
}

impl FromRowValue for f64 {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_float()
    }
}

impl FromRowValue for bool {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_bool().copied()
    }
}

impl FromRowValue for String {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_text().map(str::to_string)
    }
}

impl FromRowValue for NaiveDateTime {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_timestamp()
    }
}

impl FromRowValue for JsonValue {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_json().cloned()
    }
}

impl FromRowValue for Vec<u8> {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        value.as_blob().map(<[u8]>::to_vec)
    }
}

impl<T: FromRowValue> FromRowValue for Option<T> {
    fn from_row_value(value: &RowValues) -> Option<Self> {
        if value.is_null() {
            Some(None)
        } else {
            T::from_row_value(value).map(Some)
        }
    }
}

/// Decode a whole row into a Rust value.
///
/// Tuples decode by column position; implement it by hand (usually with
/// [`CustomDbRow::try_get`]) to decode by column name.
pub trait FromRow: Sized {
    /// # Errors
    /// Returns `SqlBlockError::ParameterError` when a column is missing or has
    /// the wrong type.
    fn from_row(row: &CustomDbRow) -> Result<Self, SqlBlockError>;
}

fn positional<T: FromRowValue>(row: &CustomDbRow, idx: usize) -> Result<T, SqlBlockError> {
    let value = row.get_by_index(idx).ok_or_else(|| {
        SqlBlockError::ParameterError(format!(
            "row has {} columns, no column at position {idx}",
            row.len()
        ))
    })?;
    T::from_row_value(value).ok_or_else(|| {
        SqlBlockError::ParameterError(format!(
            "column {idx} holds {} which cannot convert to {}",
            value.type_name(),
            std::any::type_name::<T>()
        ))
    })
}

macro_rules! impl_tuple_from_row {
    ($($ty:ident => $idx:tt),+) => {
        impl<$($ty: FromRowValue),+> FromRow for ($($ty,)+) {
            fn from_row(row: &CustomDbRow) -> Result<Self, SqlBlockError> {
                Ok(($(positional::<$ty>(row, $idx)?,)+))
            }
        }
    };
}

impl_tuple_from_row!(A => 0);
impl_tuple_from_row!(A => 0, B => 1);
impl_tuple_from_row!(A => 0, B => 1, C => 2);
impl_tuple_from_row!(A => 0, B => 1, C => 2, D => 3);
impl_tuple_from_row!(A => 0, B => 1, C => 2, D => 3, E => 4);
impl_tuple_from_row!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::RowShape;

    fn sample() -> CustomDbRow {
        RowShape::new(vec!["a".into(), "b".into(), "c".into()]).row(vec![
            RowValues::Int(101),
            RowValues::Null,
            RowValues::Text("three".into()),
        ])
    }

    #[test]
    fn tuple_decoding_by_position() {
        let (a, b, c): (i64, Option<String>, String) = sample().decode().unwrap();
        assert_eq!(a, 101);
        assert_eq!(b, None);
        assert_eq!(c, "three");
    }

    #[test]
    fn wrong_type_is_reported() {
        let err = sample().decode::<(String,)>().unwrap_err();
        assert!(matches!(err, SqlBlockError::ParameterError(_)));
        assert!(sample().try_get::<i64>("c").is_err());
        assert!(sample().try_get::<i64>("zzz").is_err());
        assert_eq!(sample().try_get::<i32>("a").unwrap(), 101);
    }
}
