use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SqlBlockError;
use crate::types::RowValues;

use super::extract::{FromRow, FromRowValue};

/// Column layout shared by every row a statement produces.
///
/// Built once per prepared statement from its result metadata, so two
/// statements (or two runs of the same text) may yield differently shaped rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowShape {
    columns: Arc<Vec<String>>,
    index: Arc<HashMap<String, usize>>,
}

impl RowShape {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        // first occurrence wins for duplicated column names
        let mut index = HashMap::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }
        Self {
            columns: Arc::new(columns),
            index: Arc::new(index),
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Wrap `values` into a row of this shape.
    #[must_use]
    pub fn row(&self, values: Vec<RowValues>) -> CustomDbRow {
        CustomDbRow {
            column_names: Arc::clone(&self.columns),
            rows: values,
            column_index_cache: Arc::clone(&self.index),
        }
    }
}

/// A row from a query result
///
/// This struct represents a single row from a database query result,
/// with access to both the column names and the values.
#[derive(Debug, Clone)]
pub struct CustomDbRow {
    /// The column names for this row (shared across all rows in a result set)
    pub column_names: Arc<Vec<String>>,
    /// The values for this row
    pub rows: Vec<RowValues>,
    // Internal cache for faster column lookups (to avoid repeated string comparisons)
    #[doc(hidden)]
    pub(crate) column_index_cache: Arc<HashMap<String, usize>>,
}

impl PartialEq for CustomDbRow {
    fn eq(&self, other: &Self) -> bool {
        self.column_names == other.column_names && self.rows == other.rows
    }
}

impl CustomDbRow {
    /// Create a new database row
    ///
    /// # Arguments
    ///
    /// * `column_names` - The column names
    /// * `rows` - The values for this row
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, rows: Vec<RowValues>) -> Self {
        RowShape::new(column_names.as_ref().clone()).row(rows)
    }

    /// Get the index of a column by name
    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        if let Some(&idx) = self.column_index_cache.get(column_name) {
            return Some(idx);
        }

        self.column_names.iter().position(|col| col == column_name)
    }

    /// Get a value from the row by column name
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.get_column_index(column_name)
            .and_then(|idx| self.rows.get(idx))
    }

    /// Get a value from the row by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.rows.get(index)
    }

    /// Typed lookup by column name.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ParameterError` if the column is missing or its
    /// value does not convert to `T`.
    pub fn try_get<T: FromRowValue>(&self, column_name: &str) -> Result<T, SqlBlockError> {
        let value = self.get(column_name).ok_or_else(|| {
            SqlBlockError::ParameterError(format!("no column named '{column_name}'"))
        })?;
        T::from_row_value(value).ok_or_else(|| {
            SqlBlockError::ParameterError(format!(
                "column '{column_name}' holds {} which cannot convert to {}",
                value.type_name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Decode the whole row, e.g. into a tuple matched by position.
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use sql_block::prelude::*;
    ///
    /// let row = CustomDbRow::new(
    ///     Arc::new(vec!["a".into(), "b".into()]),
    ///     vec![RowValues::Int(101), RowValues::Text("one".into())],
    /// );
    /// let (a, b): (i64, String) = row.decode()?;
    /// assert_eq!((a, b.as_str()), (101, "one"));
    /// # Ok::<(), SqlBlockError>(())
    /// ```
    ///
    /// # Errors
    /// Propagates the decoder's error.
    pub fn decode<T: FromRow>(&self) -> Result<T, SqlBlockError> {
        T::from_row(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
