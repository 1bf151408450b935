use crate::types::RowValues;

use super::row::{CustomDbRow, RowShape};

/// A fully materialized query result.
///
/// Produced when rows are fetched eagerly (autocommit blocks, which cannot
/// hold a cursor open) and by the in-memory backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// The rows returned by the query
    pub results: Vec<CustomDbRow>,
    /// The number of rows affected (for DML statements)
    pub rows_affected: usize,
    shape: RowShape,
}

impl ResultSet {
    /// Create a new result set for `shape` with a known capacity
    #[must_use]
    pub fn with_capacity(shape: RowShape, capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            rows_affected: 0,
            shape,
        }
    }

    /// Build a result set from column names and row values.
    #[must_use]
    pub fn from_rows(columns: &[&str], rows: Vec<Vec<RowValues>>) -> ResultSet {
        let shape = RowShape::new(columns.iter().map(|c| (*c).to_string()).collect());
        let mut result_set = ResultSet::with_capacity(shape, rows.len());
        for row in rows {
            result_set.add_row_values(row);
        }
        result_set
    }

    #[must_use]
    pub fn shape(&self) -> &RowShape {
        &self.shape
    }

    /// Get the column names for this result set
    #[must_use]
    pub fn get_column_names(&self) -> &[String] {
        self.shape.columns()
    }

    /// Add a row to the result set
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        self.results.push(self.shape.row(row_values));
        self.rows_affected += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl IntoIterator for ResultSet {
    type Item = CustomDbRow;
    type IntoIter = std::vec::IntoIter<CustomDbRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
