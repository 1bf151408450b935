use std::collections::VecDeque;

use crate::error::SqlBlockError;
use crate::results::{CustomDbRow, ResultSet, RowShape};

/// Rows requested from a server-side cursor per round trip.
pub const CURSOR_BATCH: usize = 100;

/// Source of rows for an executed query.
#[derive(Debug)]
pub enum RowCursor {
    /// Every row already fetched.
    Buffered(VecDeque<CustomDbRow>),
    /// A server-side cursor read in batches of [`CURSOR_BATCH`].
    Portal(Portal),
}

/// A cursor declared on the connection inside the open transaction.
///
/// Each batch is a complete request and response, so other statements may
/// run on the same connection between reads.
#[derive(Debug)]
pub struct Portal {
    name: String,
    shape: RowShape,
    batch: VecDeque<CustomDbRow>,
    done: bool,
}

impl Portal {
    pub(crate) fn new(name: String, shape: RowShape) -> Self {
        Self {
            name,
            shape,
            batch: VecDeque::new(),
            done: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn shape(&self) -> &RowShape {
        &self.shape
    }

    /// Whether the server has no rows left for this cursor.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn fill(&mut self, rows: impl IntoIterator<Item = CustomDbRow>, done: bool) {
        self.batch.extend(rows);
        self.done = done;
    }
}

impl From<ResultSet> for RowCursor {
    fn from(rows: ResultSet) -> Self {
        RowCursor::Buffered(rows.into_iter().collect())
    }
}

impl RowCursor {
    /// The local batch is empty but the server still holds rows.
    #[must_use]
    pub fn needs_fetch(&self) -> bool {
        match self {
            Self::Buffered(_) => false,
            Self::Portal(portal) => portal.batch.is_empty() && !portal.done,
        }
    }

    /// Pop the next row already transferred to the client.
    pub(crate) fn pop(&mut self) -> Option<CustomDbRow> {
        match self {
            Self::Buffered(rows) => rows.pop_front(),
            Self::Portal(portal) => portal.batch.pop_front(),
        }
    }

    /// Next row without suspending.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ProtocolMisuse` for a server-side cursor.
    pub fn try_next_buffered(&mut self) -> Result<Option<CustomDbRow>, SqlBlockError> {
        match self {
            Self::Buffered(rows) => Ok(rows.pop_front()),
            Self::Portal(_) => Err(SqlBlockError::ProtocolMisuse(
                "rows are read from an open cursor and must be fetched asynchronously"
                    .to_string(),
            )),
        }
    }

    /// Whether rows may remain unread.
    #[must_use]
    pub fn has_unread(&self) -> bool {
        match self {
            Self::Buffered(rows) => !rows.is_empty(),
            Self::Portal(portal) => !portal.batch.is_empty() || !portal.done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowValues;

    fn row(shape: &RowShape, n: i64) -> CustomDbRow {
        shape.row(vec![RowValues::Int(n)])
    }

    #[test]
    fn portal_reports_pending_batches() {
        let shape = RowShape::new(vec!["n".to_string()]);
        let mut cursor = RowCursor::Portal(Portal::new("c1".into(), shape.clone()));
        assert!(cursor.needs_fetch());
        assert!(cursor.has_unread());
        assert!(cursor.try_next_buffered().is_err());

        if let RowCursor::Portal(portal) = &mut cursor {
            portal.fill([row(&shape, 1)], true);
        }
        assert!(!cursor.needs_fetch());
        assert_eq!(cursor.pop().and_then(|r| r.get("n").cloned()), Some(RowValues::Int(1)));
        assert!(!cursor.has_unread());
        assert!(cursor.pop().is_none());
    }
}
