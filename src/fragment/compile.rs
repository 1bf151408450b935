use std::fmt;

use crate::error::SqlBlockError;
use crate::types::{PlaceholderStyle, RowValues};

use super::{Fragment, Placeholder, Scope, Segment};

/// A statement ready to send: SQL text with positional markers plus the values
/// for those markers, in marker order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    text: String,
    values: Vec<RowValues>,
}

impl Statement {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn values(&self) -> &[RowValues] {
        &self.values
    }

    /// An empty statement means there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    #[must_use]
    pub fn into_parts(self) -> (String, Vec<RowValues>) {
        (self.text, self.values)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One statement text executed once per parameter row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchStatement {
    text: String,
    rows: Vec<Vec<RowValues>>,
}

impl BatchStatement {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<RowValues>] {
        &self.rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl Placeholder {
    /// Value for this placeholder, re-evaluating against `params` when given.
    pub(crate) fn resolve(&self, params: Option<&Scope>) -> Result<RowValues, SqlBlockError> {
        let result = match params {
            Some(params) if !params.is_empty() => self.reevaluate(params),
            _ => self.value.clone(),
        };
        result.map_err(|source| SqlBlockError::PlaceholderEvaluation {
            expression: self.source.to_string(),
            source,
        })
    }
}

impl Fragment {
    fn layout(&self, style: PlaceholderStyle) -> (String, Vec<&Placeholder>) {
        let mut text = String::new();
        let mut placeholders = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => text.push_str(literal),
                Segment::Placeholder(placeholder) => {
                    placeholders.push(placeholder);
                    style.push_marker(&mut text, placeholders.len());
                }
            }
        }
        (text, placeholders)
    }

    /// Compile into a statement.
    ///
    /// A non-empty `params` mapping shadows the scope captured when each
    /// template was parsed; otherwise the parse-time values are used.
    ///
    /// ```rust
    /// use sql_block::prelude::*;
    ///
    /// let name = "abc";
    /// let age = 28;
    /// let fragment = sql!("[{name},{age},{age+10}];", name, age)
    ///     + sql!("<{name},{age}>", name, age);
    /// let stmt = fragment.compile(PlaceholderStyle::Postgres, None)?;
    /// assert_eq!(stmt.text(), "[$1,$2,$3];<$4,$5>");
    /// assert_eq!(
    ///     stmt.values(),
    ///     &[
    ///         RowValues::Text("abc".into()),
    ///         RowValues::Int(28),
    ///         RowValues::Int(38),
    ///         RowValues::Text("abc".into()),
    ///         RowValues::Int(28),
    ///     ]
    /// );
    /// # Ok::<(), SqlBlockError>(())
    /// ```
    ///
    /// # Errors
    /// Returns `SqlBlockError::PlaceholderEvaluation` for the first placeholder
    /// whose expression cannot be evaluated.
    pub fn compile(
        &self,
        style: PlaceholderStyle,
        params: Option<&Scope>,
    ) -> Result<Statement, SqlBlockError> {
        let (text, placeholders) = self.layout(style);
        if text.is_empty() {
            return Ok(Statement::default());
        }
        let values = placeholders
            .iter()
            .map(|placeholder| placeholder.resolve(params))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Statement { text, values })
    }

    /// Compile once per parameter mapping, sharing one marker layout.
    ///
    /// Batch text is terminated by `;`. An empty fragment compiles to an empty
    /// batch regardless of `rows`.
    ///
    /// # Errors
    /// Returns `SqlBlockError::PlaceholderEvaluation` if any row fails to evaluate.
    pub fn compile_many(
        &self,
        style: PlaceholderStyle,
        rows: &[Scope],
    ) -> Result<BatchStatement, SqlBlockError> {
        let (mut text, placeholders) = self.layout(style);
        if text.is_empty() {
            return Ok(BatchStatement::default());
        }
        let mut values = Vec::with_capacity(rows.len());
        for params in rows {
            values.push(
                placeholders
                    .iter()
                    .map(|placeholder| placeholder.resolve(Some(params)))
                    .collect::<Result<Vec<_>, _>>()?,
            );
        }
        text.push(';');
        Ok(BatchStatement { text, rows: values })
    }
}
