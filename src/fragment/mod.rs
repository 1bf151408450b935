// Fragment assembler - builds parameterized SQL from templates
//
// - template: splits template strings into literal runs and `{expr}` fields
// - expr: the placeholder expression language and its evaluator
// - scope: explicit variable scopes captured at parse time
// - compile: turns fragments into statements with positional markers

mod compile;
mod expr;
mod scope;
mod template;

use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

pub use compile::{BatchStatement, Statement};
pub use scope::{Binding, Scope};

use crate::error::EvalError;
use crate::types::RowValues;
use expr::Expr;
use scope::Layered;
use template::RawPart;

/// A template expression together with the scope it was captured from and
/// its parse-time value.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    source: Arc<str>,
    expr: Result<Arc<Expr>, EvalError>,
    scope: Arc<Scope>,
    value: Result<RowValues, EvalError>,
}

impl Placeholder {
    /// Expression text as written in the template.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Value captured at parse time, or the deferred evaluation failure.
    pub fn value(&self) -> Result<&RowValues, &EvalError> {
        self.value.as_ref()
    }

    fn invalid(source: &str, error: EvalError, scope: &Arc<Scope>) -> Self {
        Self {
            source: Arc::from(source),
            expr: Err(error.clone()),
            scope: Arc::clone(scope),
            value: Err(error),
        }
    }

    fn reevaluate(&self, params: &Scope) -> Result<RowValues, EvalError> {
        let expr = self.expr.as_ref().map_err(Clone::clone)?;
        let env = Layered {
            overrides: Some(params),
            captured: &self.scope,
        };
        match expr.eval(env)? {
            Binding::Value(value) => Ok(value),
            Binding::Fragment(_) => Err(EvalError::FragmentAsValue),
        }
    }
}

/// One piece of a fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Input accepted by [`Fragment::join`]: a bare template or a built fragment.
#[derive(Debug, Clone)]
pub enum Piece<'a> {
    Template(&'a str),
    Fragment(Fragment),
}

impl<'a> From<&'a str> for Piece<'a> {
    fn from(template: &'a str) -> Self {
        Piece::Template(template)
    }
}

impl From<Fragment> for Piece<'_> {
    fn from(fragment: Fragment) -> Self {
        Piece::Fragment(fragment)
    }
}

impl From<&Fragment> for Piece<'_> {
    fn from(fragment: &Fragment) -> Self {
        Piece::Fragment(fragment.clone())
    }
}

/// Partially built SQL: an ordered list of literal and placeholder segments.
///
/// Fragments are values. [`Fragment::add`] and the `+` operator build new
/// fragments; only a buffer owned by a query block is appended to in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    segments: Vec<Segment>,
}

impl Fragment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fragment holding `text` verbatim, braces included.
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            return Self::new();
        }
        Self {
            segments: vec![Segment::Literal(text)],
        }
    }

    /// Parse `template` against `scope`.
    ///
    /// Every `{expr}` is evaluated immediately. Failures are kept inside the
    /// placeholder and raised when the fragment is compiled, so a fragment
    /// built from an incomplete scope can still be assembled and completed by
    /// compile-time parameters. A name bound to a [`Fragment`] is spliced in.
    #[must_use]
    pub fn parse(template: &str, scope: &Scope) -> Self {
        let captured = Arc::new(scope.clone());
        let mut segments = Vec::new();

        for part in template::scan(template) {
            match part {
                RawPart::Literal(text) => segments.push(Segment::Literal(text)),
                RawPart::Invalid { source, reason } => segments.push(Segment::Placeholder(
                    Placeholder::invalid(source, EvalError::Syntax(reason.to_string()), &captured),
                )),
                RawPart::Field(source) => match expr::parse(source) {
                    Err(error) => segments.push(Segment::Placeholder(Placeholder::invalid(
                        source, error, &captured,
                    ))),
                    Ok(parsed) => match parsed.eval(Layered::captured(&captured)) {
                        Ok(Binding::Fragment(inner)) => segments.extend(inner.segments),
                        evaluated => segments.push(Segment::Placeholder(Placeholder {
                            source: Arc::from(source),
                            expr: Ok(Arc::new(parsed)),
                            scope: Arc::clone(&captured),
                            value: evaluated.and_then(|binding| match binding {
                                Binding::Value(value) => Ok(value),
                                Binding::Fragment(_) => Err(EvalError::FragmentAsValue),
                            }),
                        })),
                    },
                },
            }
        }

        Self { segments }
    }

    /// Concatenate templates and fragments, placing `separator` between
    /// consecutive non-empty members. Bare templates are parsed against `scope`.
    ///
    /// ```rust
    /// use sql_block::prelude::*;
    ///
    /// let id = 7;
    /// let cond = sql!("id = {id}", id);
    /// let scope = Scope::new();
    /// let where_clause = Fragment::join(
    ///     [Piece::from(cond), Piece::from(""), Piece::from("deleted IS NULL")],
    ///     " AND ",
    ///     &scope,
    /// );
    /// let stmt = where_clause.compile(PlaceholderStyle::Postgres, None)?;
    /// assert_eq!(stmt.text(), "id = $1 AND deleted IS NULL");
    /// # Ok::<(), SqlBlockError>(())
    /// ```
    #[must_use]
    pub fn join<'a, I>(parts: I, separator: &str, scope: &Scope) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Piece<'a>>,
    {
        let mut joined = Fragment::new();
        for part in parts {
            match part.into() {
                Piece::Template(template) => {
                    joined.append(&Fragment::parse(template, scope), separator);
                }
                Piece::Fragment(fragment) => joined.append(&fragment, separator),
            }
        }
        joined
    }

    /// Value concatenation; neither operand changes.
    #[must_use]
    pub fn add(&self, other: &Fragment) -> Fragment {
        let mut combined = self.clone();
        combined.append(other, "");
        combined
    }

    /// Append in place, inserting `separator` when both sides are non-empty.
    pub fn append(&mut self, other: &Fragment, separator: &str) {
        if other.is_empty() {
            return;
        }
        if !self.is_empty() {
            self.segments.push(Segment::Literal(separator.to_string()));
        }
        self.segments.extend(other.segments.iter().cloned());
    }

    pub(crate) fn clear(&mut self) {
        self.segments.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn placeholder_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Placeholder(_)))
            .count()
    }
}

impl Add for Fragment {
    type Output = Fragment;

    fn add(mut self, rhs: Fragment) -> Fragment {
        self.append(&rhs, "");
        self
    }
}

impl Add<&Fragment> for &Fragment {
    type Output = Fragment;

    fn add(self, rhs: &Fragment) -> Fragment {
        Fragment::add(self, rhs)
    }
}

impl AddAssign for Fragment {
    fn add_assign(&mut self, rhs: Fragment) {
        self.append(&rhs, "");
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => f.write_str(&text.replace('{', "{{").replace('}', "}}"))?,
                Segment::Placeholder(placeholder) => write!(f, "{{{}}}", placeholder.source)?,
            }
        }
        Ok(())
    }
}

/// Parse a template against a scope captured from the named locals.
///
/// `sql!(template)` uses an empty scope; `sql!(template, a, b = expr)` captures
/// like [`scope!`](crate::scope).
///
/// ```rust
/// use sql_block::prelude::*;
///
/// let offset = 0;
/// let limit = 1;
/// let paging = sql!("OFFSET {offset} LIMIT {limit}", offset, limit);
/// let query = sql!("SELECT sn FROM t {paging}", paging);
/// let stmt = query.compile(PlaceholderStyle::Postgres, None)?;
/// assert_eq!(stmt.text(), "SELECT sn FROM t OFFSET $1 LIMIT $2");
/// # Ok::<(), SqlBlockError>(())
/// ```
#[macro_export]
macro_rules! sql {
    ($template:expr $(,)?) => {
        $crate::Fragment::parse($template, &$crate::Scope::new())
    };
    ($template:expr, $($rest:tt)+) => {
        $crate::Fragment::parse($template, &$crate::scope!($($rest)+))
    };
}
