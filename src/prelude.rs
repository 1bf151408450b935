//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and macros
//! to make it easier to get started with the library.

pub use crate::block::{BlockState, CommandStatus, Transition};
pub use crate::database::{Database, Rows, ScopeOptions};
pub use crate::error::{EvalError, SqlBlockError};
pub use crate::fragment::{Binding, Fragment, Piece, Scope, Statement};
pub use crate::results::{CustomDbRow, FromRow, FromRowValue, ResultSet};
pub use crate::types::{PlaceholderStyle, RowValues};
pub use crate::{scope, sql};

#[cfg(feature = "postgres")]
pub use crate::postgres::PgSettings;
