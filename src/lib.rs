//! Parameterized SQL assembled from templates, run inside task-scoped,
//! nestable transactions.
//!
//! Templates capture values from an explicit [`Scope`] when parsed
//! ([`sql!`] and [`scope!`] build the scope from local variables). Fragments
//! compose with `+` and [`Fragment::join`] and compile to positional markers
//! plus an ordered value list. A [`Database`] keeps the current query block of
//! each tokio task, so code running under [`Database::transaction`] can
//! append SQL and read rows without passing a connection around.

#![forbid(unsafe_code)]

pub mod block;
pub mod database;
pub mod error;
pub mod fragment;
#[cfg(any(test, feature = "test-utils-memory"))]
pub mod memory;
pub mod pool;
pub mod prelude;
pub mod results;
pub mod session;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "test-utils-postgres")]
pub mod test_utils;

#[cfg(not(any(test, feature = "postgres", feature = "test-utils-memory")))]
compile_error!("enable a backend: the `postgres` feature or `test-utils-memory`");

pub use block::{BlockRef, BlockState, CommandStatus, QueryBlock, Transition};
pub use database::{Database, Rows, ScopeOptions, ScopedFn};
pub use error::{EvalError, SqlBlockError};
pub use fragment::{BatchStatement, Binding, Fragment, Piece, Placeholder, Scope, Segment, Statement};
#[cfg(any(test, feature = "test-utils-memory"))]
pub use memory::{MemoryEvent, MemoryPool};
pub use pool::{BlockPool, Portal, PoolConnection, PreparedStatement, RowCursor};
pub use results::{CustomDbRow, FromRow, FromRowValue, ResultSet, RowShape};
pub use types::{PlaceholderStyle, RowValues};

#[cfg(feature = "postgres")]
pub use postgres::PgSettings;
