#[cfg(feature = "postgres")]
use crate::postgres::connection::{self as pg, PgPooled};

use super::cursor::RowCursor;
use crate::error::SqlBlockError;
#[cfg(any(test, feature = "test-utils-memory"))]
use crate::memory::MemoryConnection;
use crate::results::{CustomDbRow, ResultSet, RowShape};
use crate::types::RowValues;

/// A connection checked out of a [`BlockPool`](super::BlockPool).
///
/// Dropping it returns it to the pool.
pub enum PoolConnection {
    #[cfg(feature = "postgres")]
    Postgres(PgPooled),
    #[cfg(any(test, feature = "test-utils-memory"))]
    Memory(MemoryConnection),
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => f.debug_tuple("Postgres").field(&conn.id()).finish(),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => f.debug_tuple("Memory").field(&conn.id()).finish(),
        }
    }
}

/// Backend handle of a prepared statement.
enum PreparedHandle {
    #[cfg(feature = "postgres")]
    Postgres(tokio_postgres::Statement),
    #[cfg(any(test, feature = "test-utils-memory"))]
    Memory,
}

/// A statement prepared on one connection, with the row shape it produces.
pub struct PreparedStatement {
    sql: String,
    shape: RowShape,
    handle: PreparedHandle,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("columns", &self.shape.columns())
            .finish_non_exhaustive()
    }
}

impl PreparedStatement {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn shape(&self) -> &RowShape {
        &self.shape
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        self.shape.columns()
    }
}

fn mismatched() -> SqlBlockError {
    SqlBlockError::ExecutionError(
        "prepared statement belongs to a different backend".to_string(),
    )
}

impl PoolConnection {
    /// Process-local identity of the underlying connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.id(),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.id(),
        }
    }

    /// # Errors
    /// Returns the backend error if `BEGIN` fails.
    pub async fn begin(&mut self) -> Result<(), SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::simple_execute(conn, "BEGIN").await.map(|_| ()),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.begin(),
        }
    }

    /// # Errors
    /// Returns the backend error if `COMMIT` fails.
    pub async fn commit(&mut self) -> Result<(), SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::simple_execute(conn, "COMMIT").await.map(|_| ()),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.commit(),
        }
    }

    /// # Errors
    /// Returns the backend error if `ROLLBACK` fails.
    pub async fn rollback(&mut self) -> Result<(), SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::simple_execute(conn, "ROLLBACK").await.map(|_| ()),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.rollback(),
        }
    }

    /// Roll back and release without an async context to await in.
    pub fn rollback_detached(self) {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::rollback_detached(conn),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.rollback_detached(),
        }
    }

    /// Simple-protocol execution; `sql` may hold several commands.
    ///
    /// # Errors
    /// Returns the backend error of the failing command.
    pub async fn batch_execute(&mut self, sql: &str) -> Result<u64, SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::simple_execute(conn, sql).await,
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.batch_execute(sql),
        }
    }

    /// # Errors
    /// Returns the backend error if the command fails.
    pub async fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<u64, SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::execute(conn, sql, params).await,
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.execute(sql, params),
        }
    }

    /// # Errors
    /// Returns the backend error if the statement cannot be prepared.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement, SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => {
                let (stmt, shape) = pg::prepare(conn, sql).await?;
                Ok(PreparedStatement {
                    sql: sql.to_string(),
                    shape,
                    handle: PreparedHandle::Postgres(stmt),
                })
            }
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => Ok(PreparedStatement {
                sql: sql.to_string(),
                shape: conn.prepare(sql)?,
                handle: PreparedHandle::Memory,
            }),
        }
    }

    /// # Errors
    /// Returns the backend error if execution fails.
    pub async fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[RowValues],
    ) -> Result<u64, SqlBlockError> {
        match (self, &stmt.handle) {
            #[cfg(feature = "postgres")]
            (Self::Postgres(conn), PreparedHandle::Postgres(handle)) => {
                pg::execute_prepared(conn, handle, params).await
            }
            #[cfg(any(test, feature = "test-utils-memory"))]
            (Self::Memory(conn), PreparedHandle::Memory) => conn.execute(&stmt.sql, params),
            #[allow(unreachable_patterns)]
            _ => Err(mismatched()),
        }
    }

    /// Materialize every row.
    ///
    /// # Errors
    /// Returns the backend error if the query fails.
    pub async fn fetch_all(
        &mut self,
        stmt: &PreparedStatement,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBlockError> {
        match (self, &stmt.handle) {
            #[cfg(feature = "postgres")]
            (Self::Postgres(conn), PreparedHandle::Postgres(handle)) => {
                pg::fetch_all(conn, handle, params).await
            }
            #[cfg(any(test, feature = "test-utils-memory"))]
            (Self::Memory(conn), PreparedHandle::Memory) => conn.fetch_all(&stmt.sql, params),
            #[allow(unreachable_patterns)]
            _ => Err(mismatched()),
        }
    }

    /// # Errors
    /// Returns the backend error if the query fails.
    pub async fn fetch_row(
        &mut self,
        stmt: &PreparedStatement,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SqlBlockError> {
        match (self, &stmt.handle) {
            #[cfg(feature = "postgres")]
            (Self::Postgres(conn), PreparedHandle::Postgres(handle)) => {
                pg::fetch_row(conn, handle, &stmt.shape, params).await
            }
            #[cfg(any(test, feature = "test-utils-memory"))]
            (Self::Memory(conn), PreparedHandle::Memory) => conn.fetch_row(&stmt.sql, params),
            #[allow(unreachable_patterns)]
            _ => Err(mismatched()),
        }
    }

    /// Declare a server-side cursor for `stmt`. Requires an open transaction.
    ///
    /// # Errors
    /// Returns the backend error if the cursor cannot be declared.
    pub async fn open_cursor(
        &mut self,
        stmt: &PreparedStatement,
        params: &[RowValues],
    ) -> Result<RowCursor, SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::open_cursor(conn, &stmt.sql, &stmt.shape, params).await,
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.open_cursor(&stmt.sql, &stmt.shape, params),
        }
    }

    /// Refill `cursor` from the server when its local batch ran out.
    ///
    /// # Errors
    /// Returns the backend error if the fetch fails.
    pub async fn fetch_more(&mut self, cursor: &mut RowCursor) -> Result<(), SqlBlockError> {
        if !cursor.needs_fetch() {
            return Ok(());
        }
        let RowCursor::Portal(portal) = cursor else {
            return Ok(());
        };
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => pg::fetch_portal(conn, portal).await,
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(conn) => conn.fetch_portal(portal),
        }
    }
}
