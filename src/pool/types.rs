#[cfg(feature = "postgres")]
use bb8::Pool;

#[cfg(feature = "postgres")]
use crate::postgres::PgManager;

use super::connection::PoolConnection;
use crate::error::SqlBlockError;
#[cfg(any(test, feature = "test-utils-memory"))]
use crate::memory::MemoryPool;
use crate::types::PlaceholderStyle;

/// Connection pool for database access
///
/// This enum wraps the different connection pool types for the
/// supported backends.
#[derive(Clone)]
pub enum BlockPool {
    /// `PostgreSQL` connection pool
    #[cfg(feature = "postgres")]
    Postgres(Pool<PgManager>),
    /// In-process pool
    #[cfg(any(test, feature = "test-utils-memory"))]
    Memory(MemoryPool),
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => f.debug_tuple("Postgres").field(&pool.state()).finish(),
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(pool) => f.debug_tuple("Memory").field(pool).finish(),
        }
    }
}

impl BlockPool {
    /// Marker dialect statements for this backend are compiled with.
    #[must_use]
    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => PlaceholderStyle::Postgres,
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(pool) => pool.placeholder_style(),
        }
    }

    /// Check a connection out of the pool, waiting while all are in use.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ConnectionError` if the pool cannot provide a
    /// connection.
    pub async fn acquire(&self) -> Result<PoolConnection, SqlBlockError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(|e| {
                    SqlBlockError::ConnectionError(format!("postgres checkout error: {e}"))
                })?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(any(test, feature = "test-utils-memory"))]
            Self::Memory(pool) => Ok(PoolConnection::Memory(pool.acquire().await?)),
        }
    }
}

#[cfg(any(test, feature = "test-utils-memory"))]
impl From<MemoryPool> for BlockPool {
    fn from(pool: MemoryPool) -> Self {
        BlockPool::Memory(pool)
    }
}

#[cfg(feature = "postgres")]
impl From<Pool<PgManager>> for BlockPool {
    fn from(pool: Pool<PgManager>) -> Self {
        BlockPool::Postgres(pool)
    }
}
