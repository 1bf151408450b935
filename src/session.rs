use tracing::{debug, warn};

use crate::error::SqlBlockError;
use crate::pool::PoolConnection;

/// Exclusive use of one pooled connection for the lifetime of a root scope.
///
/// Shared by every block nested in that scope. The connection goes back to the
/// pool when the session drops; a transaction still open at that point is
/// rolled back first.
pub struct Session {
    conn: Option<PoolConnection>,
    in_transaction: bool,
}

impl Session {
    pub(crate) fn new(conn: PoolConnection) -> Self {
        Self {
            conn: Some(conn),
            in_transaction: false,
        }
    }

    pub(crate) fn connection(&mut self) -> Result<&mut PoolConnection, SqlBlockError> {
        self.conn.as_mut().ok_or_else(|| {
            SqlBlockError::ConnectionError("session connection already released".into())
        })
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(PoolConnection::id)
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) async fn begin(&mut self) -> Result<(), SqlBlockError> {
        self.connection()?.begin().await?;
        self.in_transaction = true;
        Ok(())
    }

    /// On failure the transaction stays marked open, so drop still rolls back.
    pub(crate) async fn commit(&mut self) -> Result<(), SqlBlockError> {
        self.connection()?.commit().await?;
        self.in_transaction = false;
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> Result<(), SqlBlockError> {
        let result = self.connection()?.rollback().await;
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = conn.id();
        if self.in_transaction {
            warn!(connection = id, "scope ended with an open transaction, rolling back");
            conn.rollback_detached();
        } else {
            drop(conn);
        }
        debug!(connection = id, "released connection");
    }
}
