use std::pin::pin;

use bb8::PooledConnection;
use futures_util::TryStreamExt;
use tokio_postgres::{SimpleQueryMessage, Statement};
use tracing::{debug, warn};

use crate::error::SqlBlockError;
use crate::pool::{CURSOR_BATCH, Portal, RowCursor};
use crate::results::{CustomDbRow, ResultSet, RowShape};
use crate::types::RowValues;

use super::params::Params;
use super::query::{build_result_set, extract_row, statement_shape};
use super::PgManager;

pub type PgPooled = PooledConnection<'static, PgManager>;

/// Run `sql` through the simple query protocol.
///
/// Several `;`-separated commands may be sent at once; their affected row
/// counts are summed.
///
/// # Errors
/// Returns the driver error of the first failing command.
pub async fn simple_execute(conn: &PgPooled, sql: &str) -> Result<u64, SqlBlockError> {
    let messages = conn.client().simple_query(sql).await?;
    let mut total = 0;
    for message in messages {
        if let SimpleQueryMessage::CommandComplete(count) = message {
            total += count;
        }
    }
    Ok(total)
}

/// # Errors
/// Returns the driver error if the command fails.
pub async fn execute(
    conn: &PgPooled,
    sql: &str,
    params: &[RowValues],
) -> Result<u64, SqlBlockError> {
    let converted = Params::convert(params);
    Ok(conn.client().execute(sql, converted.as_refs()).await?)
}

/// # Errors
/// Returns the driver error if the server rejects the statement.
pub async fn prepare(conn: &PgPooled, sql: &str) -> Result<(Statement, RowShape), SqlBlockError> {
    let stmt = conn.client().prepare(sql).await?;
    let shape = statement_shape(&stmt);
    Ok((stmt, shape))
}

/// # Errors
/// Returns the driver error if execution fails.
pub async fn execute_prepared(
    conn: &PgPooled,
    stmt: &Statement,
    params: &[RowValues],
) -> Result<u64, SqlBlockError> {
    let converted = Params::convert(params);
    Ok(conn.client().execute(stmt, converted.as_refs()).await?)
}

/// # Errors
/// Returns the driver error if the query fails or a row cannot be decoded.
pub async fn fetch_all(
    conn: &PgPooled,
    stmt: &Statement,
    params: &[RowValues],
) -> Result<ResultSet, SqlBlockError> {
    let converted = Params::convert(params);
    let rows = conn.client().query(stmt, converted.as_refs()).await?;
    build_result_set(stmt, &rows)
}

/// First row only; the rest of the result is discarded.
///
/// # Errors
/// Returns the driver error if the query fails or the row cannot be decoded.
pub async fn fetch_row(
    conn: &PgPooled,
    stmt: &Statement,
    shape: &RowShape,
    params: &[RowValues],
) -> Result<Option<CustomDbRow>, SqlBlockError> {
    let stream = conn.client().query_raw(stmt, params.iter()).await?;
    let mut stream = pin!(stream);
    match stream.try_next().await? {
        Some(row) => Ok(Some(extract_row(&row, shape)?)),
        None => Ok(None),
    }
}

/// Declare a server-side cursor over `sql`; rows are read with
/// [`fetch_portal`].
///
/// Must run inside a transaction. No response stays pending on the
/// connection afterwards.
///
/// # Errors
/// Returns the driver error if the cursor cannot be declared.
pub async fn open_cursor(
    conn: &PgPooled,
    sql: &str,
    shape: &RowShape,
    params: &[RowValues],
) -> Result<RowCursor, SqlBlockError> {
    let name = conn.next_cursor_name();
    let declare = format!("DECLARE {name} NO SCROLL CURSOR FOR {sql}");
    let converted = Params::convert(params);
    conn.client()
        .execute(declare.as_str(), converted.as_refs())
        .await?;
    debug!(connection = conn.id(), cursor = %name, "cursor declared");
    Ok(RowCursor::Portal(Portal::new(name, shape.clone())))
}

/// Read the next batch of `portal`, closing the cursor once it runs dry.
///
/// # Errors
/// Returns the driver error if the fetch fails or a row cannot be decoded.
pub async fn fetch_portal(conn: &PgPooled, portal: &mut Portal) -> Result<(), SqlBlockError> {
    let fetch = format!("FETCH FORWARD {CURSOR_BATCH} FROM {}", portal.name());
    let rows = conn.client().query(fetch.as_str(), &[]).await?;
    let done = rows.len() < CURSOR_BATCH;
    let decoded = rows
        .iter()
        .map(|row| extract_row(row, portal.shape()))
        .collect::<Result<Vec<_>, _>>()?;
    if done {
        conn.client()
            .batch_execute(&format!("CLOSE {}", portal.name()))
            .await?;
    }
    portal.fill(decoded, done);
    Ok(())
}

/// Roll back an unfinished transaction after its owner went away.
///
/// The connection goes back to the pool once the rollback has run.
pub fn rollback_detached(conn: PgPooled) {
    let id = conn.id();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match conn.client().simple_query("ROLLBACK").await {
                    Ok(_) => debug!(connection = id, "rolled back abandoned transaction"),
                    Err(e) => {
                        warn!(connection = id, error = %e, "rollback of abandoned transaction failed");
                    }
                }
            });
        }
        Err(_) => {
            warn!(
                connection = id,
                "no runtime available to roll back abandoned transaction"
            );
        }
    }
}
