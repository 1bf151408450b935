//! In-process backend.
//!
//! Statements are not interpreted. Queries answer with rows scripted per exact
//! SQL text, or echo their parameters back as a single row with columns
//! `p1..pN`. Every call is appended to an event journal so transaction
//! boundaries and connection identity can be asserted on.
//!
//! Cursors behave like Postgres cursors declared without `WITH HOLD`: they
//! exist only inside a transaction, hand out rows in batches of
//! [`CURSOR_BATCH`], and close when the transaction ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::SqlBlockError;
use crate::pool::{CURSOR_BATCH, Portal, RowCursor};
use crate::results::{CustomDbRow, ResultSet, RowShape};
use crate::types::{PlaceholderStyle, RowValues};

/// One observable backend interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEvent {
    Acquire { conn: u64 },
    Release { conn: u64 },
    Begin { conn: u64 },
    Commit { conn: u64 },
    Rollback { conn: u64 },
    Prepare { conn: u64, sql: String },
    Execute { conn: u64, sql: String, params: Vec<RowValues> },
    Query { conn: u64, sql: String, params: Vec<RowValues> },
    /// One batch read from an open cursor.
    Fetch { conn: u64, cursor: String, rows: usize },
}

impl MemoryEvent {
    #[must_use]
    pub fn connection(&self) -> u64 {
        match self {
            MemoryEvent::Acquire { conn }
            | MemoryEvent::Release { conn }
            | MemoryEvent::Begin { conn }
            | MemoryEvent::Commit { conn }
            | MemoryEvent::Rollback { conn }
            | MemoryEvent::Prepare { conn, .. }
            | MemoryEvent::Execute { conn, .. }
            | MemoryEvent::Query { conn, .. }
            | MemoryEvent::Fetch { conn, .. } => *conn,
        }
    }
}

/// Scripted answer for one SQL text.
#[derive(Debug, Clone)]
pub enum Response {
    Rows(ResultSet),
    Affected(u64),
}

struct Shared {
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    style: PlaceholderStyle,
    unavailable: AtomicBool,
    journal: Mutex<Vec<MemoryEvent>>,
    responses: Mutex<HashMap<String, Response>>,
    failures: Mutex<Vec<String>>,
    committed: Mutex<Vec<String>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn record(&self, event: MemoryEvent) {
        locked(&self.journal).push(event);
    }

    fn check(&self, sql: &str) -> Result<(), SqlBlockError> {
        let failures = locked(&self.failures);
        if let Some(pattern) = failures.iter().find(|p| sql.contains(p.as_str())) {
            return Err(SqlBlockError::ExecutionError(format!(
                "memory backend rejected statement matching '{pattern}': {sql}"
            )));
        }
        Ok(())
    }

    fn response(&self, sql: &str) -> Option<Response> {
        locked(&self.responses).get(sql).cloned()
    }
}

/// Pool of in-process connections, bounded like a real pool.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("available", &self.shared.permits.available_permits())
            .field("style", &self.shared.style)
            .finish_non_exhaustive()
    }
}

impl MemoryPool {
    /// A pool handing out at most `max_size` connections at a time.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self::with_style(max_size, PlaceholderStyle::Postgres)
    }

    #[must_use]
    pub fn with_style(max_size: usize, style: PlaceholderStyle) -> Self {
        Self {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(max_size)),
                next_id: AtomicU64::new(1),
                style,
                unavailable: AtomicBool::new(false),
                journal: Mutex::new(Vec::new()),
                responses: Mutex::new(HashMap::new()),
                failures: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn placeholder_style(&self) -> PlaceholderStyle {
        self.shared.style
    }

    /// Answer queries whose text is exactly `sql` with `rows`.
    pub fn respond_rows(&self, sql: impl Into<String>, rows: ResultSet) {
        locked(&self.shared.responses).insert(sql.into(), Response::Rows(rows));
    }

    /// Report `count` affected rows for commands whose text is exactly `sql`.
    pub fn respond_affected(&self, sql: impl Into<String>, count: u64) {
        locked(&self.shared.responses).insert(sql.into(), Response::Affected(count));
    }

    /// Fail every statement whose text contains `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        locked(&self.shared.failures).push(pattern.into());
    }

    /// Make subsequent `acquire` calls fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn events(&self) -> Vec<MemoryEvent> {
        locked(&self.shared.journal).clone()
    }

    pub fn clear_events(&self) {
        locked(&self.shared.journal).clear();
    }

    /// Commands that became durable: run outside a transaction or inside one
    /// that committed.
    #[must_use]
    pub fn committed(&self) -> Vec<String> {
        locked(&self.shared.committed).clone()
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Wait for a free connection.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ConnectionError` when the pool was marked
    /// unavailable or has been closed.
    pub async fn acquire(&self) -> Result<MemoryConnection, SqlBlockError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(SqlBlockError::ConnectionError(
                "memory pool is unavailable".to_string(),
            ));
        }
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|e| SqlBlockError::ConnectionError(format!("memory pool closed: {e}")))?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.record(MemoryEvent::Acquire { conn: id });
        Ok(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            in_transaction: false,
            pending: Vec::new(),
            cursors: HashMap::new(),
            next_cursor: 0,
            _permit: permit,
        })
    }
}

/// Highest marker index in `sql`, e.g. 3 for `$1 + $3`.
fn marker_count(sql: &str, style: PlaceholderStyle) -> usize {
    let sigil = match style {
        PlaceholderStyle::Postgres => '$',
        PlaceholderStyle::Sqlite => '?',
    };
    let mut max = 0;
    let mut chars = sql.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c != sigil {
            continue;
        }
        let digits: String = sql[idx + c.len_utf8()..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if let Ok(n) = digits.parse::<usize>() {
            max = max.max(n);
        }
        while chars.peek().is_some_and(|(_, d)| d.is_ascii_digit()) {
            chars.next();
        }
    }
    max
}

fn echo_shape(width: usize) -> RowShape {
    RowShape::new((1..=width).map(|i| format!("p{i}")).collect())
}

/// A checked-out in-process connection.
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    in_transaction: bool,
    pending: Vec<String>,
    cursors: HashMap<String, VecDeque<CustomDbRow>>,
    next_cursor: u64,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn begin(&mut self) -> Result<(), SqlBlockError> {
        if self.in_transaction {
            return Err(SqlBlockError::ExecutionError(
                "there is already a transaction in progress".to_string(),
            ));
        }
        self.shared.record(MemoryEvent::Begin { conn: self.id });
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), SqlBlockError> {
        self.shared.check("COMMIT")?;
        self.shared.record(MemoryEvent::Commit { conn: self.id });
        self.in_transaction = false;
        self.cursors.clear();
        locked(&self.shared.committed).append(&mut self.pending);
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), SqlBlockError> {
        self.shared.record(MemoryEvent::Rollback { conn: self.id });
        self.in_transaction = false;
        self.pending.clear();
        self.cursors.clear();
        self.shared.check("ROLLBACK")
    }

    fn apply(&mut self, sql: &str, params: &[RowValues]) -> Result<u64, SqlBlockError> {
        self.shared.record(MemoryEvent::Execute {
            conn: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        self.shared.check(sql)?;
        if self.in_transaction {
            self.pending.push(sql.to_string());
        } else {
            locked(&self.shared.committed).push(sql.to_string());
        }
        Ok(match self.shared.response(sql) {
            Some(Response::Affected(count)) => count,
            Some(Response::Rows(rows)) => rows.len() as u64,
            None => 1,
        })
    }

    /// Run each `;`-separated command in turn.
    pub fn batch_execute(&mut self, sql: &str) -> Result<u64, SqlBlockError> {
        let mut total = 0;
        for command in sql.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            total += self.apply(command, &[])?;
        }
        Ok(total)
    }

    pub fn execute(&mut self, sql: &str, params: &[RowValues]) -> Result<u64, SqlBlockError> {
        self.apply(sql, params)
    }

    /// Shape of the rows `sql` will produce.
    pub fn prepare(&mut self, sql: &str) -> Result<RowShape, SqlBlockError> {
        self.shared.record(MemoryEvent::Prepare {
            conn: self.id,
            sql: sql.to_string(),
        });
        Ok(match self.shared.response(sql) {
            Some(Response::Rows(rows)) => rows.shape().clone(),
            Some(Response::Affected(_)) => RowShape::default(),
            None => echo_shape(marker_count(sql, self.shared.style)),
        })
    }

    pub fn fetch_all(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlBlockError> {
        self.shared.record(MemoryEvent::Query {
            conn: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        self.shared.check(sql)?;
        Ok(match self.shared.response(sql) {
            Some(Response::Rows(rows)) => rows,
            Some(Response::Affected(_)) => ResultSet::default(),
            None if params.is_empty() => ResultSet::default(),
            None => {
                let mut rows = ResultSet::with_capacity(echo_shape(params.len()), 1);
                rows.add_row_values(params.to_vec());
                rows
            }
        })
    }

    pub fn fetch_row(
        &mut self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Option<CustomDbRow>, SqlBlockError> {
        Ok(self.fetch_all(sql, params)?.into_iter().next())
    }

    /// Declare a cursor over the answer to `sql`; rows stay on the
    /// connection until fetched.
    pub fn open_cursor(
        &mut self,
        sql: &str,
        shape: &RowShape,
        params: &[RowValues],
    ) -> Result<RowCursor, SqlBlockError> {
        if !self.in_transaction {
            return Err(SqlBlockError::ExecutionError(
                "DECLARE CURSOR can only be used in transaction blocks".to_string(),
            ));
        }
        let rows = self.fetch_all(sql, params)?;
        self.next_cursor += 1;
        let name = format!("sql_block_cursor_{}", self.next_cursor);
        self.cursors.insert(name.clone(), rows.into_iter().collect());
        Ok(RowCursor::Portal(Portal::new(name, shape.clone())))
    }

    /// Move the next batch of `portal` to the client.
    pub fn fetch_portal(&mut self, portal: &mut Portal) -> Result<(), SqlBlockError> {
        let text = format!("FETCH FORWARD {CURSOR_BATCH} FROM {}", portal.name());
        self.shared.check(&text)?;
        let Some(remaining) = self.cursors.get_mut(portal.name()) else {
            return Err(SqlBlockError::ExecutionError(format!(
                "cursor \"{}\" does not exist",
                portal.name()
            )));
        };
        let take = remaining.len().min(CURSOR_BATCH);
        let batch: Vec<CustomDbRow> = remaining.drain(..take).collect();
        let done = remaining.is_empty();
        if done {
            self.cursors.remove(portal.name());
        }
        self.shared.record(MemoryEvent::Fetch {
            conn: self.id,
            cursor: portal.name().to_string(),
            rows: batch.len(),
        });
        portal.fill(batch, done);
        Ok(())
    }

    /// Synchronous rollback used when a session is dropped mid-transaction.
    pub fn rollback_detached(mut self) {
        if let Err(e) = self.rollback() {
            tracing::warn!(connection = self.id, error = %e, "rollback of abandoned transaction failed");
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.record(MemoryEvent::Release { conn: self.id });
    }
}
