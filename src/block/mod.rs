//! Query blocks: an accumulating SQL buffer bound to a session, plus the
//! execute/fetch/iterate state machine over it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SqlBlockError;
use crate::fragment::{Fragment, Scope, Statement};
use crate::pool::{PoolConnection, RowCursor};
use crate::results::CustomDbRow;
use crate::session::Session;
use crate::types::{PlaceholderStyle, RowValues};

/// Shared handle to a block. Children keep their parent alive through it.
pub type BlockRef = Arc<Mutex<QueryBlock>>;

pub(crate) type SessionRef = Arc<Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Text is being accumulated; nothing has run yet.
    Pending,
    /// The statement ran; a cursor may be open.
    Executed,
    /// Every row has been read.
    Exhausted,
}

/// What happened to the buffer on [`QueryBlock::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The fragment extended the pending statement.
    Appended,
    /// The block had already run its statement, so a new one was started.
    Restarted {
        /// Template form of the statement that was dropped, if any.
        discarded: Option<String>,
        /// Whether rows of that statement were still unread.
        unread_rows: bool,
    },
}

/// Outcome of a command.
///
/// Displays like a server command tag: `INSERT 0 3`, `UPDATE 2`,
/// `CREATE TABLE`. For text holding several commands, `command` names the
/// last one and `rows_affected` is the total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Leading keyword(s) of the command, upper-cased.
    pub command: String,
    pub rows_affected: u64,
}

impl CommandStatus {
    #[must_use]
    pub fn new(sql: &str, rows_affected: u64) -> Self {
        Self {
            command: command_tag(sql),
            rows_affected,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command.as_str() {
            "INSERT" => write!(f, "INSERT 0 {}", self.rows_affected),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY" => {
                write!(f, "{} {}", self.command, self.rows_affected)
            }
            _ => f.write_str(&self.command),
        }
    }
}

/// Command keyword of the last non-empty `;`-separated command in `sql`.
fn command_tag(sql: &str) -> String {
    let last = sql
        .split(';')
        .map(str::trim)
        .rfind(|command| !command.is_empty())
        .unwrap_or_default();
    let mut words = last.split_whitespace().map(str::to_ascii_uppercase);
    let verb = words.next().unwrap_or_default();
    match verb.as_str() {
        "CREATE" | "DROP" | "ALTER" => match words.next() {
            Some(object) => format!("{verb} {object}"),
            None => verb,
        },
        _ => verb,
    }
}

/// A SQL buffer, its execution state, and the connection it runs on.
pub struct QueryBlock {
    buffer: Fragment,
    state: BlockState,
    session: SessionRef,
    parent: Option<BlockRef>,
    enclosing: Option<BlockRef>,
    autocommit: bool,
    style: PlaceholderStyle,
    depth: usize,
    compiled: Option<Statement>,
    cursor: Option<RowCursor>,
    status: Option<CommandStatus>,
}

impl fmt::Debug for QueryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBlock")
            .field("buffer", &self.buffer.to_string())
            .field("state", &self.state)
            .field("autocommit", &self.autocommit)
            .field("depth", &self.depth)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

fn log_failure(stmt: &Statement, err: &SqlBlockError) {
    debug!(sql = stmt.text(), params = ?stmt.values(), error = %err, "statement failed");
}

async fn open_rows(
    conn: &mut PoolConnection,
    stmt: &Statement,
    materialize: bool,
) -> Result<RowCursor, SqlBlockError> {
    let prepared = conn.prepare(stmt.text()).await?;
    if materialize {
        Ok(RowCursor::from(conn.fetch_all(&prepared, stmt.values()).await?))
    } else {
        conn.open_cursor(&prepared, stmt.values()).await
    }
}

async fn first_row(
    conn: &mut PoolConnection,
    stmt: &Statement,
) -> Result<Option<CustomDbRow>, SqlBlockError> {
    let prepared = conn.prepare(stmt.text()).await?;
    conn.fetch_row(&prepared, stmt.values()).await
}

impl QueryBlock {
    pub(crate) fn new(
        session: SessionRef,
        parent: Option<(BlockRef, usize)>,
        autocommit: bool,
        style: PlaceholderStyle,
    ) -> Self {
        let (parent, depth) = match parent {
            Some((block, parent_depth)) => (Some(block), parent_depth + 1),
            None => (None, 0),
        };
        Self {
            buffer: Fragment::new(),
            state: BlockState::Pending,
            session,
            parent,
            enclosing: None,
            autocommit,
            style,
            depth,
            compiled: None,
            cursor: None,
            status: None,
        }
    }

    /// Record the block that was current when this root was opened with
    /// `renew`. It shares nothing with this one.
    pub(crate) fn enclosed_by(mut self, block: BlockRef) -> Self {
        self.enclosing = Some(block);
        self
    }

    #[must_use]
    pub fn state(&self) -> BlockState {
        self.state
    }

    #[must_use]
    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Nesting level; 0 for a block that owns its connection.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn parent(&self) -> Option<&BlockRef> {
        self.parent.as_ref()
    }

    /// For a renewed root, the block it was opened from.
    #[must_use]
    pub fn enclosing(&self) -> Option<&BlockRef> {
        self.enclosing.as_ref()
    }

    pub(crate) fn session(&self) -> SessionRef {
        Arc::clone(&self.session)
    }

    /// Status of the last command run through [`execute`](Self::execute).
    #[must_use]
    pub fn status(&self) -> Option<CommandStatus> {
        self.status.clone()
    }

    #[must_use]
    pub fn buffer(&self) -> &Fragment {
        &self.buffer
    }

    /// Compile the buffer as it stands, without caching the result.
    ///
    /// # Errors
    /// Returns `SqlBlockError::PlaceholderEvaluation` for a failing placeholder.
    pub fn statement(&self) -> Result<Statement, SqlBlockError> {
        self.buffer.compile(self.style, None)
    }

    pub async fn connection_id(&self) -> Option<u64> {
        self.session.lock().await.connection_id()
    }

    /// Append `fragment` to the buffer.
    ///
    /// Once the block has run a statement (or compiled one for replay), the
    /// next join starts a new statement: the buffer, cached statement and any
    /// open cursor are dropped and the block returns to
    /// [`BlockState::Pending`]. The returned [`Transition`] reports this.
    pub fn join(&mut self, fragment: &Fragment) -> Transition {
        let transition = if self.state == BlockState::Pending && self.compiled.is_none() {
            Transition::Appended
        } else {
            let unread_rows = self.cursor.as_ref().is_some_and(RowCursor::has_unread);
            let discarded = (!self.buffer.is_empty()).then(|| self.buffer.to_string());
            if unread_rows {
                warn!(
                    statement = discarded.as_deref().unwrap_or_default(),
                    "new SQL joined while rows were unread; discarding them"
                );
            }
            self.buffer.clear();
            self.compiled = None;
            self.cursor = None;
            self.state = BlockState::Pending;
            Transition::Restarted {
                discarded,
                unread_rows,
            }
        };
        self.buffer.append(fragment, "");
        transition
    }

    /// Compile, reusing the cached statement when there are no parameters.
    fn compile(&mut self, params: &Scope) -> Result<Statement, SqlBlockError> {
        if params.is_empty() {
            if let Some(stmt) = &self.compiled {
                return Ok(stmt.clone());
            }
        }
        let stmt = self.buffer.compile(self.style, Some(params))?;
        if !stmt.is_empty() {
            self.compiled = Some(stmt.clone());
        }
        Ok(stmt)
    }

    /// Run the buffered statement as a command.
    ///
    /// Without parameters the text goes through the simple protocol, so it may
    /// hold several `;`-separated commands. Returns `None` for an empty buffer.
    ///
    /// # Errors
    /// Propagates compile and backend errors.
    pub async fn execute(&mut self, params: &Scope) -> Result<Option<CommandStatus>, SqlBlockError> {
        let stmt = self.compile(params)?;
        if stmt.is_empty() {
            return Ok(None);
        }
        debug!(sql = stmt.text(), params = stmt.values().len(), "execute");
        self.cursor = None;

        let mut session = self.session.lock().await;
        let conn = session.connection()?;
        let result = if stmt.values().is_empty() {
            conn.batch_execute(stmt.text()).await
        } else {
            conn.execute(stmt.text(), stmt.values()).await
        };
        drop(session);
        let rows_affected = result.inspect_err(|e| log_failure(&stmt, e))?;

        let status = CommandStatus::new(stmt.text(), rows_affected);
        self.state = BlockState::Executed;
        self.status = Some(status.clone());
        Ok(Some(status))
    }

    /// Run the buffered statement once per mapping in `rows`, prepared once.
    ///
    /// # Errors
    /// Propagates compile and backend errors; rows after a failure are not run.
    pub async fn execute_many(
        &mut self,
        rows: &[Scope],
    ) -> Result<Option<CommandStatus>, SqlBlockError> {
        let batch = self.buffer.compile_many(self.style, rows)?;
        if batch.is_empty() {
            return Ok(None);
        }
        debug!(sql = batch.text(), rows = batch.rows().len(), "execute many");
        self.cursor = None;

        let mut session = self.session.lock().await;
        let conn = session.connection()?;
        let prepared = conn.prepare(batch.text()).await?;
        let mut rows_affected = 0;
        for values in batch.rows() {
            rows_affected += conn
                .execute_prepared(&prepared, values)
                .await
                .inspect_err(|e| {
                    debug!(sql = batch.text(), params = ?values, error = %e, "statement failed");
                })?;
        }
        drop(session);

        let status = CommandStatus::new(batch.text(), rows_affected);
        self.state = BlockState::Executed;
        self.status = Some(status.clone());
        Ok(Some(status))
    }

    /// Run the buffered statement as a query and open a cursor over its rows.
    ///
    /// Inside a transaction the rows stay in a server-side cursor and arrive
    /// in batches as they are read, so nested scopes may use the connection
    /// between reads. In autocommit mode there is no transaction to keep a
    /// cursor open, so all rows are read up front. An empty buffer opens
    /// nothing.
    ///
    /// # Errors
    /// Propagates compile and backend errors.
    pub async fn fetch(&mut self, params: &Scope) -> Result<(), SqlBlockError> {
        let stmt = self.compile(params)?;
        self.cursor = None;
        if stmt.is_empty() {
            return Ok(());
        }
        debug!(sql = stmt.text(), params = stmt.values().len(), "fetch");

        let mut session = self.session.lock().await;
        let cursor = open_rows(session.connection()?, &stmt, self.autocommit)
            .await
            .inspect_err(|e| log_failure(&stmt, e))?;
        drop(session);

        self.cursor = Some(cursor);
        self.state = BlockState::Executed;
        Ok(())
    }

    /// Run the buffered statement and return only its first row.
    ///
    /// The block is [`BlockState::Exhausted`] afterwards.
    ///
    /// # Errors
    /// Propagates compile and backend errors.
    pub async fn fetch_first(&mut self, params: &Scope) -> Result<Option<CustomDbRow>, SqlBlockError> {
        let stmt = self.compile(params)?;
        self.cursor = None;
        if stmt.is_empty() {
            return Ok(None);
        }
        debug!(sql = stmt.text(), params = stmt.values().len(), "fetch first");

        let mut session = self.session.lock().await;
        let row = first_row(session.connection()?, &stmt)
            .await
            .inspect_err(|e| log_failure(&stmt, e))?;
        drop(session);

        self.state = BlockState::Exhausted;
        Ok(row)
    }

    /// Start (or restart) iteration: an exhausted block becomes pending again
    /// so the next read re-runs its statement.
    pub fn rewind(&mut self) {
        if self.state == BlockState::Exhausted {
            self.state = BlockState::Pending;
        }
    }

    /// Next row, running the statement first if it has not run yet.
    ///
    /// # Errors
    /// Propagates compile, backend and decoding errors.
    pub async fn next_row(&mut self) -> Result<Option<CustomDbRow>, SqlBlockError> {
        if self.state == BlockState::Pending {
            self.fetch(&Scope::new()).await?;
        }
        if self.state == BlockState::Exhausted {
            return Ok(None);
        }
        let row = match self.cursor.as_mut() {
            Some(cursor) => {
                if cursor.needs_fetch() {
                    let mut session = self.session.lock().await;
                    session.connection()?.fetch_more(cursor).await?;
                }
                cursor.pop()
            }
            None => None,
        };
        if row.is_none() {
            self.cursor = None;
            self.state = BlockState::Exhausted;
        }
        Ok(row)
    }

    /// Next row of an already materialized result, without suspending.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ProtocolMisuse` while SQL text is waiting to be
    /// run or when the rows come from a server-side cursor.
    pub fn next_buffered(&mut self) -> Result<Option<CustomDbRow>, SqlBlockError> {
        if self.state == BlockState::Pending && !self.buffer.is_empty() {
            return Err(SqlBlockError::ProtocolMisuse(
                "the block holds SQL that has not run yet; fetch it before reading synchronously"
                    .to_string(),
            ));
        }
        let row = match self.cursor.as_mut() {
            Some(cursor) => cursor.try_next_buffered()?,
            None => None,
        };
        if row.is_none() && self.state == BlockState::Executed {
            self.cursor = None;
            self.state = BlockState::Exhausted;
        }
        Ok(row)
    }

    /// Values bound by the cached statement, if one was compiled.
    #[must_use]
    pub fn compiled_values(&self) -> Option<&[RowValues]> {
        self.compiled.as_ref().map(Statement::values)
    }
}
