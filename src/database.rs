//! Task-scoped transactions.
//!
//! A [`Database`] remembers, per tokio task, the innermost [`QueryBlock`] opened
//! through it. [`Database::transaction`] either opens a new root block (own
//! connection and transaction) or nests a child block on the enclosing one,
//! and the ambient methods (`sql`, `execute`, `fetch`, ...) act on whichever
//! block is current. Tasks started with `tokio::spawn` begin with no current
//! block.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::Stream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::block::{BlockRef, BlockState, CommandStatus, QueryBlock, Transition};
use crate::error::SqlBlockError;
use crate::fragment::{Fragment, Scope};
#[cfg(any(test, feature = "test-utils-memory"))]
use crate::memory::MemoryPool;
use crate::pool::BlockPool;
use crate::results::{CustomDbRow, FromRow};
use crate::session::Session;

#[cfg(feature = "postgres")]
use crate::postgres::PgSettings;

tokio::task_local! {
    static ACTIVE_BLOCKS: HashMap<u64, BlockRef>;
}

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// How a scope attaches to the one around it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Open a new connection and transaction even inside another scope.
    pub renew: bool,
    /// Run without `BEGIN`/`COMMIT`; each statement commits on its own.
    pub autocommit: bool,
}

impl ScopeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn renew(mut self, renew: bool) -> Self {
        self.renew = renew;
        self
    }

    #[must_use]
    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }
}

struct DatabaseInner {
    id: u64,
    pool: BlockPool,
}

/// Entry point: a pool plus the task-local bookkeeping of active scopes.
///
/// Cheap to clone; clones share the same scopes.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Database {
    #[must_use]
    pub fn new(pool: impl Into<BlockPool>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                id: NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed),
                pool: pool.into(),
            }),
        }
    }

    /// Connect to PostgreSQL with a bb8 pool built from `settings`.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ConfigError` for invalid settings or
    /// `SqlBlockError::ConnectionError` if the pool cannot be created.
    #[cfg(feature = "postgres")]
    pub async fn connect(settings: &PgSettings) -> Result<Self, SqlBlockError> {
        Ok(Self::new(settings.build_pool().await?))
    }

    /// A database over an in-process pool of `max_size` connections.
    #[cfg(any(test, feature = "test-utils-memory"))]
    #[must_use]
    pub fn in_memory(max_size: usize) -> (Self, MemoryPool) {
        let pool = MemoryPool::new(max_size);
        (Self::new(pool.clone()), pool)
    }

    #[must_use]
    pub fn pool(&self) -> &BlockPool {
        &self.inner.pool
    }

    fn active_block(&self) -> Option<BlockRef> {
        ACTIVE_BLOCKS
            .try_with(|blocks| blocks.get(&self.inner.id).cloned())
            .ok()
            .flatten()
    }

    /// The innermost block of this task.
    ///
    /// Holding on to the handle past its scope keeps the connection checked
    /// out until the handle is dropped.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub fn current(&self) -> Result<BlockRef, SqlBlockError> {
        self.active_block().ok_or_else(|| {
            SqlBlockError::ScopeResolution(
                "this task is not inside a transaction scope of this database".to_string(),
            )
        })
    }

    /// Whether this task is inside a scope of this database.
    #[must_use]
    pub fn in_scope(&self) -> bool {
        self.active_block().is_some()
    }

    /// Run `body` inside a transaction scope.
    ///
    /// Outside any scope, or with [`ScopeOptions::renew`], a connection is
    /// acquired and (unless autocommit) a transaction begun; it commits when
    /// `body` returns `Ok` and rolls back when it returns `Err` or is
    /// cancelled. Inside a scope, `body` joins the enclosing transaction and
    /// only the outermost scope ends it.
    ///
    /// ```rust
    /// use sql_block::prelude::*;
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let (db, pool) = Database::in_memory(2);
    /// db.transaction(ScopeOptions::new(), async {
    ///     db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
    ///     db.execute(&Scope::new()).await?;
    ///     Ok::<_, SqlBlockError>(())
    /// })
    /// .await?;
    /// assert_eq!(pool.committed(), vec!["INSERT INTO t VALUES (1)"]);
    /// # Ok::<(), SqlBlockError>(())
    /// # }).unwrap();
    /// ```
    ///
    /// # Errors
    /// Returns the body's error unchanged after rolling back, or a
    /// `SqlBlockError` (converted into `E`) if acquiring, beginning or
    /// committing fails.
    pub async fn transaction<F, T, E>(&self, options: ScopeOptions, body: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<SqlBlockError>,
    {
        match self.active_block() {
            Some(parent) if !options.renew => self.run_nested(parent, options, body).await,
            enclosing => self.run_root(enclosing, options, body).await,
        }
    }

    /// Wrap `f` so every call runs inside a transaction scope.
    #[must_use]
    pub fn scoped<F>(&self, options: ScopeOptions, f: F) -> ScopedFn<F> {
        ScopedFn {
            db: self.clone(),
            options,
            f,
        }
    }

    async fn run_root<F, T, E>(
        &self,
        enclosing: Option<BlockRef>,
        options: ScopeOptions,
        body: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<SqlBlockError>,
    {
        let conn = self.inner.pool.acquire().await?;
        let connection = conn.id();
        debug!(connection, renew = enclosing.is_some(), "acquired connection");

        let session = Arc::new(Mutex::new(Session::new(conn)));
        if !options.autocommit {
            session.lock().await.begin().await?;
        }

        let mut block = QueryBlock::new(
            Arc::clone(&session),
            None,
            options.autocommit,
            self.inner.pool.placeholder_style(),
        );
        if let Some(enclosing) = enclosing {
            block = block.enclosed_by(enclosing);
        }
        let outcome = self.enter(Arc::new(Mutex::new(block)), body).await;

        let mut session = session.lock().await;
        match outcome {
            Ok(value) => {
                if !options.autocommit {
                    session.commit().await?;
                }
                debug!(connection, "scope committed");
                Ok(value)
            }
            Err(err) => {
                if !options.autocommit {
                    match session.rollback().await {
                        Ok(()) => debug!(connection, "scope rolled back"),
                        Err(rollback_err) => {
                            warn!(connection, error = %rollback_err, "rollback failed");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_nested<F, T, E>(
        &self,
        parent: BlockRef,
        options: ScopeOptions,
        body: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<SqlBlockError>,
    {
        let (session, depth, inherited_autocommit) = {
            let parent = parent.lock().await;
            (parent.session(), parent.depth(), parent.autocommit())
        };
        debug!(depth = depth + 1, "entering nested scope");
        let block = QueryBlock::new(
            session,
            Some((parent, depth)),
            options.autocommit || inherited_autocommit,
            self.inner.pool.placeholder_style(),
        );
        self.enter(Arc::new(Mutex::new(block)), body).await
    }

    async fn enter<F: Future>(&self, block: BlockRef, body: F) -> F::Output {
        let mut blocks = ACTIVE_BLOCKS
            .try_with(Clone::clone)
            .unwrap_or_default();
        blocks.insert(self.inner.id, block);
        ACTIVE_BLOCKS.scope(blocks, body).await
    }

    /// Append `fragment` to the current block.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub async fn join(&self, fragment: &Fragment) -> Result<Transition, SqlBlockError> {
        let block = self.current()?;
        let mut block = block.lock().await;
        Ok(block.join(fragment))
    }

    /// Parse `template` against `scope` and append it to the current block.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub async fn sql(&self, template: &str, scope: &Scope) -> Result<Transition, SqlBlockError> {
        self.join(&Fragment::parse(template, scope)).await
    }

    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope, otherwise
    /// see [`QueryBlock::execute`].
    pub async fn execute(&self, params: &Scope) -> Result<Option<CommandStatus>, SqlBlockError> {
        let block = self.current()?;
        let mut block = block.lock().await;
        block.execute(params).await
    }

    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope, otherwise
    /// see [`QueryBlock::execute_many`].
    pub async fn execute_many(
        &self,
        rows: &[Scope],
    ) -> Result<Option<CommandStatus>, SqlBlockError> {
        let block = self.current()?;
        let mut block = block.lock().await;
        block.execute_many(rows).await
    }

    /// Run the current block's statement and return its rows.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope, otherwise
    /// see [`QueryBlock::fetch`].
    pub async fn fetch(&self, params: &Scope) -> Result<Rows, SqlBlockError> {
        let block = self.current()?;
        block.lock().await.fetch(params).await?;
        Ok(Rows { block })
    }

    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope, otherwise
    /// see [`QueryBlock::fetch_first`].
    pub async fn fetch_first(&self, params: &Scope) -> Result<Option<CustomDbRow>, SqlBlockError> {
        let block = self.current()?;
        let mut block = block.lock().await;
        block.fetch_first(params).await
    }

    /// Iterate the current block, re-running its statement if it was
    /// exhausted.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub async fn rows(&self) -> Result<Rows, SqlBlockError> {
        let block = self.current()?;
        block.lock().await.rewind();
        Ok(Rows { block })
    }

    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope, or
    /// `SqlBlockError::ProtocolMisuse` as described on
    /// [`QueryBlock::next_buffered`]; also when the block is busy in another
    /// operation.
    pub fn next_buffered(&self) -> Result<Option<CustomDbRow>, SqlBlockError> {
        let block = self.current()?;
        let mut block = block.try_lock().map_err(|_| {
            SqlBlockError::ProtocolMisuse("the current block is in use".to_string())
        })?;
        block.next_buffered()
    }

    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub async fn status(&self) -> Result<Option<CommandStatus>, SqlBlockError> {
        let block = self.current()?;
        let block = block.lock().await;
        Ok(block.status())
    }

    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub async fn state(&self) -> Result<BlockState, SqlBlockError> {
        let block = self.current()?;
        let block = block.lock().await;
        Ok(block.state())
    }

    /// Identity of the connection the current scope runs on.
    ///
    /// # Errors
    /// Returns `SqlBlockError::ScopeResolution` outside any scope.
    pub async fn connection_id(&self) -> Result<u64, SqlBlockError> {
        let block = self.current()?;
        let session = block.lock().await.session();
        let id = session.lock().await.connection_id();
        id.ok_or_else(|| SqlBlockError::ConnectionError("connection already released".into()))
    }
}

/// A function whose calls each run in a transaction scope.
///
/// Returned by [`Database::scoped`]. The future `f` returns is polled inside
/// the scope.
pub struct ScopedFn<F> {
    db: Database,
    options: ScopeOptions,
    f: F,
}

impl<F> ScopedFn<F> {
    /// # Errors
    /// See [`Database::transaction`].
    pub async fn call<A, Fut, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlBlockError>,
    {
        self.db.transaction(self.options, (self.f)(arg)).await
    }

    #[must_use]
    pub fn options(&self) -> ScopeOptions {
        self.options
    }
}

/// Rows of one block, read asynchronously.
pub struct Rows {
    block: BlockRef,
}

impl Rows {
    /// # Errors
    /// See [`QueryBlock::next_row`].
    pub async fn next(&mut self) -> Result<Option<CustomDbRow>, SqlBlockError> {
        self.block.lock().await.next_row().await
    }

    /// Next row decoded as `T`.
    ///
    /// # Errors
    /// Propagates read and decode errors.
    pub async fn next_as<T: FromRow>(&mut self) -> Result<Option<T>, SqlBlockError> {
        match self.next().await? {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Stops at the first failing row.
    pub async fn collect(mut self) -> Result<Vec<CustomDbRow>, SqlBlockError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// # Errors
    /// Stops at the first failing or undecodable row.
    pub async fn collect_as<T: FromRow>(mut self) -> Result<Vec<T>, SqlBlockError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_as().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<CustomDbRow, SqlBlockError>> {
        futures_util::stream::unfold(Some(self), |rows| async move {
            let mut rows = rows?;
            match rows.next().await {
                Ok(Some(row)) => Some((Ok(row), Some(rows))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
