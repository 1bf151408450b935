use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};

use sql_block::prelude::*;
use sql_block::MemoryEvent;
use tokio::runtime::Runtime;

#[derive(Debug)]
enum AppError {
    Db(SqlBlockError),
    Rejected(&'static str),
}

impl From<SqlBlockError> for AppError {
    fn from(err: SqlBlockError) -> Self {
        AppError::Db(err)
    }
}

fn count(events: &[MemoryEvent], pred: impl Fn(&MemoryEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn failing_body_leaves_no_committed_effects() {
    let (db, pool) = Database::in_memory(2);

    let result = db
        .transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
            db.execute(&Scope::new()).await?;
            Err::<(), _>(AppError::Rejected("validation failed"))
        })
        .await;

    assert!(matches!(result, Err(AppError::Rejected("validation failed"))));
    assert!(pool.committed().is_empty());
    let events = pool.events();
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Rollback { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Commit { .. })), 0);
    assert!(matches!(events.last(), Some(MemoryEvent::Release { .. })));
}

#[tokio::test]
async fn completed_body_commits() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(2);

    let status = db
        .transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
            db.execute(&Scope::new()).await
        })
        .await?;

    assert_eq!(status.as_ref().map(|s| s.rows_affected), Some(1));
    assert_eq!(status.map(|s| s.to_string()), Some("INSERT 0 1".into()));
    assert_eq!(pool.committed(), vec!["INSERT INTO t VALUES (1)"]);
    let conn = pool.events()[0].connection();
    assert_eq!(
        pool.events(),
        vec![
            MemoryEvent::Acquire { conn },
            MemoryEvent::Begin { conn },
            MemoryEvent::Execute {
                conn,
                sql: "INSERT INTO t VALUES (1)".into(),
                params: vec![],
            },
            MemoryEvent::Commit { conn },
            MemoryEvent::Release { conn },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn nested_scope_shares_connection_and_renew_does_not() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(2);

    db.transaction(ScopeOptions::new(), async {
        let outer = db.connection_id().await?;

        let nested = db
            .transaction(ScopeOptions::new(), async { db.connection_id().await })
            .await?;
        assert_eq!(outer, nested);

        let renewed = db
            .transaction(ScopeOptions::new().renew(true), async {
                assert_eq!(pool.available(), 0);
                db.connection_id().await
            })
            .await?;
        assert_ne!(outer, renewed);

        // back on the outer block once the renewed scope has ended
        assert_eq!(db.connection_id().await?, outer);
        assert_eq!(pool.available(), 1);
        Ok::<_, SqlBlockError>(())
    })
    .await?;

    let events = pool.events();
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Acquire { .. })), 2);
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Begin { .. })), 2);
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Commit { .. })), 2);
    assert_eq!(pool.available(), 2);
    Ok(())
}

#[tokio::test]
async fn nested_scope_depth_and_parent() -> Result<(), SqlBlockError> {
    let (db, _pool) = Database::in_memory(1);

    db.transaction(ScopeOptions::new(), async {
        let root = db.current()?;
        assert!(root.lock().await.is_root());

        db.transaction(ScopeOptions::new(), async {
            let child = db.current()?;
            let child = child.lock().await;
            assert_eq!(child.depth(), 1);
            assert!(!child.is_root());
            assert!(std::sync::Arc::ptr_eq(
                child.parent().expect("child has a parent"),
                &root
            ));
            Ok::<_, SqlBlockError>(())
        })
        .await?;

        assert_eq!(db.current()?.lock().await.depth(), 0);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn renewed_scope_is_a_root_of_its_own() -> Result<(), SqlBlockError> {
    let (db, _pool) = Database::in_memory(2);

    db.transaction(ScopeOptions::new(), async {
        let outer = db.current()?;

        db.transaction(ScopeOptions::new().renew(true), async {
            let renewed = db.current()?;
            let renewed = renewed.lock().await;
            assert!(renewed.is_root());
            assert_eq!(renewed.depth(), 0);
            assert!(renewed.parent().is_none());
            assert!(std::sync::Arc::ptr_eq(
                renewed.enclosing().expect("renewed scope knows where it was opened"),
                &outer
            ));
            Ok::<_, SqlBlockError>(())
        })
        .await?;

        let outer = outer.lock().await;
        assert!(outer.enclosing().is_none());
        assert_eq!(outer.depth(), 0);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn nested_failure_does_not_end_the_transaction() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);

    db.transaction(ScopeOptions::new(), async {
        let inner = db
            .transaction(ScopeOptions::new(), async {
                db.sql("INSERT INTO audit VALUES ('attempt')", &Scope::new())
                    .await?;
                db.execute(&Scope::new()).await?;
                Err::<(), _>(AppError::Rejected("inner"))
            })
            .await;
        assert!(matches!(inner, Err(AppError::Rejected("inner"))));

        db.sql("INSERT INTO audit VALUES ('done')", &Scope::new())
            .await?;
        db.execute(&Scope::new()).await?;
        Ok::<_, AppError>(())
    })
    .await
    .map_err(|e| match e {
        AppError::Db(err) => err,
        AppError::Rejected(msg) => SqlBlockError::ExecutionError(msg.into()),
    })?;

    assert_eq!(
        pool.committed(),
        vec![
            "INSERT INTO audit VALUES ('attempt')",
            "INSERT INTO audit VALUES ('done')"
        ]
    );
    let events = pool.events();
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Rollback { .. })), 0);
    Ok(())
}

#[tokio::test]
async fn ambient_calls_outside_a_scope_fail() {
    let (db, pool) = Database::in_memory(1);

    assert!(!db.in_scope());
    assert!(matches!(
        db.sql("SELECT 1", &Scope::new()).await,
        Err(SqlBlockError::ScopeResolution(_))
    ));
    assert!(matches!(
        db.execute(&Scope::new()).await,
        Err(SqlBlockError::ScopeResolution(_))
    ));
    assert!(matches!(
        db.next_buffered(),
        Err(SqlBlockError::ScopeResolution(_))
    ));
    assert!(matches!(
        db.connection_id().await,
        Err(SqlBlockError::ScopeResolution(_))
    ));
    assert!(pool.events().is_empty());
}

#[tokio::test]
async fn databases_keep_separate_scopes() -> Result<(), SqlBlockError> {
    let (orders, orders_pool) = Database::in_memory(1);
    let (audit, audit_pool) = Database::in_memory(1);

    orders
        .transaction(ScopeOptions::new(), async {
            assert!(!audit.in_scope());
            assert!(matches!(
                audit.current(),
                Err(SqlBlockError::ScopeResolution(_))
            ));

            audit
                .transaction(ScopeOptions::new(), async {
                    assert!(orders.in_scope());
                    audit.sql("INSERT INTO audit VALUES (1)", &Scope::new()).await?;
                    audit.execute(&Scope::new()).await?;
                    Ok::<_, SqlBlockError>(())
                })
                .await?;

            orders.sql("INSERT INTO orders VALUES (1)", &Scope::new()).await?;
            orders.execute(&Scope::new()).await?;
            Ok::<_, SqlBlockError>(())
        })
        .await?;

    assert_eq!(orders_pool.committed(), vec!["INSERT INTO orders VALUES (1)"]);
    assert_eq!(audit_pool.committed(), vec!["INSERT INTO audit VALUES (1)"]);
    Ok(())
}

#[tokio::test]
async fn acquire_failure_skips_the_body() {
    let (db, pool) = Database::in_memory(1);
    pool.set_unavailable(true);
    let ran = AtomicBool::new(false);

    let result = db
        .transaction(ScopeOptions::new(), async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, SqlBlockError>(())
        })
        .await;

    assert!(matches!(result, Err(SqlBlockError::ConnectionError(_))));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn commit_failure_is_returned_and_rolled_back() {
    let (db, pool) = Database::in_memory(1);
    pool.fail_on("COMMIT");

    let result = db
        .transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
            db.execute(&Scope::new()).await?;
            Ok::<_, SqlBlockError>(())
        })
        .await;

    assert!(matches!(result, Err(SqlBlockError::ExecutionError(_))));
    assert!(pool.committed().is_empty());
    let events = pool.events();
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Rollback { .. })), 1);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn autocommit_scope_skips_transaction_control() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);

    db.transaction(ScopeOptions::new().autocommit(true), async {
        db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
        db.execute(&Scope::new()).await?;
        assert_eq!(pool.committed().len(), 1);

        db.transaction(ScopeOptions::new(), async {
            assert!(db.current()?.lock().await.autocommit());
            Ok::<_, SqlBlockError>(())
        })
        .await
    })
    .await?;

    let events = pool.events();
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Begin { .. })), 0);
    assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Commit { .. })), 0);
    Ok(())
}

#[test]
fn scoped_function_runs_each_call_in_its_own_transaction() -> Result<(), Box<dyn Error>> {
    let rt = Runtime::new()?;
    rt.block_on(async {
        let (db, pool) = Database::in_memory(2);
        let insert = db.scoped(ScopeOptions::new(), |sn: i64| {
            let db = db.clone();
            async move {
                db.sql("INSERT INTO t VALUES ({sn})", &scope!(sn)).await?;
                db.execute(&Scope::new()).await
            }
        });
        assert_eq!(insert.options(), ScopeOptions::new());

        for sn in 1..=2 {
            let status: Option<CommandStatus> = insert.call(sn).await?;
            assert_eq!(status.map(|s| s.rows_affected), Some(1));
        }

        let events = pool.events();
        assert_eq!(count(&events, |e| matches!(e, MemoryEvent::Commit { .. })), 2);
        let params: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MemoryEvent::Execute { params, .. } => Some(params.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            params,
            vec![vec![RowValues::Int(1)], vec![RowValues::Int(2)]]
        );
        Ok::<(), Box<dyn Error>>(())
    })
}
