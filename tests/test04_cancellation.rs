use std::time::Duration;

use sql_block::MemoryEvent;
use sql_block::prelude::*;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn cancelled_scope_rolls_back_and_releases() {
    let (db, pool) = Database::in_memory(1);

    let outcome = timeout(
        Duration::from_millis(20),
        db.transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
            db.execute(&Scope::new()).await?;
            sleep(Duration::from_secs(30)).await;
            Ok::<_, SqlBlockError>(())
        }),
    )
    .await;

    assert!(outcome.is_err(), "body should have been cancelled");
    assert!(!db.in_scope());
    assert_eq!(pool.available(), 1);
    assert!(pool.committed().is_empty());

    let conn = pool.events()[0].connection();
    let tail: Vec<_> = pool.events().into_iter().rev().take(2).collect();
    assert_eq!(
        tail,
        vec![
            MemoryEvent::Release { conn },
            MemoryEvent::Rollback { conn }
        ]
    );
}

#[tokio::test]
async fn cancelled_nested_scope_restores_the_outer_block() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(2);

    db.transaction(ScopeOptions::new(), async {
        let outer = db.connection_id().await?;

        let cancelled = timeout(
            Duration::from_millis(20),
            db.transaction(ScopeOptions::new().renew(true), async {
                sleep(Duration::from_secs(30)).await;
                Ok::<_, SqlBlockError>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(db.connection_id().await?, outer);
        assert_eq!(pool.available(), 1);
        Ok::<_, SqlBlockError>(())
    })
    .await?;

    assert_eq!(pool.available(), 2);
    Ok(())
}

#[tokio::test]
async fn spawned_tasks_start_outside_any_scope() -> Result<(), Box<dyn std::error::Error>> {
    let (db, _pool) = Database::in_memory(2);

    db.transaction(ScopeOptions::new(), async {
        assert!(db.in_scope());
        let child_db = db.clone();
        let handle = tokio::spawn(async move {
            (
                child_db.in_scope(),
                matches!(child_db.current(), Err(SqlBlockError::ScopeResolution(_))),
            )
        });
        let (in_scope, unresolved) = handle
            .await
            .map_err(|e| SqlBlockError::ExecutionError(e.to_string()))?;
        assert!(!in_scope);
        assert!(unresolved);
        Ok::<_, SqlBlockError>(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_tasks_use_separate_connections() -> Result<(), Box<dyn std::error::Error>> {
    let (db, pool) = Database::in_memory(2);
    let (first_tx, first_rx) = oneshot::channel::<u64>();
    let (second_tx, second_rx) = oneshot::channel::<u64>();

    let run = |db: Database, sn: i64, report: oneshot::Sender<u64>, peer: oneshot::Receiver<u64>| async move {
        db.transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t VALUES ({sn})", &scope!(sn)).await?;
            db.execute(&Scope::new()).await?;
            let mine = db.connection_id().await?;
            let _ = report.send(mine);
            // hold the connection until the other task has reported its own
            let theirs = peer
                .await
                .map_err(|e| SqlBlockError::ExecutionError(e.to_string()))?;
            Ok::<_, SqlBlockError>((mine, theirs))
        })
        .await
    };

    let a = tokio::spawn(run(db.clone(), 1, first_tx, second_rx));
    let b = tokio::spawn(run(db.clone(), 2, second_tx, first_rx));
    let (mine_a, theirs_a) = a.await??;
    let (mine_b, theirs_b) = b.await??;

    assert_ne!(mine_a, mine_b);
    assert_eq!(mine_a, theirs_b);
    assert_eq!(mine_b, theirs_a);
    assert_eq!(pool.committed().len(), 2);
    assert_eq!(pool.available(), 2);
    Ok(())
}
