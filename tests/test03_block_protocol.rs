use std::error::Error;

use futures_util::TryStreamExt;
use sql_block::pool::CURSOR_BATCH;
use sql_block::prelude::*;
use sql_block::{MemoryEvent, MemoryPool};

fn numbers() -> ResultSet {
    ResultSet::from_rows(
        &["sn", "label"],
        vec![
            vec![RowValues::Int(1), RowValues::Text("one".into())],
            vec![RowValues::Int(2), RowValues::Text("two".into())],
            vec![RowValues::Int(3), RowValues::Text("three".into())],
        ],
    )
}

fn queries(pool: &MemoryPool) -> Vec<(String, Vec<RowValues>)> {
    pool.events()
        .into_iter()
        .filter_map(|e| match e {
            MemoryEvent::Query { sql, params, .. } => Some((sql, params)),
            _ => None,
        })
        .collect()
}

#[derive(Debug, PartialEq)]
struct Item {
    sn: i64,
    label: String,
}

impl FromRow for Item {
    fn from_row(row: &CustomDbRow) -> Result<Self, SqlBlockError> {
        Ok(Item {
            sn: row.try_get("sn")?,
            label: row.try_get("label")?,
        })
    }
}

#[tokio::test]
async fn joining_after_execute_starts_over() -> Result<(), SqlBlockError> {
    let (db, _pool) = Database::in_memory(1);

    db.transaction(ScopeOptions::new(), async {
        assert_eq!(db.sql("INSERT INTO t ", &Scope::new()).await?, Transition::Appended);
        assert_eq!(db.sql("VALUES (1)", &Scope::new()).await?, Transition::Appended);
        db.execute(&Scope::new()).await?;
        assert_eq!(db.state().await?, BlockState::Executed);

        let transition = db.sql("SELECT 2", &Scope::new()).await?;
        assert_eq!(
            transition,
            Transition::Restarted {
                discarded: Some("INSERT INTO t VALUES (1)".into()),
                unread_rows: false,
            }
        );
        assert_eq!(db.state().await?, BlockState::Pending);
        let block = db.current()?;
        assert_eq!(block.lock().await.statement()?.text(), "SELECT 2");
        Ok(())
    })
    .await
}

#[tokio::test]
async fn exhausted_rows_replay_the_statement() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);
    pool.respond_rows("SELECT sn, label FROM items", numbers());

    db.transaction(ScopeOptions::new(), async {
        db.sql("SELECT sn, label FROM items", &Scope::new()).await?;
        let first = db.rows().await?.collect().await?;
        assert_eq!(db.state().await?, BlockState::Exhausted);

        let second = db.rows().await?.collect().await?;
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        Ok::<_, SqlBlockError>(())
    })
    .await?;

    assert_eq!(queries(&pool).len(), 2);
    Ok(())
}

#[tokio::test]
async fn execute_many_prepares_once() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);

    let status = db
        .transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t (sn) VALUES ({sn})", &Scope::new())
                .await?;
            let rows: Vec<Scope> = (1..=3).map(|sn: i64| scope!(sn)).collect();
            db.execute_many(&rows).await
        })
        .await?;

    assert_eq!(
        status,
        Some(CommandStatus {
            command: "INSERT".into(),
            rows_affected: 3
        })
    );
    let events = pool.events();
    let prepared: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MemoryEvent::Prepare { sql, .. } => Some(sql.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(prepared, vec!["INSERT INTO t (sn) VALUES ($1);"]);
    let executed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MemoryEvent::Execute { params, .. } => Some(params.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        executed,
        vec![
            vec![RowValues::Int(1)],
            vec![RowValues::Int(2)],
            vec![RowValues::Int(3)],
        ]
    );
    Ok(())
}

#[tokio::test]
async fn execute_params_override_captured_values() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);
    let sn = 1;

    db.transaction(ScopeOptions::new(), async {
        db.sql("UPDATE t SET seen = true WHERE sn = {sn}", &scope!(sn))
            .await?;
        db.execute(&Scope::new()).await?;
        db.execute(&scope!(sn = 2)).await?;
        Ok::<_, SqlBlockError>(())
    })
    .await?;

    let params: Vec<_> = pool
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MemoryEvent::Execute { params, .. } => Some(params),
            _ => None,
        })
        .collect();
    assert_eq!(params, vec![vec![RowValues::Int(1)], vec![RowValues::Int(2)]]);
    Ok(())
}

#[tokio::test]
async fn parameterless_text_runs_every_command() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);

    db.transaction(ScopeOptions::new(), async {
        db.sql(
            "CREATE TABLE t (sn int); INSERT INTO t VALUES (1);",
            &Scope::new(),
        )
        .await?;
        let status = db.execute(&Scope::new()).await?;
        assert_eq!(status.as_ref().map(|s| s.rows_affected), Some(2));
        assert_eq!(db.status().await?, status);
        assert_eq!(status.map(|s| s.to_string()), Some("INSERT 0 2".into()));
        Ok::<_, SqlBlockError>(())
    })
    .await?;

    assert_eq!(
        pool.committed(),
        vec!["CREATE TABLE t (sn int)", "INSERT INTO t VALUES (1)"]
    );
    Ok(())
}

#[tokio::test]
async fn rows_decode_into_typed_values() -> Result<(), Box<dyn Error>> {
    let (db, pool) = Database::in_memory(1);
    pool.respond_rows("SELECT sn, label FROM items", numbers());

    db.transaction(ScopeOptions::new(), async {
        db.sql("SELECT sn, label FROM items", &Scope::new()).await?;
        let tuples: Vec<(i64, String)> = db.fetch(&Scope::new()).await?.collect_as().await?;
        assert_eq!(tuples[2], (3, "three".to_string()));

        let mut rows = db.rows().await?;
        let first: Option<Item> = rows.next_as().await?;
        assert_eq!(
            first,
            Some(Item {
                sn: 1,
                label: "one".into()
            })
        );

        let rest: Vec<Item> = rows.collect_as().await?;
        assert_eq!(
            rest.iter().map(|item| item.sn).collect::<Vec<_>>(),
            vec![2, 3]
        );
        Ok::<_, SqlBlockError>(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn rows_as_a_stream() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);
    pool.respond_rows("SELECT sn, label FROM items", numbers());

    let labels = db
        .transaction(ScopeOptions::new(), async {
            db.sql("SELECT sn, label FROM items", &Scope::new()).await?;
            let rows: Vec<CustomDbRow> = db
                .fetch(&Scope::new())
                .await?
                .into_stream()
                .try_collect()
                .await?;
            rows.iter()
                .map(|row| row.try_get::<String>("label"))
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

    assert_eq!(labels, vec!["one", "two", "three"]);
    Ok(())
}

#[tokio::test]
async fn fetch_first_returns_one_row() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);

    let row = db
        .transaction(ScopeOptions::new(), async {
            db.sql("SELECT {a}, {b}", &scope!(a = 1, b = "x")).await?;
            let row = db.fetch_first(&Scope::new()).await?;
            assert_eq!(db.state().await?, BlockState::Exhausted);
            Ok::<_, SqlBlockError>(row)
        })
        .await?
        .expect("echo row");

    assert_eq!(row.get("p1"), Some(&RowValues::Int(1)));
    assert_eq!(row.get("p2"), Some(&RowValues::Text("x".into())));
    assert_eq!(queries(&pool)[0].0, "SELECT $1, $2");
    Ok(())
}

#[tokio::test]
async fn placeholder_failure_rolls_back() {
    let (db, pool) = Database::in_memory(1);

    let result = db
        .transaction(ScopeOptions::new(), async {
            db.sql("INSERT INTO t VALUES (1)", &Scope::new()).await?;
            db.execute(&Scope::new()).await?;
            db.sql("INSERT INTO t VALUES ({missing})", &Scope::new())
                .await?;
            db.execute(&Scope::new()).await?;
            Ok::<_, SqlBlockError>(())
        })
        .await;

    match result {
        Err(SqlBlockError::PlaceholderEvaluation { expression, source }) => {
            assert_eq!(expression, "missing");
            assert_eq!(source, EvalError::UnresolvedName("missing".into()));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(pool.committed().is_empty());
    assert!(
        pool.events()
            .iter()
            .any(|e| matches!(e, MemoryEvent::Rollback { .. }))
    );
}

#[tokio::test]
async fn sqlite_style_markers() -> Result<(), SqlBlockError> {
    let pool = MemoryPool::with_style(1, PlaceholderStyle::Sqlite);
    let db = Database::new(pool.clone());
    let sn = 7;
    let label = "seven";

    db.transaction(ScopeOptions::new(), async {
        db.sql("INSERT INTO t VALUES ({sn}, {label})", &scope!(sn, label))
            .await?;
        db.execute(&Scope::new()).await
    })
    .await?;

    assert!(pool.events().contains(&MemoryEvent::Execute {
        conn: 1,
        sql: "INSERT INTO t VALUES (?1, ?2)".into(),
        params: vec![RowValues::Int(7), RowValues::Text("seven".into())],
    }));
    Ok(())
}

#[tokio::test]
async fn buffered_reads_in_autocommit() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);
    pool.respond_rows("SELECT sn, label FROM items", numbers());

    db.transaction(ScopeOptions::new().autocommit(true), async {
        db.sql("SELECT sn, label FROM items", &Scope::new()).await?;
        assert!(matches!(
            db.next_buffered(),
            Err(SqlBlockError::ProtocolMisuse(_))
        ));

        db.fetch(&Scope::new()).await?;
        let mut labels = Vec::new();
        while let Some(row) = db.next_buffered()? {
            labels.push(row.try_get::<String>("label")?);
        }
        assert_eq!(labels, vec!["one", "two", "three"]);
        assert_eq!(db.state().await?, BlockState::Exhausted);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn cursor_rows_refuse_synchronous_reads() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);
    pool.respond_rows("SELECT sn, label FROM items", numbers());

    db.transaction(ScopeOptions::new(), async {
        db.sql("SELECT sn, label FROM items", &Scope::new()).await?;
        let mut rows = db.fetch(&Scope::new()).await?;
        assert!(rows.next().await?.is_some());
        assert!(matches!(
            db.next_buffered(),
            Err(SqlBlockError::ProtocolMisuse(_))
        ));

        let transition = db.sql("SELECT 1", &Scope::new()).await?;
        assert!(matches!(
            transition,
            Transition::Restarted {
                unread_rows: true,
                ..
            }
        ));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn nested_scope_runs_between_cursor_reads() -> Result<(), SqlBlockError> {
    let (db, pool) = Database::in_memory(1);
    let total = CURSOR_BATCH + 20;
    let rows = (0..total as i64).map(|n| vec![RowValues::Int(n)]).collect();
    pool.respond_rows("SELECT n FROM big", ResultSet::from_rows(&["n"], rows));

    let seen = db
        .transaction(ScopeOptions::new(), async {
            let outer = db.connection_id().await?;
            db.sql("SELECT n FROM big", &Scope::new()).await?;
            let mut rows = db.fetch(&Scope::new()).await?;
            let mut seen = 0;
            while let Some(row) = rows.next().await? {
                let n: i64 = row.try_get("n")?;
                db.transaction(ScopeOptions::new(), async {
                    assert_eq!(db.connection_id().await?, outer);
                    db.sql("INSERT INTO audit VALUES ({n})", &scope!(n)).await?;
                    db.execute(&Scope::new()).await
                })
                .await?;
                seen += 1;
            }
            Ok::<_, SqlBlockError>(seen)
        })
        .await?;

    assert_eq!(seen, total);
    assert_eq!(pool.committed().len(), total);

    // the second batch was read after nested commands used the connection
    let events = pool.events();
    let first_insert = events
        .iter()
        .position(|e| matches!(e, MemoryEvent::Execute { .. }));
    let fetches: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, MemoryEvent::Fetch { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(fetches.len(), 2);
    assert!(first_insert.is_some_and(|i| i < fetches[1]));
    Ok(())
}
