//! Integration tests for the `run_events` query module.

use fleet_db::models::Labels;
use fleet_db::queries::{events, runs, tasks};
use fleet_db::queries::events::NewRunEvent;
use fleet_test_utils::{create_test_db, drop_test_db};

async fn create_test_run(pool: &sqlx::PgPool) -> uuid::Uuid {
    let task = tasks::insert_task(pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(pool, &task).await.expect("insert run");
    run.id
}

#[tokio::test]
async fn insert_and_list_events_in_seq_order() {
    let (pool, db_name) = create_test_db().await;
    let run_id = create_test_run(&pool).await;

    for seq in 1..=3 {
        let new = NewRunEvent {
            run_id,
            seq,
            event_type: "message".to_string(),
            payload: serde_json::json!({"seq": seq}),
        };
        events::insert_run_event(&pool, &new)
            .await
            .expect("insert should succeed");
    }

    let listed = events::list_events_for_run(&pool, run_id)
        .await
        .expect("list should succeed");
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].seq, 1);
    assert_eq!(listed[2].seq, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_seq_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let run_id = create_test_run(&pool).await;

    let new = NewRunEvent {
        run_id,
        seq: 1,
        event_type: "run_started".to_string(),
        payload: serde_json::json!({}),
    };

    let first = events::insert_run_event(&pool, &new)
        .await
        .expect("first insert");
    assert!(first.is_some());

    let second = events::insert_run_event(&pool, &new)
        .await
        .expect("second insert should not error");
    assert!(second.is_none());

    let count = events::count_events_for_run(&pool, run_id)
        .await
        .expect("count");
    assert_eq!(count, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn max_seq_tracks_highest_recorded() {
    let (pool, db_name) = create_test_db().await;
    let run_id = create_test_run(&pool).await;

    assert_eq!(
        events::max_seq_for_run(&pool, run_id).await.expect("max"),
        None
    );

    for seq in [1, 2, 3] {
        events::insert_run_event(
            &pool,
            &NewRunEvent {
                run_id,
                seq,
                event_type: "message".to_string(),
                payload: serde_json::json!({}),
            },
        )
        .await
        .expect("insert");
    }

    assert_eq!(
        events::max_seq_for_run(&pool, run_id).await.expect("max"),
        Some(3)
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
