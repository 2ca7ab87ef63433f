//! Integration tests for the `runs` query module.

use fleet_db::models::{Labels, RunStatus};
use fleet_db::queries::{runs, tasks};
use fleet_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn insert_run_snapshots_task() {
    let (pool, db_name) = create_test_db().await;
    let mut labels = Labels::new();
    labels.insert("os".to_string(), "linux".to_string());
    let task = tasks::insert_task(&pool, "build", "do it", &labels, None)
        .await
        .expect("insert task");

    let run = runs::insert_run(&pool, &task).await.expect("insert run");
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.snapshot.task_id, task.id);
    assert_eq!(run.snapshot.labels, labels);
    assert_eq!(run.reclaim_count, 0);
    assert!(run.node_id.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn snapshot_survives_task_edit() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "build", "original prompt", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    // Task edited after the run was created.
    sqlx::query("UPDATE tasks SET prompt = 'changed prompt' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .expect("update task");

    let fetched_run = runs::get_run(&pool, run.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched_run.snapshot.prompt, "original prompt");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transition_rejects_mismatched_from_state() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    let affected = runs::transition_run_status(&pool, run.id, RunStatus::Running, RunStatus::Done)
        .await
        .expect("transition call should not error");
    assert_eq!(affected, 0);

    let fetched = runs::get_run(&pool, run.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.status, RunStatus::Queued);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn assign_run_sets_node() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    let affected = runs::assign_run(&pool, run.id, "node-1")
        .await
        .expect("assign");
    assert_eq!(affected, 1);

    let fetched = runs::get_run(&pool, run.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.status, RunStatus::Assigned);
    assert_eq!(fetched.node_id.as_deref(), Some("node-1"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn late_report_from_superseded_node_is_ignored() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    runs::assign_run(&pool, run.id, "node-a").await.expect("assign a");
    runs::transition_run_status(&pool, run.id, RunStatus::Assigned, RunStatus::Running)
        .await
        .expect("to running");

    // node-a's heartbeat lapses; reclaim moves the run back to queued and
    // it gets reassigned to node-b.
    runs::reclaim_run(&pool, run.id, RunStatus::Running)
        .await
        .expect("reclaim");
    runs::assign_run(&pool, run.id, "node-b").await.expect("assign b");
    runs::transition_run_status(&pool, run.id, RunStatus::Assigned, RunStatus::Running)
        .await
        .expect("to running again");

    // node-a's late failure report should not land because node_id no
    // longer matches.
    let affected = runs::transition_run_status_from_node(
        &pool,
        run.id,
        "node-a",
        RunStatus::Running,
        RunStatus::Failed,
    )
    .await
    .expect("from-node transition call should not error");
    assert_eq!(affected, 0);

    let fetched = runs::get_run(&pool, run.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.status, RunStatus::Running);
    assert_eq!(fetched.node_id.as_deref(), Some("node-b"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reclaim_requeues_until_limit_then_fails() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    runs::assign_run(&pool, run.id, "node-a").await.expect("assign");

    // First two reclaims requeue.
    for _ in 0..2 {
        let status = runs::reclaim_run(&pool, run.id, RunStatus::Assigned)
            .await
            .expect("reclaim")
            .expect("run should still exist");
        assert_eq!(status, RunStatus::Queued);
        runs::assign_run(&pool, run.id, "node-a").await.expect("reassign");
    }

    // Third reclaim exceeds the limit and fails the run permanently.
    let status = runs::reclaim_run(&pool, run.id, RunStatus::Assigned)
        .await
        .expect("reclaim")
        .expect("run should still exist");
    assert_eq!(status, RunStatus::Failed);

    let fetched = runs::get_run(&pool, run.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.status, RunStatus::Failed);
    assert_eq!(fetched.error.as_deref(), Some("exceeded reclaim limit"));
    assert_eq!(fetched.reclaim_count, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_run_from_queued() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    let affected = runs::cancel_run(&pool, run.id).await.expect("cancel");
    assert_eq!(affected, 1);

    let fetched = runs::get_run(&pool, run.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.status, RunStatus::Cancelled);
    assert!(fetched.finished_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_run_already_terminal_is_noop() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let run = runs::insert_run(&pool, &task).await.expect("insert run");

    runs::cancel_run(&pool, run.id).await.expect("cancel");
    let affected = runs::cancel_run(&pool, run.id).await.expect("cancel again");
    assert_eq!(affected, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_runs_by_status_filters() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, "t", "p", &Labels::new(), None)
        .await
        .expect("insert task");
    let a = runs::insert_run(&pool, &task).await.expect("insert run a");
    let b = runs::insert_run(&pool, &task).await.expect("insert run b");
    runs::assign_run(&pool, b.id, "node-1").await.expect("assign b");

    let queued = runs::list_runs_by_status(&pool, RunStatus::Queued)
        .await
        .expect("list queued");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, a.id);

    let assigned = runs::list_runs_by_status(&pool, RunStatus::Assigned)
        .await
        .expect("list assigned");
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].id, b.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}
