//! End-to-end tests for the orchestrator loop: a due trigger firing and
//! completing, lease exclusion between two competing workers, retry with
//! backoff, handler timeout escalation, and orphan recovery on restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use orbit_core::clock::{Clock, FakeClock, SystemClock};
use orbit_core::handler::{Handler, HandlerFailure, HandlerOutcome, HandlerRegistry, RunView, TriggerView};
use orbit_core::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorResult};
use orbit_core::priority_queue::PriorityQueue;
use orbit_core::run_store;
use orbit_core::trigger_store::{self, NewTrigger};
use orbit_db::models::{RunStatus, TriggerKind, TriggerStatus};

use orbit_test_utils::{create_test_db, drop_test_db};

fn time_based_trigger(name: &str) -> NewTrigger {
    NewTrigger {
        name: name.to_string(),
        organization_id: "org-1".to_string(),
        created_by: "user-1".to_string(),
        kind: TriggerKind::TimeBased,
        status: TriggerStatus::Active,
        cron_expression: Some("* * * * *".to_string()),
        timezone: Some("UTC".to_string()),
        interval_seconds: None,
        event_types: None,
        dependency_trigger_ids: None,
        dependency_predicate: None,
        condition_expression: None,
        window_start: None,
        window_end: None,
        task_type: "test_handler".to_string(),
        task_config: json!({}),
        task_parameters: json!({}),
        priority: 0,
        max_concurrent_runs: 1,
        max_exec_seconds: 30,
        max_retries: 3,
        base_delay_seconds: 8,
        backoff_multiplier: 2.0,
        max_delay_seconds: Some(300),
        // Comfortably in the past relative to any clock snapshot taken
        // around trigger creation, so `fetch_due`/`refill` pick it up
        // regardless of the order callers capture `now()` in.
        next_fire_at: Some(Utc::now() - chrono::Duration::seconds(30)),
    }
}

struct AlwaysOkHandler;

#[async_trait]
impl Handler for AlwaysOkHandler {
    fn name(&self) -> &str {
        "test_handler"
    }

    async fn execute(&self, _trigger: &TriggerView, _run: &RunView, _cancel: CancellationToken) -> HandlerOutcome {
        HandlerOutcome::Ok(json!({"done": true}))
    }
}

/// Fails its first `fail_times` calls, then succeeds.
struct FlakyHandler {
    calls: AtomicUsize,
    fail_times: usize,
}

#[async_trait]
impl Handler for FlakyHandler {
    fn name(&self) -> &str {
        "test_handler"
    }

    async fn execute(&self, _trigger: &TriggerView, _run: &RunView, _cancel: CancellationToken) -> HandlerOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            HandlerOutcome::Err(HandlerFailure {
                kind: orbit_db::models::ErrorKind::HandlerError,
                message: "transient failure".to_string(),
                details: None,
            })
        } else {
            HandlerOutcome::Ok(json!({"recovered": true}))
        }
    }
}

struct NeverReturnsHandler;

#[async_trait]
impl Handler for NeverReturnsHandler {
    fn name(&self) -> &str {
        "test_handler"
    }

    async fn execute(&self, _trigger: &TriggerView, _run: &RunView, _cancel: CancellationToken) -> HandlerOutcome {
        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        HandlerOutcome::Ok(json!({}))
    }
}

/// Poll `check` every 20ms until it returns `Some`, or panic after `timeout`.
async fn poll_until<T, F, Fut>(timeout: StdDuration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn due_trigger_fires_and_run_completes() {
    let (pool, db_name) = create_test_db().await;
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(Utc::now()));

    let trigger = trigger_store::create(&pool, &time_based_trigger("nightly-sync")).await.unwrap();

    let queue = Arc::new(PriorityQueue::new(pool.clone(), 1, 10));
    queue.refill(clock.now()).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(AlwaysOkHandler);

    let config = OrchestratorConfig {
        tick_interval: StdDuration::from_millis(20),
        max_concurrent_runs_per_worker: 5,
        worker_id: "worker-1".to_string(),
        shutdown_grace: StdDuration::from_secs(2),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(pool.clone(), Arc::clone(&clock), Arc::clone(&queue), Arc::new(registry), config);

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    let trigger_id = trigger.id;
    let pool_clone = pool.clone();
    poll_until(StdDuration::from_secs(2), || {
        let pool = pool_clone.clone();
        async move {
            let runs = run_store::list_by_trigger(&pool, trigger_id, 1, 10).await.unwrap();
            runs.into_iter().find(|r| r.status == RunStatus::Completed)
        }
    })
    .await;

    cancel.cancel();
    let result = tokio::time::timeout(StdDuration::from_secs(3), run_handle)
        .await
        .expect("orchestrator should shut down within the grace period")
        .expect("orchestrator task should not panic")
        .expect("orchestrator loop should not error");
    assert_eq!(result, OrchestratorResult::Cancelled);

    let reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(reloaded.current_runs, 0, "lease and concurrency slot must be released after completion");
    assert_eq!(reloaded.success_runs, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn two_workers_racing_the_same_trigger_only_one_wins() {
    let (pool, db_name) = create_test_db().await;
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(Utc::now()));

    let trigger = trigger_store::create(&pool, &time_based_trigger("single-winner-job")).await.unwrap();

    let build = |worker_id: &str| {
        let queue = Arc::new(PriorityQueue::new(pool.clone(), 1, 10));
        let mut registry = HandlerRegistry::new();
        registry.register(AlwaysOkHandler);
        let config = OrchestratorConfig {
            tick_interval: StdDuration::from_millis(20),
            max_concurrent_runs_per_worker: 5,
            worker_id: worker_id.to_string(),
            shutdown_grace: StdDuration::from_secs(2),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(pool.clone(), Arc::clone(&clock), Arc::clone(&queue), Arc::new(registry), config);
        (queue, orchestrator)
    };

    let (queue_a, orchestrator_a) = build("worker-a");
    let (queue_b, orchestrator_b) = build("worker-b");
    queue_a.refill(clock.now()).await.unwrap();
    queue_b.refill(clock.now()).await.unwrap();

    let cancel_a = CancellationToken::new();
    let cancel_b = CancellationToken::new();
    let handle_a = tokio::spawn({
        let cancel = cancel_a.clone();
        async move { orchestrator_a.run(cancel).await }
    });
    let handle_b = tokio::spawn({
        let cancel = cancel_b.clone();
        async move { orchestrator_b.run(cancel).await }
    });

    let trigger_id = trigger.id;
    let pool_clone = pool.clone();
    poll_until(StdDuration::from_secs(2), || {
        let pool = pool_clone.clone();
        async move {
            let runs = run_store::list_by_trigger(&pool, trigger_id, 1, 10).await.unwrap();
            let completed = runs.iter().filter(|r| r.status == RunStatus::Completed).count();
            (completed >= 1).then_some(())
        }
    })
    .await;

    cancel_a.cancel();
    cancel_b.cancel();
    let _ = tokio::time::timeout(StdDuration::from_secs(3), handle_a).await;
    let _ = tokio::time::timeout(StdDuration::from_secs(3), handle_b).await;

    let runs = run_store::list_by_trigger(&pool, trigger.id, 1, 10).await.unwrap();
    assert_eq!(runs.len(), 1, "the trigger's concurrency cap of 1 must yield exactly one run, not one per worker");
    assert_eq!(runs[0].status, RunStatus::Completed);

    let reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(reloaded.success_runs, 1);
    assert_eq!(reloaded.current_runs, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_run_retries_with_backoff_then_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();

    let mut new = time_based_trigger("flaky-job");
    new.base_delay_seconds = 8;
    new.backoff_multiplier = 2.0;
    new.max_retries = 3;
    let trigger = trigger_store::create(&pool, &new).await.unwrap();

    let queue = Arc::new(PriorityQueue::new(pool.clone(), 1, 10));
    queue.refill(clock_dyn.now()).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(FlakyHandler {
        calls: AtomicUsize::new(0),
        fail_times: 1,
    });

    let config = OrchestratorConfig {
        tick_interval: StdDuration::from_millis(20),
        max_concurrent_runs_per_worker: 5,
        worker_id: "worker-1".to_string(),
        shutdown_grace: StdDuration::from_secs(2),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(pool.clone(), clock_dyn.clone(), Arc::clone(&queue), Arc::new(registry), config);

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    let trigger_id = trigger.id;
    let pool_clone = pool.clone();
    let retrying_run = poll_until(StdDuration::from_secs(2), || {
        let pool = pool_clone.clone();
        async move {
            let runs = run_store::list_by_trigger(&pool, trigger_id, 1, 10).await.unwrap();
            runs.into_iter().find(|r| r.status == RunStatus::Retrying)
        }
    })
    .await;

    let next_retry_at = retrying_run.next_retry_at.expect("retrying run must carry next_retry_at");
    // Advance the fake clock just past the scheduled retry so the next tick
    // picks it back up, without burning real wall-clock time on the delay.
    clock.set(next_retry_at + chrono::Duration::milliseconds(50));

    let run_id = retrying_run.id;
    let pool_clone = pool.clone();
    poll_until(StdDuration::from_secs(2), || {
        let pool = pool_clone.clone();
        async move {
            let run = run_store::get(&pool, run_id).await.unwrap();
            (run.status == RunStatus::Completed).then_some(())
        }
    })
    .await;

    cancel.cancel();
    let _ = tokio::time::timeout(StdDuration::from_secs(3), run_handle).await;

    let final_run = run_store::get(&pool, run_id).await.unwrap();
    // attempt starts at 0 on creation; mark_started bumps it once per
    // dispatch, so the failed attempt and the successful retry leave it at 2.
    assert_eq!(final_run.attempt, 2, "one failed attempt plus the successful retry");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn handler_exceeding_max_exec_seconds_times_out_and_is_not_retried() {
    let (pool, db_name) = create_test_db().await;
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(Utc::now()));

    let mut new = time_based_trigger("slow-job");
    new.max_exec_seconds = 1;
    new.max_retries = 0;
    let trigger = trigger_store::create(&pool, &new).await.unwrap();

    let queue = Arc::new(PriorityQueue::new(pool.clone(), 1, 10));
    queue.refill(clock.now()).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(NeverReturnsHandler);

    let config = OrchestratorConfig {
        tick_interval: StdDuration::from_millis(20),
        max_concurrent_runs_per_worker: 5,
        worker_id: "worker-1".to_string(),
        shutdown_grace: StdDuration::from_secs(2),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(pool.clone(), Arc::clone(&clock), Arc::clone(&queue), Arc::new(registry), config);

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    let trigger_id = trigger.id;
    let pool_clone = pool.clone();
    let failed_run = poll_until(StdDuration::from_secs(5), || {
        let pool = pool_clone.clone();
        async move {
            let runs = run_store::list_by_trigger(&pool, trigger_id, 1, 10).await.unwrap();
            runs.into_iter().find(|r| r.status == RunStatus::Failed)
        }
    })
    .await;

    assert_eq!(failed_run.error_kind, Some(orbit_db::models::ErrorKind::Timeout));

    cancel.cancel();
    let _ = tokio::time::timeout(StdDuration::from_secs(3), run_handle).await;

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn orphaned_run_from_a_crashed_worker_is_recovered_on_restart() {
    let (pool, db_name) = create_test_db().await;
    // Real wall-clock: started_at below is stamped by Postgres's own `now()`,
    // so the recovery check needs a clock that agrees with it.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut new = time_based_trigger("orphan-job");
    new.max_exec_seconds = 0;
    new.max_retries = 0;
    let trigger = trigger_store::create(&pool, &new).await.unwrap();

    let run = run_store::create(&pool, trigger.id, Utc::now(), json!({}), trigger.max_retries)
        .await
        .unwrap();
    // No real lease was ever acquired for this run -- it models a worker
    // that crashed between leasing and releasing.
    run_store::mark_queued(&pool, run.id, uuid::Uuid::new_v4()).await.unwrap();
    run_store::mark_started(&pool, run.id, "crashed-worker").await.unwrap();
    trigger_store::increment_current_runs(&pool, trigger.id).await.unwrap();

    let queue = Arc::new(PriorityQueue::new(pool.clone(), 1, 10));
    let registry = HandlerRegistry::new();
    let config = OrchestratorConfig {
        worker_id: "recovering-worker".to_string(),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(pool.clone(), Arc::clone(&clock), queue, Arc::new(registry), config);

    let recovered = orchestrator.recover_orphaned_runs().await.expect("recovery should not error");
    assert_eq!(recovered, 1);

    let reloaded = run_store::get(&pool, run.id).await.unwrap();
    assert_eq!(reloaded.status, RunStatus::Failed);
    assert_eq!(reloaded.error_kind, Some(orbit_db::models::ErrorKind::Timeout));

    let trigger_reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(trigger_reloaded.current_runs, 0, "the crashed run's concurrency slot must be released");

    pool.close().await;
    drop_test_db(&db_name).await;
}
