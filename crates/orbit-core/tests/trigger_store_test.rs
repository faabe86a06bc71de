//! Integration tests for the Trigger Store: CRUD, the `fetch_due` index query,
//! optimistic `bump_fire`, and the concurrency-cap counters, all against a
//! real Postgres instance.

use chrono::{Duration, Utc};
use serde_json::json;

use orbit_core::trigger_store::{self, NewTrigger, TriggerPatch};
use orbit_db::models::{TriggerKind, TriggerStatus};

use orbit_test_utils::{create_test_db, drop_test_db};

fn sample_trigger(name: &str) -> NewTrigger {
    NewTrigger {
        name: name.to_string(),
        organization_id: "org-1".to_string(),
        created_by: "user-1".to_string(),
        kind: TriggerKind::TimeBased,
        status: TriggerStatus::Active,
        cron_expression: None,
        timezone: None,
        interval_seconds: None,
        event_types: None,
        dependency_trigger_ids: None,
        dependency_predicate: None,
        condition_expression: None,
        window_start: None,
        window_end: None,
        task_type: "noop".to_string(),
        task_config: json!({}),
        task_parameters: json!({}),
        priority: 0,
        max_concurrent_runs: 1,
        max_exec_seconds: 60,
        max_retries: 3,
        base_delay_seconds: 8,
        backoff_multiplier: 2.0,
        max_delay_seconds: Some(300),
        next_fire_at: Some(Utc::now()),
    }
}

#[tokio::test]
async fn create_get_and_list_round_trip() {
    let (pool, db_name) = create_test_db().await;

    let created = trigger_store::create(&pool, &sample_trigger("nightly-report"))
        .await
        .expect("create should succeed");
    assert_eq!(created.name, "nightly-report");
    assert_eq!(created.version, 1);
    assert_eq!(created.current_runs, 0);

    let fetched = trigger_store::get(&pool, created.id).await.expect("get should succeed");
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.organization_id, "org-1");

    let listed = trigger_store::list(&pool, "org-1", None, 1, 10)
        .await
        .expect("list should succeed");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    let listed_other_org = trigger_store::list(&pool, "org-2", None, 1, 10)
        .await
        .expect("list should succeed");
    assert!(listed_other_org.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_rejects_out_of_range_paging() {
    let (pool, db_name) = create_test_db().await;

    let zero_page = trigger_store::list(&pool, "org-1", None, 0, 10).await;
    assert!(zero_page.is_err(), "page < 1 should be rejected");

    let oversized_page = trigger_store::list(&pool, "org-1", None, 1, 101).await;
    assert!(oversized_page.is_err(), "page_size > 100 should be rejected");

    let zero_page_size = trigger_store::list(&pool, "org-1", None, 1, 0).await;
    assert!(zero_page_size.is_err(), "page_size < 1 should be rejected");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_missing_trigger_is_not_found() {
    let (pool, db_name) = create_test_db().await;

    let result = trigger_store::get(&pool, uuid::Uuid::new_v4()).await;
    assert!(result.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fetch_due_orders_by_fire_time_then_priority_and_skips_at_capacity() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    let mut low_priority_earlier = sample_trigger("low-priority-earlier");
    low_priority_earlier.priority = 0;
    low_priority_earlier.next_fire_at = Some(now - Duration::seconds(10));
    let low_priority_earlier = trigger_store::create(&pool, &low_priority_earlier).await.unwrap();

    let mut high_priority_same_time = sample_trigger("high-priority-same-time");
    high_priority_same_time.priority = 10;
    high_priority_same_time.next_fire_at = Some(now - Duration::seconds(5));
    let high_priority_same_time = trigger_store::create(&pool, &high_priority_same_time).await.unwrap();

    let mut low_priority_same_time = sample_trigger("low-priority-same-time");
    low_priority_same_time.priority = 1;
    low_priority_same_time.next_fire_at = Some(now - Duration::seconds(5));
    let low_priority_same_time = trigger_store::create(&pool, &low_priority_same_time).await.unwrap();

    let mut not_yet_due = sample_trigger("not-yet-due");
    not_yet_due.next_fire_at = Some(now + Duration::seconds(60));
    trigger_store::create(&pool, &not_yet_due).await.unwrap();

    let mut at_capacity = sample_trigger("at-capacity");
    at_capacity.next_fire_at = Some(now - Duration::seconds(1));
    at_capacity.max_concurrent_runs = 1;
    let at_capacity = trigger_store::create(&pool, &at_capacity).await.unwrap();
    trigger_store::increment_current_runs(&pool, at_capacity.id).await.unwrap();

    let due = trigger_store::fetch_due(&pool, now, 10).await.expect("fetch_due should succeed");

    let due_ids: Vec<_> = due.iter().map(|t| t.id).collect();
    assert!(
        !due_ids.contains(&at_capacity.id),
        "a trigger already at its concurrency cap must not be returned"
    );

    assert_eq!(
        due_ids,
        vec![
            low_priority_earlier.id,
            high_priority_same_time.id,
            low_priority_same_time.id,
        ],
        "earliest next_fire_at first, ties broken by priority descending"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn bump_fire_advances_schedule_and_rejects_stale_version() {
    let (pool, db_name) = create_test_db().await;
    let trigger = trigger_store::create(&pool, &sample_trigger("interval-job")).await.unwrap();

    let last_fire = Utc::now();
    let next_fire = last_fire + Duration::minutes(5);

    let ok = trigger_store::bump_fire(&pool, trigger.id, trigger.version, Some(next_fire), last_fire)
        .await
        .expect("bump_fire should succeed");
    assert!(ok);

    let reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(reloaded.version, trigger.version + 1);
    assert_eq!(reloaded.next_fire_at, Some(next_fire));
    assert_eq!(reloaded.last_fire_at, Some(last_fire));

    // Reusing the original (now stale) version must lose the race.
    let stale = trigger_store::bump_fire(
        &pool,
        trigger.id,
        trigger.version,
        Some(next_fire + Duration::minutes(5)),
        last_fire,
    )
    .await
    .expect("bump_fire should not error on a stale version, just report false");
    assert!(!stale, "a stale version must not be allowed to overwrite a newer fire");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrency_cap_blocks_increment_past_max_concurrent_runs() {
    let (pool, db_name) = create_test_db().await;
    let mut new = sample_trigger("capped-job");
    new.max_concurrent_runs = 2;
    let trigger = trigger_store::create(&pool, &new).await.unwrap();

    assert!(trigger_store::try_increment_current_runs(&pool, trigger.id).await.unwrap());
    assert!(trigger_store::try_increment_current_runs(&pool, trigger.id).await.unwrap());
    assert!(
        !trigger_store::try_increment_current_runs(&pool, trigger.id).await.unwrap(),
        "third increment should be refused once current_runs == max_concurrent_runs"
    );

    trigger_store::decrement_current_runs(&pool, trigger.id, true).await.unwrap();
    let reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(reloaded.current_runs, 1);
    assert_eq!(reloaded.total_runs, 1);
    assert_eq!(reloaded.success_runs, 1);

    trigger_store::decrement_current_runs(&pool, trigger.id, false).await.unwrap();
    let reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(reloaded.current_runs, 0);
    assert_eq!(reloaded.total_runs, 2);
    assert_eq!(reloaded.failure_runs, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transition_status_validates_the_transition_graph() {
    let (pool, db_name) = create_test_db().await;
    let trigger = trigger_store::create(&pool, &sample_trigger("pausable-job")).await.unwrap();

    let paused = trigger_store::transition_status(&pool, trigger.id, TriggerStatus::Active, TriggerStatus::Paused)
        .await
        .expect("active -> paused should be valid");
    assert_eq!(paused.status, TriggerStatus::Paused);

    let rejected = trigger_store::transition_status(
        &pool,
        trigger.id,
        TriggerStatus::Active,
        TriggerStatus::Disabled,
    )
    .await;
    assert!(
        rejected.is_err(),
        "stale expected status should be rejected as a conflict, not silently applied"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn soft_delete_archives_and_is_not_reversible() {
    let (pool, db_name) = create_test_db().await;
    let trigger = trigger_store::create(&pool, &sample_trigger("archivable-job")).await.unwrap();

    trigger_store::soft_delete(&pool, trigger.id).await.expect("first archive should succeed");
    let reloaded = trigger_store::get(&pool, trigger.id).await.unwrap();
    assert_eq!(reloaded.status, TriggerStatus::Archived);

    let second = trigger_store::soft_delete(&pool, trigger.id).await;
    assert!(second.is_err(), "archiving an already-archived trigger is a conflict");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_applies_patch_under_optimistic_concurrency() {
    let (pool, db_name) = create_test_db().await;
    let trigger = trigger_store::create(&pool, &sample_trigger("patchable-job")).await.unwrap();

    let patch = TriggerPatch {
        priority: Some(5),
        max_retries: Some(10),
        ..Default::default()
    };

    let updated = trigger_store::update(&pool, trigger.id, trigger.version, &patch)
        .await
        .expect("update should succeed with the correct version");
    assert_eq!(updated.priority, 5);
    assert_eq!(updated.max_retries, 10);
    assert_eq!(updated.version, trigger.version + 1);
    // Untouched fields survive the COALESCE.
    assert_eq!(updated.name, trigger.name);

    let stale_patch = TriggerPatch {
        priority: Some(9),
        ..Default::default()
    };
    let stale = trigger_store::update(&pool, trigger.id, trigger.version, &stale_patch).await;
    assert!(stale.is_err(), "stale version should be rejected as a conflict");

    pool.close().await;
    drop_test_db(&db_name).await;
}
