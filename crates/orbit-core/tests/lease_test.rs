//! Integration tests for the Lease Manager: mutual exclusion between
//! competing owners and TTL-based liveness, both driven by a `FakeClock` so
//! expiry can be asserted without waiting out a real TTL.

use chrono::Duration;

use orbit_core::clock::FakeClock;
use orbit_core::lease::{self, ExtendOutcome, HeartbeatOutcome, LeaseOutcome, ReleaseOutcome};

use orbit_test_utils::{create_test_db, drop_test_db};

const RESOURCE_TYPE: &str = "scheduled_trigger";

#[tokio::test]
async fn second_acquire_on_a_live_lease_is_refused() {
    let (pool, db_name) = create_test_db().await;
    let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());

    let first = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-1",
        Duration::seconds(30),
        "worker-a",
        None,
        false,
        0,
        None,
    )
    .await
    .expect("first acquire should not error");
    assert!(matches!(first, LeaseOutcome::Acquired(_)));

    let second = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-1",
        Duration::seconds(30),
        "worker-b",
        None,
        false,
        0,
        None,
    )
    .await
    .expect("second acquire should not error");
    assert!(
        matches!(second, LeaseOutcome::NoneAvailable),
        "a live lease must exclude a second owner (property 2)"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn expired_lease_can_be_reacquired_by_a_different_owner() {
    let (pool, db_name) = create_test_db().await;
    let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());

    let first = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-2",
        Duration::seconds(30),
        "worker-a",
        None,
        false,
        0,
        None,
    )
    .await
    .unwrap();
    assert!(matches!(first, LeaseOutcome::Acquired(_)));

    // Move the fake clock past the 30s TTL.
    clock.advance(Duration::seconds(31));

    let second = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-2",
        Duration::seconds(30),
        "worker-b",
        None,
        false,
        0,
        None,
    )
    .await
    .unwrap();
    assert!(
        matches!(second, LeaseOutcome::Acquired(_)),
        "an expired lease must admit a new owner without a background sweep (property 3)"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duration_out_of_bounds_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());

    let too_short = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-3",
        Duration::seconds(0),
        "worker-a",
        None,
        false,
        0,
        None,
    )
    .await;
    assert!(too_short.is_err());

    let too_long = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-3",
        Duration::seconds(3601),
        "worker-a",
        None,
        false,
        0,
        None,
    )
    .await;
    assert!(too_long.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn release_requires_ownership_and_liveness() {
    let (pool, db_name) = create_test_db().await;
    let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());

    let acquired = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-4",
        Duration::seconds(30),
        "worker-a",
        None,
        false,
        0,
        None,
    )
    .await
    .unwrap();
    let lease_id = match acquired {
        LeaseOutcome::Acquired(l) => l.lease_id,
        _ => panic!("expected acquisition to succeed"),
    };

    let wrong_owner = lease::release(&pool, &clock, lease_id, "worker-b").await.unwrap();
    assert_eq!(wrong_owner, ReleaseOutcome::NotOwner);

    let ok = lease::release(&pool, &clock, lease_id, "worker-a").await.unwrap();
    assert_eq!(ok, ReleaseOutcome::Ok);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn extend_respects_max_extensions_and_owner() {
    let (pool, db_name) = create_test_db().await;
    let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());

    let acquired = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-5",
        Duration::seconds(30),
        "worker-a",
        None,
        false,
        1,
        None,
    )
    .await
    .unwrap();
    let lease_id = match acquired {
        LeaseOutcome::Acquired(l) => l.lease_id,
        _ => panic!("expected acquisition to succeed"),
    };

    let extended = lease::extend(&pool, &clock, lease_id, "worker-a", Duration::seconds(15))
        .await
        .unwrap();
    assert!(matches!(extended, ExtendOutcome::Ok(_)));

    let exhausted = lease::extend(&pool, &clock, lease_id, "worker-a", Duration::seconds(15))
        .await
        .unwrap();
    assert_eq!(exhausted, ExtendOutcome::LimitReached);

    let not_owner = lease::extend(&pool, &clock, lease_id, "worker-b", Duration::seconds(15))
        .await
        .unwrap();
    assert_eq!(not_owner, ExtendOutcome::NotOwner);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn heartbeat_keeps_lease_alive_and_reports_health() {
    let (pool, db_name) = create_test_db().await;
    let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());

    let acquired = lease::acquire(
        &pool,
        &clock,
        RESOURCE_TYPE,
        "trigger-6",
        Duration::seconds(60),
        "worker-a",
        None,
        true,
        3,
        Some(10),
    )
    .await
    .unwrap();
    let lease_id = match acquired {
        LeaseOutcome::Acquired(l) => l.lease_id,
        _ => panic!("expected acquisition to succeed"),
    };

    clock.advance(Duration::seconds(30));
    let beat = lease::heartbeat(&pool, &clock, lease_id, "worker-a").await.unwrap();
    assert_eq!(beat, HeartbeatOutcome::Ok);

    let health = lease::health(&pool, &clock, lease_id).await.unwrap();
    assert!(health.alive);
    // auto_extend pushed expires_at forward by another 60s from the heartbeat.
    assert_eq!(health.time_to_expiry, Duration::seconds(60));
    assert_eq!(health.extensions_remaining, 3);

    assert!(lease::is_owned_by(&pool, &clock, lease_id, "worker-a").await.unwrap());
    assert!(!lease::is_owned_by(&pool, &clock, lease_id, "worker-b").await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}
