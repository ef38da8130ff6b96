//! Event Queue scenarios that need a real SQLite pool rather than the pure
//! `coalesce()` unit tests already covering the collapsing rules in
//! isolation: a burst landing as a single lease (S5), and in-flight work
//! surviving a simulated crash-and-restart (S6).

use markdownkeeper::event_queue::EventQueue;
use markdownkeeper::migrate::migrate_pool;
use markdownkeeper_core::models::EventKind;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use std::str::FromStr;
use tempfile::TempDir;

async fn fresh_pool(dir: &TempDir) -> SqlitePool {
    let db_path = dir.path().join("events.sqlite");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn s5_burst_of_events_for_one_path_leases_as_a_single_action() {
    let tmp = TempDir::new().unwrap();
    let pool = fresh_pool(&tmp).await;
    let queue = EventQueue::new(pool, 0);

    queue.enqueue("a.md", EventKind::Create, None).await.unwrap();
    queue.enqueue("a.md", EventKind::Modify, None).await.unwrap();
    queue.enqueue("a.md", EventKind::Modify, None).await.unwrap();

    let leased = queue.lease_next().await.unwrap().expect("burst should coalesce to one lead event");
    assert_eq!(leased.path, "a.md");
    assert_eq!(leased.kind, EventKind::Modify, "create+modify+modify collapses to modify");

    assert!(
        queue.lease_next().await.unwrap().is_none(),
        "no second lease should be available once the burst's lead is in flight"
    );

    queue.mark_done(leased.id).await.unwrap();
}

#[tokio::test]
async fn s6_in_flight_event_survives_a_simulated_crash_and_restart() {
    let tmp = TempDir::new().unwrap();
    let pool = fresh_pool(&tmp).await;

    let before_crash = EventQueue::new(pool.clone(), 0);
    before_crash.enqueue("b.md", EventKind::Create, None).await.unwrap();
    let leased = before_crash.lease_next().await.unwrap().expect("should lease the new event");
    assert_eq!(leased.path, "b.md");
    // Process crashes here: neither mark_done nor mark_retry is ever called,
    // leaving the event_log row `in_flight` forever unless something replays it.

    let after_restart = EventQueue::new(pool, 0);
    let replayed = after_restart.replay_orphaned().await.unwrap();
    assert_eq!(replayed, 1, "the orphaned in_flight row should be reset to queued");

    let relaunched = after_restart.lease_next().await.unwrap().expect("replayed event should be leasable again");
    assert_eq!(relaunched.path, "b.md");
    assert_eq!(relaunched.kind, EventKind::Create);
}
