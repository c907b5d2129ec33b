mod common;

use catalog_sync::db::queue::{self, RETRY_DELAY_SECS};
use catalog_sync::model::{Outcome, QueueStatus};
use chrono::Duration;
use common::{setup_pool, ts};
use std::collections::HashSet;

fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

#[tokio::test]
async fn claim_leases_pending_row_once() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);

    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Pending);
    assert!(row.lock_token.is_none());

    let claimed = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let item = &claimed[0];
    assert_eq!(item.external_id, "md-1");
    assert_eq!(item.status, QueueStatus::Processing);
    assert_eq!(item.locked_until, Some(t0 + secs(60)));
    assert_eq!(item.attempts, 1);
    assert!(item.lock_token.is_some());

    let again = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn failed_row_waits_for_retry_delay() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();
    let claimed = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();
    let item = &claimed[0];

    let resolved = queue::resolve(
        &pool,
        item.id,
        item.lock_token.as_deref().unwrap(),
        &Outcome::Failure("remote 500".into()),
        t0,
    )
    .await
    .unwrap();
    assert!(resolved);

    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Error);
    assert_eq!(row.last_error.as_deref(), Some("remote 500"));
    assert_eq!(row.next_run_at, t0 + secs(RETRY_DELAY_SECS));
    assert!(row.lock_token.is_none());
    assert!(row.locked_until.is_none());

    let early = queue::claim_batch(&pool, 5, secs(60), t0 + secs(100)).await.unwrap();
    assert!(early.is_empty());

    let later = queue::claim_batch(&pool, 5, secs(60), t0 + secs(301)).await.unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].external_id, "md-1");
    assert_eq!(later[0].attempts, 2);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_old_token_rejected() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();

    let first = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();
    let old_token = first[0].lock_token.clone().unwrap();

    let still_leased = queue::claim_batch(&pool, 1, secs(60), t0 + secs(30)).await.unwrap();
    assert!(still_leased.is_empty());

    let second = queue::claim_batch(&pool, 1, secs(60), t0 + secs(61)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, first[0].id);
    let new_token = second[0].lock_token.clone().unwrap();
    assert_ne!(old_token, new_token);

    let stale = queue::resolve(&pool, first[0].id, &old_token, &Outcome::Success, t0 + secs(62))
        .await
        .unwrap();
    assert!(!stale);
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processing);
    assert_eq!(row.lock_token.as_deref(), Some(new_token.as_str()));

    let ok = queue::resolve(&pool, second[0].id, &new_token, &Outcome::Success, t0 + secs(63))
        .await
        .unwrap();
    assert!(ok);
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Done);
    assert!(row.lock_token.is_none());
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn resolve_with_unknown_token_changes_nothing() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();
    let claimed = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();

    let ok = queue::resolve(
        &pool,
        claimed[0].id,
        "not-the-token",
        &Outcome::Failure("x".into()),
        t0,
    )
    .await
    .unwrap();
    assert!(!ok);
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processing);
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn touch_keeps_status_and_lease_of_active_rows() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();
    queue::enqueue_or_touch(&pool, "md-2", t0, t0).await.unwrap();
    let claimed = queue::claim_batch(&pool, 2, secs(60), t0).await.unwrap();
    let first = claimed.iter().find(|i| i.external_id == "md-1").unwrap();
    let second = claimed.iter().find(|i| i.external_id == "md-2").unwrap();
    queue::resolve(
        &pool,
        second.id,
        second.lock_token.as_deref().unwrap(),
        &Outcome::Failure("boom".into()),
        t0,
    )
    .await
    .unwrap();

    for _ in 0..2 {
        queue::enqueue_or_touch(&pool, "md-1", ts(5), ts(6)).await.unwrap();
        queue::enqueue_or_touch(&pool, "md-2", ts(5), ts(6)).await.unwrap();
    }

    let processing = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(processing.status, QueueStatus::Processing);
    assert_eq!(processing.lock_token, first.lock_token);
    assert_eq!(processing.locked_until, first.locked_until);
    assert_eq!(processing.last_seen_at, ts(5));

    let errored = queue::get_by_external_id(&pool, "md-2").await.unwrap().unwrap();
    assert_eq!(errored.status, QueueStatus::Error);
    assert_eq!(errored.last_error.as_deref(), Some("boom"));
    assert_eq!(errored.last_seen_at, ts(5));
}

#[tokio::test]
async fn touch_never_moves_last_seen_backwards() {
    let (_dir, pool) = setup_pool().await;
    queue::enqueue_or_touch(&pool, "md-1", ts(10), ts(10)).await.unwrap();
    queue::enqueue_or_touch(&pool, "md-1", ts(3), ts(11)).await.unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.last_seen_at, ts(10));
    assert_eq!(row.status, QueueStatus::Pending);
}

#[tokio::test]
async fn done_row_returns_to_pending_only_on_newer_activity() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();
    let claimed = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();
    queue::resolve(
        &pool,
        claimed[0].id,
        claimed[0].lock_token.as_deref().unwrap(),
        &Outcome::Success,
        t0,
    )
    .await
    .unwrap();

    queue::enqueue_or_touch(&pool, "md-1", t0, ts(1)).await.unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Done);

    queue::enqueue_or_touch(&pool, "md-1", ts(2), ts(2)).await.unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Pending);

    let reclaimed = queue::claim_batch(&pool, 1, secs(60), ts(3)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn claim_orders_by_next_run_and_respects_limit() {
    let (_dir, pool) = setup_pool().await;
    queue::enqueue_or_touch(&pool, "late", ts(9), ts(9)).await.unwrap();
    queue::enqueue_or_touch(&pool, "early", ts(1), ts(9)).await.unwrap();
    queue::enqueue_or_touch(&pool, "middle", ts(5), ts(9)).await.unwrap();

    let claimed = queue::claim_batch(&pool, 2, secs(60), ts(10)).await.unwrap();
    let ids: Vec<&str> = claimed.iter().map(|i| i.external_id.as_str()).collect();
    assert_eq!(ids, vec!["early", "middle"]);

    assert!(queue::claim_batch(&pool, 0, secs(60), ts(10)).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_row() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    for i in 0..30 {
        queue::enqueue_or_touch(&pool, &format!("md-{i}"), t0, t0).await.unwrap();
    }

    let claims = (0..8).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move { queue::claim_batch(&pool, 5, secs(60), t0).await })
    });
    let results = futures::future::join_all(claims).await;

    let mut seen = HashSet::new();
    let mut total = 0;
    for result in results {
        for item in result.unwrap().unwrap() {
            total += 1;
            assert!(seen.insert(item.id), "row {} claimed twice", item.id);
        }
    }
    assert_eq!(total, 30);

    let counts = queue::status_counts(&pool).await.unwrap();
    assert_eq!(counts[&QueueStatus::Processing], 30);
    assert_eq!(counts[&QueueStatus::Pending], 0);
}

#[tokio::test]
async fn touch_does_not_shorten_retry_delay() {
    let (_dir, pool) = setup_pool().await;
    let t0 = ts(0);
    queue::enqueue_or_touch(&pool, "md-1", t0, t0).await.unwrap();
    let claimed = queue::claim_batch(&pool, 1, secs(60), t0).await.unwrap();
    queue::resolve(
        &pool,
        claimed[0].id,
        claimed[0].lock_token.as_deref().unwrap(),
        &Outcome::Failure("boom".into()),
        t0,
    )
    .await
    .unwrap();

    queue::enqueue_or_touch(&pool, "md-1", ts(1), ts(1)).await.unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.next_run_at, t0 + secs(RETRY_DELAY_SECS));
    assert!(queue::claim_batch(&pool, 1, secs(60), ts(2)).await.unwrap().is_empty());

    queue::enqueue_or_touch(&pool, "md-1", ts(9), ts(9)).await.unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Error);
    assert_eq!(row.next_run_at, ts(9));
}

#[tokio::test]
async fn activity_seen_during_lease_re_pends_on_success() {
    let (_dir, pool) = setup_pool().await;
    queue::enqueue_or_touch(&pool, "md-1", ts(1), ts(1)).await.unwrap();
    let claimed = queue::claim_batch(&pool, 1, secs(60), ts(1)).await.unwrap();

    queue::enqueue_or_touch(&pool, "md-1", ts(2), ts(2)).await.unwrap();
    let ok = queue::resolve(
        &pool,
        claimed[0].id,
        claimed[0].lock_token.as_deref().unwrap(),
        &Outcome::Success,
        ts(3),
    )
    .await
    .unwrap();
    assert!(ok);

    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Pending);
    assert!(row.lock_token.is_none());
    assert!(row.last_error.is_none());

    queue::enqueue_or_touch(&pool, "md-1", ts(2), ts(4)).await.unwrap();
    let reclaimed = queue::claim_batch(&pool, 1, secs(60), ts(4)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    queue::resolve(
        &pool,
        reclaimed[0].id,
        reclaimed[0].lock_token.as_deref().unwrap(),
        &Outcome::Success,
        ts(5),
    )
    .await
    .unwrap();
    let row = queue::get_by_external_id(&pool, "md-1").await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Done);
}
