//! Queue lifecycle behavior against a real database.

mod common;

use std::collections::HashSet;

use serde_json::json;
use tempfile::tempdir;

use spurgo::queue::{Expr, Queue, QueueItem};

const MAX_ATTEMPTS: i64 = 3;

fn payload(n: i64) -> serde_json::Value {
    json!({"type": "url", "url": format!("https://example.com/{n}/")})
}

async fn find_item(queue: &Queue, id: i64) -> QueueItem {
    queue
        .get_items(100, false)
        .await
        .expect("items readable")
        .into_iter()
        .find(|item| item.id == id)
        .expect("item present")
}

#[tokio::test]
async fn add_assigns_ids_and_bookkeeping() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let item = queue.add(payload(1), None).await.expect("item added");
    assert!(item.id > 0);
    assert_eq!(item.attempts, 0);
    assert!(item.is_active());
    assert!(!item.is_reserved());

    let stored = find_item(&queue, item.id).await;
    assert_eq!(stored, item);
}

#[tokio::test]
async fn same_queue_parent_is_dropped() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let first = queue.add(payload(1), None).await.expect("item added");
    let second = queue
        .add(payload(2), Some(("test", first.id)))
        .await
        .expect("item added");

    assert_eq!(second.parent_id, None);
    assert_eq!(second.parent_queue_name, None);

    let stored = find_item(&queue, second.id).await;
    assert_eq!(stored.parent_id, None);
    assert_eq!(stored.parent_queue_name, None);
}

#[tokio::test]
async fn cross_queue_parent_is_kept() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("urls", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let item = queue
        .add(payload(1), Some(("objects", 7)))
        .await
        .expect("item added");
    assert_eq!(item.parent_id, Some(7));
    assert_eq!(item.parent_queue_name.as_deref(), Some("objects"));
}

#[tokio::test]
async fn claim_order_is_most_recent_first() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let a = queue.add(payload(1), None).await.expect("item added");
    let b = queue.add(payload(2), None).await.expect("item added");
    let c = queue.add(payload(3), None).await.expect("item added");

    let claimed = queue
        .get_and_reserve_items(2, false)
        .await
        .expect("claim succeeds");
    let ids: Vec<_> = claimed.iter().map(|item| item.id).collect();
    assert_eq!(ids, [c.id, b.id]);
    assert!(claimed.iter().all(QueueItem::is_reserved));

    let remaining = queue
        .get_and_reserve_items(10, false)
        .await
        .expect("claim succeeds");
    assert_eq!(
        remaining.iter().map(|item| item.id).collect::<Vec<_>>(),
        [a.id]
    );
}

#[tokio::test]
async fn claim_excludes_reserved_completed_and_failed() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let completed = queue.add(payload(1), None).await.expect("item added");
    let failed = queue.add(payload(2), None).await.expect("item added");
    let reserved = queue.add(payload(3), None).await.expect("item added");
    let open = queue.add(payload(4), None).await.expect("item added");

    assert!(queue.complete_item(&completed).await.expect("completes"));
    assert!(queue.set_item_as_failed(&failed).await.expect("fails"));
    assert!(queue.reserve_item(&reserved).await.expect("reserves"));

    let claimed = queue
        .get_and_reserve_items(10, false)
        .await
        .expect("claim succeeds");
    assert_eq!(
        claimed.iter().map(|item| item.id).collect::<Vec<_>>(),
        [open.id]
    );
}

#[tokio::test]
async fn retry_ceiling_gates_claims_until_force_retry() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let item = queue.add(payload(1), None).await.expect("item added");
    for _ in 0..MAX_ATTEMPTS {
        assert!(queue.do_attempt(&item).await.expect("attempt counted"));
    }

    assert!(
        queue
            .get_and_reserve_items(10, false)
            .await
            .expect("claim succeeds")
            .is_empty()
    );

    assert!(
        queue
            .force_retry_item(&item, true)
            .await
            .expect("override set")
    );
    let claimed = queue
        .get_and_reserve_items(10, false)
        .await
        .expect("claim succeeds");
    assert_eq!(
        claimed.iter().map(|item| item.id).collect::<Vec<_>>(),
        [item.id]
    );
}

#[tokio::test]
async fn racing_claims_never_return_the_same_item() {
    let dir = tempdir().expect("tempdir");
    let pool = common::pool_in(&dir, 4).await;
    let queue = Queue::new("test", pool, MAX_ATTEMPTS);

    for n in 0..6 {
        queue.add(payload(n), None).await.expect("item added");
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .get_and_reserve_items(3, false)
                .await
                .expect("claim succeeds")
        }));
    }

    let mut all_ids = Vec::new();
    for handle in handles {
        let items = handle.await.expect("task completes");
        all_ids.extend(items.into_iter().map(|item| item.id));
    }

    let distinct: HashSet<_> = all_ids.iter().copied().collect();
    assert_eq!(all_ids.len(), 6, "every claimable item claimed exactly once");
    assert_eq!(distinct.len(), 6);
}

#[tokio::test]
async fn claim_with_do_attempt_counts_an_attempt() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    queue.add(payload(1), None).await.expect("item added");
    let claimed = queue
        .get_and_reserve_items(1, true)
        .await
        .expect("claim succeeds");
    assert_eq!(claimed[0].attempts, 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let item = queue.add(payload(1), None).await.expect("item added");
    assert!(queue.reserve_item(&item).await.expect("reserves"));

    assert!(queue.release_item(&item).await.expect("releases"));
    assert!(!queue.release_item(&item).await.expect("no-op release"));

    let stored = find_item(&queue, item.id).await;
    assert!(!stored.is_reserved());
}

#[tokio::test]
async fn completion_implies_reservation() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let item = queue.add(payload(1), None).await.expect("item added");
    assert!(queue.complete_item(item.id).await.expect("completes"));

    let stored = find_item(&queue, item.id).await;
    assert!(stored.is_completed());
    assert!(stored.is_reserved(), "completion backfills the reservation");
    assert!(!queue.complete_item(item.id).await.expect("no-op"));
}

#[tokio::test]
async fn foreign_queue_ids_are_no_ops() {
    let dir = tempdir().expect("tempdir");
    let pool = common::pool_in(&dir, 2).await;
    let objects = Queue::new("objects", pool.clone(), MAX_ATTEMPTS);
    let urls = Queue::new("urls", pool, MAX_ATTEMPTS);

    let item = objects.add(payload(1), None).await.expect("item added");

    assert!(!urls.complete_item(item.id).await.expect("no-op"));
    assert!(!urls.set_item_as_failed(item.id).await.expect("no-op"));
    assert!(!urls.reserve_item(item.id).await.expect("no-op"));
    assert!(!urls.delete_item(item.id).await.expect("no-op"));

    let stored = find_item(&objects, item.id).await;
    assert!(stored.is_active());
    assert!(!stored.is_reserved());
}

#[tokio::test]
async fn unfinished_children_track_parent_completion_eligibility() {
    let dir = tempdir().expect("tempdir");
    let pool = common::pool_in(&dir, 2).await;
    let objects = Queue::new("objects", pool.clone(), MAX_ATTEMPTS);
    let urls = Queue::new("urls", pool, MAX_ATTEMPTS);

    let parent = objects.add(payload(1), None).await.expect("parent added");
    let first = urls
        .add(payload(2), Some(("objects", parent.id)))
        .await
        .expect("child added");
    let second = urls
        .add(payload(3), Some(("objects", parent.id)))
        .await
        .expect("child added");

    let unfinished = urls
        .get_unfinished_items_by_parent(parent.id, "objects")
        .await
        .expect("children readable");
    assert_eq!(unfinished.len(), 2);

    assert!(urls.complete_item(&first).await.expect("completes"));
    assert!(urls.set_item_as_failed(&second).await.expect("fails"));

    let unfinished = urls
        .get_unfinished_items_by_parent(parent.id, "objects")
        .await
        .expect("children readable");
    assert!(unfinished.is_empty(), "terminal children no longer count");
}

#[tokio::test]
async fn counts_and_status_reflect_state() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let completed = queue.add(payload(1), None).await.expect("item added");
    let reserved = queue.add(payload(2), None).await.expect("item added");
    queue.add(payload(3), None).await.expect("item added");

    queue.complete_item(&completed).await.expect("completes");
    queue.reserve_item(&reserved).await.expect("reserves");

    let status = queue.status().await.expect("status readable");
    assert_eq!(status.total, 3);
    assert_eq!(status.available, 1);
    assert_eq!(status.reserved, 1);
    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 0);

    assert!(queue.has_items().await.expect("readable"));
    assert!(queue.has_available().await.expect("readable"));
    assert!(!queue.is_empty().await.expect("readable"));
}

#[tokio::test]
async fn clear_defaults_to_active_items_only() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let completed = queue.add(payload(1), None).await.expect("item added");
    let failed = queue.add(payload(2), None).await.expect("item added");
    queue.add(payload(3), None).await.expect("item added");
    queue.complete_item(&completed).await.expect("completes");
    queue.set_item_as_failed(&failed).await.expect("fails");

    let removed = queue.clear_queue().await.expect("clear succeeds");
    assert_eq!(removed, 1);
    assert_eq!(queue.count_items().await.expect("countable"), 2);

    let removed = queue
        .clear_queue_matching(Expr::everything())
        .await
        .expect("flush succeeds");
    assert_eq!(removed, 2);
    assert!(queue.is_empty().await.expect("readable"));
}

#[tokio::test]
async fn delete_removes_single_items_and_batches() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let a = queue.add(payload(1), None).await.expect("item added");
    let b = queue.add(payload(2), None).await.expect("item added");
    let c = queue.add(payload(3), None).await.expect("item added");

    assert!(queue.delete_item(a.id).await.expect("deletes"));
    assert!(!queue.delete_item(a.id).await.expect("no-op"));

    let removed = queue.delete_items(&[b, c]).await.expect("deletes");
    assert_eq!(removed, 2);
    assert!(queue.is_empty().await.expect("readable"));
}

#[tokio::test]
async fn exhausted_items_are_flagged_failed() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let exhausted = queue.add(payload(1), None).await.expect("item added");
    let overridden = queue.add(payload(2), None).await.expect("item added");
    let fresh = queue.add(payload(3), None).await.expect("item added");

    for _ in 0..MAX_ATTEMPTS {
        queue.do_attempt(&exhausted).await.expect("attempt counted");
        queue.do_attempt(&overridden).await.expect("attempt counted");
    }
    queue
        .force_retry_item(&overridden, true)
        .await
        .expect("override set");

    let flagged = queue.flag_exhausted_items().await.expect("flagging runs");
    assert_eq!(flagged, 1);

    assert!(find_item(&queue, exhausted.id).await.is_failed());
    assert!(find_item(&queue, overridden.id).await.is_active());
    assert!(find_item(&queue, fresh.id).await.is_active());
}

#[tokio::test]
async fn garbage_collection_prunes_terminal_and_revives_stale() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::new("test", common::pool_in(&dir, 2).await, MAX_ATTEMPTS);

    let done = queue.add(payload(1), None).await.expect("item added");
    let stuck = queue.add(payload(2), None).await.expect("item added");
    queue.complete_item(&done).await.expect("completes");
    queue.reserve_item(&stuck).await.expect("reserves");

    // Timestamps are whole seconds; cross a second boundary so the
    // zero-duration cutoffs are strictly in the past.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    let fresh = queue.add(payload(3), None).await.expect("item added");

    let outcome = queue
        .collect_garbage(std::time::Duration::ZERO, std::time::Duration::ZERO)
        .await
        .expect("gc runs");
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.released, 1);

    let revived = find_item(&queue, stuck.id).await;
    assert!(!revived.is_reserved());
    assert!(revived.is_active());
    assert!(find_item(&queue, fresh.id).await.is_active());
    assert_eq!(queue.count_items().await.expect("countable"), 2);
}
