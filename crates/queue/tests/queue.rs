#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use ccop_core::{EventKind, Keyed, WorkItem};
use ccop_queue::{ItemExponentialRateLimiter, WorkQueue};
use tokio::time::timeout;

fn fast_queue() -> WorkQueue<WorkItem> {
    WorkQueue::with_rate_limiter(Box::new(ItemExponentialRateLimiter::new(
        Duration::from_millis(1),
        Duration::from_millis(20),
    )))
}

async fn next(q: &WorkQueue<WorkItem>) -> Option<WorkItem> {
    timeout(Duration::from_secs(2), q.get()).await.expect("get timed out")
}

#[tokio::test]
async fn pending_items_coalesce_by_key() {
    let q = fast_queue();
    q.add(WorkItem::created("ns/a"));
    q.add(WorkItem::updated("ns/a"));
    q.add(WorkItem::created("ns/b"));
    assert_eq!(q.len(), 2);

    let first = next(&q).await.unwrap();
    assert_eq!(first.key(), "ns/a");
    assert_eq!(first.kind(), EventKind::Updated, "last writer wins");
    q.done(&first);
    let second = next(&q).await.unwrap();
    assert_eq!(second, WorkItem::created("ns/b"));
    q.done(&second);
    assert!(q.is_empty());
}

#[tokio::test]
async fn add_during_processing_waits_for_done() {
    let q = fast_queue();
    q.add(WorkItem::created("ns/a"));
    let item = next(&q).await.unwrap();

    q.add(WorkItem::deleted("ns/a"));
    assert_eq!(q.len(), 0, "key is processing; nothing handed out yet");

    q.done(&item);
    assert_eq!(q.len(), 1);
    let again = next(&q).await.unwrap();
    assert_eq!(again, WorkItem::deleted("ns/a"));
    q.done(&again);
}

#[tokio::test]
async fn shutdown_drains_queued_items_first() {
    let q = fast_queue();
    for k in ["ns/1", "ns/2", "ns/3"] {
        q.add(WorkItem::created(k));
    }
    q.shut_down();
    q.add(WorkItem::created("ns/late"));

    let mut seen = Vec::new();
    while let Some(item) = next(&q).await {
        seen.push(item.key().to_string());
        q.done(&item);
    }
    assert_eq!(seen, vec!["ns/1", "ns/2", "ns/3"]);
    assert!(next(&q).await.is_none());
}

#[tokio::test]
async fn blocked_get_wakes_on_add() {
    let q = fast_queue();
    let waiter = tokio::spawn({
        let q = q.clone();
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.add(WorkItem::created("ns/a"));
    let got = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert_eq!(got, Some(WorkItem::created("ns/a")));
}

#[tokio::test]
async fn blocked_get_wakes_on_shutdown() {
    let q = fast_queue();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    for w in waiters {
        let got = timeout(Duration::from_secs(2), w).await.unwrap().unwrap();
        assert!(got.is_none());
    }
}

#[tokio::test]
async fn rate_limited_items_return_and_count_requeues() {
    let q = fast_queue();
    let item = WorkItem::updated("ns/c");
    q.add_rate_limited(item.clone());
    q.add_rate_limited(item.clone());
    assert_eq!(q.num_requeues(&item), 2);

    let got = next(&q).await.unwrap();
    assert_eq!(got, item);
    q.done(&got);

    q.forget(&item);
    assert_eq!(q.num_requeues(&item), 0);
}

#[tokio::test]
async fn delayed_adds_are_dropped_on_shutdown() {
    let q = fast_queue();
    q.add_after(WorkItem::created("ns/a"), Duration::from_millis(50));
    q.shut_down();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(next(&q).await.is_none());
}

#[tokio::test]
async fn delayed_add_does_not_replace_newer_pending_item() {
    let q = fast_queue();
    q.add_after(WorkItem::updated("ns/c"), Duration::from_millis(20));
    q.add(WorkItem::deleted("ns/c"));
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(q.len(), 1);
    let got = next(&q).await.unwrap();
    assert_eq!(got, WorkItem::deleted("ns/c"));
    q.done(&got);
    assert!(q.is_empty());
}

#[tokio::test]
async fn stale_queue_entry_does_not_block_key() {
    let q = fast_queue();
    q.add(WorkItem::created("ns/a"));
    // Unpaired done leaves a second queue entry for the same key.
    q.done(&WorkItem::created("ns/a"));
    let a = next(&q).await.unwrap();
    q.done(&a);

    q.add(WorkItem::created("ns/b"));
    let b = next(&q).await.unwrap();
    assert_eq!(b.key(), "ns/b");
    q.done(&b);

    q.add(WorkItem::updated("ns/a"));
    assert_eq!(next(&q).await, Some(WorkItem::updated("ns/a")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_see_each_key_once() {
    let q = fast_queue();
    for i in 0..200 {
        q.add(WorkItem::created(format!("ns/{i}")));
    }
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let q = q.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(item) = q.get().await {
                    mine.push(item.key().to_string());
                    q.done(&item);
                }
                mine
            })
        })
        .collect();
    while !q.is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    q.shut_down();

    let mut all = Vec::new();
    for w in workers {
        all.extend(timeout(Duration::from_secs(5), w).await.unwrap().unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
}
