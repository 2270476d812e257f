use std::sync::Arc;

use shardline::{error::DirectoryError, error::LockError, AddressableDirectory, ComponentHost};
use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

#[tokio::test]
async fn add_get_remove() {
    let directory = AddressableDirectory::new();
    assert_eq!(directory.get(1).await, 0);

    directory.add(1, 10, true).await;
    directory.add(2, 20, true).await;
    assert_eq!(directory.get(1).await, 10);
    assert_eq!(directory.get(2).await, 20);
    assert_eq!(directory.len(), 2);

    directory.add(1, 11, true).await;
    assert_eq!(directory.get(1).await, 11);

    directory.remove(1).await;
    assert_eq!(directory.get(1).await, 0);
    assert_eq!(directory.len(), 1);
}

#[tokio::test]
async fn migration_race() {
    let directory = AddressableDirectory::new();
    directory.add(42, 7, true).await;

    directory.lock(42).await.unwrap();
    assert!(directory.is_locked(42));

    let mut second = task::spawn(directory.lock(42));
    assert_pending!(second.poll());
    let mut lookup = task::spawn(directory.get(42));
    assert_pending!(lookup.poll());

    assert!(directory.unlock(42, 99, "migrate"));
    assert!(second.is_woken());
    assert_ready_ok!(second.poll());
    // the lookup queued behind the second lock
    assert_pending!(lookup.poll());

    assert!(directory.unlock(42, 0, "migrate"));
    assert_eq!(assert_ready!(lookup.poll()), 99);
    assert_eq!(directory.get(42).await, 99);
}

#[tokio::test]
async fn unlock_without_lock_is_a_no_op() {
    let directory = AddressableDirectory::new();
    directory.add(5, 50, true).await;

    assert!(!directory.unlock(5, 60, "stray"));
    assert_eq!(directory.get(5).await, 50);
}

#[tokio::test]
async fn unlock_with_zero_keeps_the_route() {
    let directory = AddressableDirectory::new();
    directory.add(5, 50, true).await;

    directory.lock(5).await.unwrap();
    directory.unlock(5, 0, "abort");
    assert_eq!(directory.get(5).await, 50);
    assert!(!directory.is_locked(5));
}

#[tokio::test]
async fn add_without_locking_while_held() {
    let directory = AddressableDirectory::new();
    directory.lock(8).await.unwrap();
    directory.add(8, 80, false).await;
    directory.unlock(8, 0, "spawn");
    assert_eq!(directory.get(8).await, 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_and_gets() {
    let directory = Arc::new(AddressableDirectory::new());

    let tasks: Vec<_> = (0..16u64)
        .map(|id| {
            let directory = directory.clone();
            tokio::spawn(async move {
                for route in 1..=50u64 {
                    directory.add(id % 4, id * 1_000 + route, true).await;
                    let current = directory.get(id % 4).await;
                    assert_ne!(current, 0);
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(directory.len(), 4);
}

#[tokio::test]
async fn dispose_fails_pending_locks() {
    let directory = AddressableDirectory::new();
    directory.add(3, 30, true).await;
    directory.lock(3).await.unwrap();

    let mut waiter = task::spawn(directory.lock(3));
    assert_pending!(waiter.poll());
    let mut lookup = task::spawn(directory.get(3));
    assert_pending!(lookup.poll());

    directory.dispose();
    assert_eq!(
        assert_ready!(waiter.poll()),
        Err(DirectoryError::Lock(LockError::Disposed))
    );
    assert_eq!(assert_ready!(lookup.poll()), 0);
    assert!(directory.is_empty());
    assert!(!directory.is_locked(3));
}

#[tokio::test]
async fn host_disposes_the_directory() {
    let host = ComponentHost::new();
    let directory = host.add(Arc::new(AddressableDirectory::new()));
    directory.add(1, 10, true).await;

    host.destroy();
    assert!(directory.is_empty());
    assert_eq!(directory.get(1).await, 0);
    assert!(directory.lock(1).await.is_err());
}
