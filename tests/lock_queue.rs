use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use shardline::{error::LockError, lock::LockQueue};
use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

#[tokio::test]
async fn idle_key_is_granted_immediately() {
    let queue = LockQueue::new(1);
    let token = queue.acquire(7).await.unwrap();
    assert_eq!(token.key(), 7);
    assert!(queue.is_locked(7));
    assert_eq!(queue.len(), 1);

    drop(token);
    assert!(!queue.is_locked(7));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn waiters_are_granted_in_arrival_order() {
    let queue = LockQueue::new(1);
    let holder = queue.acquire(7).await.unwrap();

    let mut waiters: Vec<_> = (0..5).map(|_| task::spawn(queue.acquire(7))).collect();
    for waiter in &mut waiters {
        assert_pending!(waiter.poll());
    }
    assert_eq!(queue.waiting(7), 5);

    drop(holder);
    for i in 0..waiters.len() {
        for later in &waiters[i + 1..] {
            assert!(!later.is_woken());
        }
        assert!(waiters[i].is_woken());
        let token = assert_ready_ok!(waiters[i].poll());
        for later in &mut waiters[i + 1..] {
            assert_pending!(later.poll());
        }
        drop(token);
    }

    assert!(!queue.is_locked(7));
}

#[tokio::test]
async fn keys_are_independent() {
    let queue = LockQueue::new(1);
    let _one = queue.acquire(1).await.unwrap();

    let mut two = task::spawn(queue.acquire(2));
    let token = assert_ready_ok!(two.poll());
    assert_eq!(token.key(), 2);
}

#[tokio::test]
async fn try_acquire_does_not_queue() {
    let queue = LockQueue::new(1);
    let token = queue.try_acquire(3).unwrap();
    assert!(queue.try_acquire(3).is_none());
    assert_eq!(queue.waiting(3), 0);

    token.release();
    assert!(queue.try_acquire(3).is_some());
}

#[tokio::test]
async fn dropped_waiters_are_skipped() {
    let queue = LockQueue::new(1);
    let holder = queue.acquire(9).await.unwrap();

    let mut gone = task::spawn(queue.acquire(9));
    let mut next = task::spawn(queue.acquire(9));
    assert_pending!(gone.poll());
    assert_pending!(next.poll());
    assert_eq!(queue.waiting(9), 2);
    drop(gone);
    assert_eq!(queue.waiting(9), 1);

    drop(holder);
    let token = assert_ready_ok!(next.poll());
    drop(token);
    assert!(!queue.is_locked(9));
}

#[tokio::test]
async fn dispose_wakes_waiters() {
    let queue = LockQueue::new(1);
    let holder = queue.acquire(5).await.unwrap();

    let mut waiter = task::spawn(queue.acquire(5));
    assert_pending!(waiter.poll());

    queue.dispose();
    assert!(waiter.is_woken());
    assert_eq!(assert_ready!(waiter.poll()).unwrap_err(), LockError::Disposed);

    // releasing a token from before the teardown is harmless
    drop(holder);
    assert!(queue.is_disposed());
    assert_eq!(queue.acquire(5).await.unwrap_err(), LockError::Disposed);
    assert!(queue.try_acquire(6).is_none());
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_gives_up_its_place() {
    let queue = LockQueue::new(1);
    let holder = queue.acquire(4).await.unwrap();

    let err = queue
        .acquire_timeout(4, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, LockError::Timeout);

    drop(holder);
    assert!(!queue.is_locked(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_holder_per_key() {
    let queue = LockQueue::new(1);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let _token = queue.acquire(1).await.unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
}
