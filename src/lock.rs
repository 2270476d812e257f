//! Keyed asynchronous mutual exclusion.
//!
//! A [`LockQueue`] hands out at most one [`LockToken`] per key at a time. Callers asking for a busy key are queued
//! and suspended, and are granted the key in strict arrival order as each holder drops its token. Keys are
//! independent of each other: holding key `1` never delays a caller waiting for key `2`.
//!
//! Every subsystem that needs per-key serialization owns its own queue. The
//! [`AddressableDirectory`](crate::addressable::AddressableDirectory) is the main user.
//!
//! # Example
//!
//! ```
//! use shardline::lock::LockQueue;
//!
//! # tokio_test::block_on(async {
//! let queue = LockQueue::new(1);
//!
//! let token = queue.acquire(42).await?;
//! assert!(queue.is_locked(42));
//! assert!(queue.try_acquire(42).is_none());
//!
//! drop(token);
//! assert!(!queue.is_locked(42));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::LockError;

/// A queue of per-key locks for asynchronous callers.
///
/// Cloning a `LockQueue` is cheap and every clone refers to the same set of keys.
#[derive(Clone)]
pub struct LockQueue {
    shared: Arc<Shared>,
}

struct Shared {
    queue_type: u64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// A key present in this map is held. Its queue holds the callers waiting for it.
    keys: HashMap<u64, VecDeque<oneshot::Sender<LockToken>>>,
    disposed: bool,
}

impl LockQueue {
    /// Creates a new lock queue.
    ///
    /// `queue_type` identifies the owning subsystem and is only used for diagnostics.
    pub fn new(queue_type: u64) -> Self {
        LockQueue {
            shared: Arc::new(Shared {
                queue_type,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns the identifier this queue was created with.
    pub fn queue_type(&self) -> u64 {
        self.shared.queue_type
    }

    /// Acquires the lock for `key`, waiting behind any earlier callers.
    ///
    /// An idle key is granted without suspending. If the caller stops polling the returned future while queued,
    /// its place is given up and the key moves on to the next waiter.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Disposed`] if the queue was disposed before the key could be granted.
    pub async fn acquire(&self, key: u64) -> Result<LockToken, LockError> {
        let rx = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(LockError::Disposed);
            }

            match state.keys.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(VecDeque::new());
                    trace!(queue_type = self.shared.queue_type, key, "lock granted");
                    return Ok(LockToken::new(Arc::downgrade(&self.shared), key));
                }
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push_back(tx);
                    trace!(
                        queue_type = self.shared.queue_type,
                        key,
                        waiting = entry.get().len(),
                        "lock busy, queued"
                    );
                    rx
                }
            }
        };

        rx.await.map_err(|_| LockError::Disposed)
    }

    /// Acquires the lock for `key`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the key was not granted in time, or [`LockError::Disposed`] if the queue
    /// was disposed.
    pub async fn acquire_timeout(
        &self,
        key: u64,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        match tokio::time::timeout(timeout, self.acquire(key)).await {
            Ok(res) => res,
            Err(_) => {
                debug!(
                    queue_type = self.shared.queue_type,
                    key, "timed out waiting for lock"
                );
                Err(LockError::Timeout)
            }
        }
    }

    /// Acquires the lock for `key` only if it is idle.
    pub fn try_acquire(&self, key: u64) -> Option<LockToken> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return None;
        }

        match state.keys.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(VecDeque::new());
                Some(LockToken::new(Arc::downgrade(&self.shared), key))
            }
            Entry::Occupied(_) => None,
        }
    }

    /// Returns `true` if a token for `key` is currently held.
    pub fn is_locked(&self, key: u64) -> bool {
        self.shared.state.lock().keys.contains_key(&key)
    }

    /// Returns the number of callers queued behind the current holder of `key`.
    ///
    /// Callers that gave up waiting are not counted.
    pub fn waiting(&self, key: u64) -> usize {
        self.shared
            .state
            .lock()
            .keys
            .get(&key)
            .map(|waiters| waiters.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Returns the number of keys currently held.
    pub fn len(&self) -> usize {
        self.shared.state.lock().keys.len()
    }

    /// Returns `true` if no key is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`dispose`](LockQueue::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// Tears the queue down.
    ///
    /// All queued callers are woken with [`LockError::Disposed`], outstanding tokens become no-ops when released,
    /// and later acquisitions fail immediately.
    pub fn dispose(&self) {
        let keys = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.keys)
        };

        let waiters: usize = keys.values().map(VecDeque::len).sum();
        debug!(
            queue_type = self.shared.queue_type,
            held = keys.len(),
            waiters,
            "lock queue disposed"
        );
        // Dropping the senders outside the state lock wakes every waiter.
        drop(keys);
    }
}

impl Shared {
    fn release(self: &Arc<Self>, key: u64) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                let Entry::Occupied(mut entry) = state.keys.entry(key) else {
                    return;
                };
                match entry.get_mut().pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        entry.remove();
                        trace!(queue_type = self.queue_type, key, "lock idle");
                        return;
                    }
                }
            };

            // The key stays marked as held while the next token is in flight.
            match waiter.send(LockToken::new(Arc::downgrade(self), key)) {
                Ok(()) => {
                    trace!(queue_type = self.queue_type, key, "lock handed to next waiter");
                    return;
                }
                Err(mut token) => {
                    // Waiter stopped waiting.
                    token.released = true;
                }
            }
        }
    }
}

impl fmt::Debug for LockQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LockQueue")
            .field("queue_type", &self.shared.queue_type)
            .field("held", &state.keys.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Receipt for a key acquired from a [`LockQueue`].
///
/// The key is released when the token is dropped or [`release`](LockToken::release)d, whichever comes first, which
/// hands it to the next queued caller.
#[must_use = "the lock is released as soon as the token is dropped"]
pub struct LockToken {
    queue: Weak<Shared>,
    key: u64,
    released: bool,
}

impl LockToken {
    fn new(queue: Weak<Shared>, key: u64) -> Self {
        LockToken {
            queue,
            key,
            released: false,
        }
    }

    /// Returns the key this token holds.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Releases the key.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        if let Some(shared) = self.queue.upgrade() {
            shared.release(self.key);
        }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}
