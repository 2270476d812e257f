//! Directory of addressable actors and the route that currently owns each of them.
//!
//! An addressable actor keeps a stable id while it migrates between processes. The [`AddressableDirectory`] maps
//! that id to the route id of its current owner. Every read and write of an id runs under that id's lock in a
//! [`LockQueue`], so a lookup never observes a mapping while a migration of the same id is in progress.
//!
//! Migrations that span several awaits hold the id explicitly with [`AddressableDirectory::lock`] and finish with
//! [`AddressableDirectory::unlock`], which can install the new route in the same step.
//!
//! # Example
//!
//! ```
//! use shardline::addressable::AddressableDirectory;
//!
//! # tokio_test::block_on(async {
//! let directory = AddressableDirectory::new();
//! directory.add(42, 7, true).await;
//! assert_eq!(directory.get(42).await, 7);
//!
//! directory.lock(42).await?;
//! directory.unlock(42, 99, "migrate");
//! assert_eq!(directory.get(42).await, 99);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::fmt;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::{error::DirectoryError, lifecycle::Component, lock::LockQueue, lock::LockToken};

/// Stable id of an addressable actor.
pub type AddressableId = u64;

/// Id of the process currently owning an addressable actor. `0` means unbound.
pub type RouteId = u64;

/// Identifies the directory's lock queue in diagnostics.
const ADDRESSABLE_LOCK_QUEUE: u64 = 0x4144_4452; // "ADDR"

/// Maps addressable actor ids to the route currently owning them.
pub struct AddressableDirectory {
    lock_queue: LockQueue,
    routes: DashMap<AddressableId, RouteId>,
    explicit_locks: DashMap<AddressableId, LockToken>,
}

impl AddressableDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        AddressableDirectory {
            lock_queue: LockQueue::new(ADDRESSABLE_LOCK_QUEUE),
            routes: DashMap::new(),
            explicit_locks: DashMap::new(),
        }
    }

    /// Binds `addressable_id` to `route_id`.
    ///
    /// When `lock` is `true` the id's lock is held for the write. Pass `false` only while already holding the id
    /// through [`lock`](AddressableDirectory::lock), otherwise the call would wait on itself.
    ///
    /// Failures are logged rather than returned, so a transient fault never stalls the caller.
    pub async fn add(&self, addressable_id: AddressableId, route_id: RouteId, lock: bool) {
        let _token = if lock {
            match self.lock_queue.acquire(addressable_id).await {
                Ok(token) => Some(token),
                Err(err) => {
                    error!(addressable_id, route_id, "addressable add failed: {err}");
                    return;
                }
            }
        } else {
            None
        };

        self.routes.insert(addressable_id, route_id);
        debug!(addressable_id, route_id, "addressable added");
    }

    /// Returns the route owning `addressable_id`, or `0` if it is unbound.
    ///
    /// Waits for any in-progress migration of the id to finish.
    pub async fn get(&self, addressable_id: AddressableId) -> RouteId {
        let _token = match self.lock_queue.acquire(addressable_id).await {
            Ok(token) => token,
            Err(err) => {
                error!(addressable_id, "addressable get failed: {err}");
                return 0;
            }
        };

        self.routes
            .get(&addressable_id)
            .map(|route_id| *route_id)
            .unwrap_or(0)
    }

    /// Unbinds `addressable_id`.
    pub async fn remove(&self, addressable_id: AddressableId) {
        let _token = match self.lock_queue.acquire(addressable_id).await {
            Ok(token) => token,
            Err(err) => {
                error!(addressable_id, "addressable remove failed: {err}");
                return;
            }
        };

        self.routes.remove(&addressable_id);
        debug!(
            addressable_id,
            remaining = self.routes.len(),
            "addressable removed"
        );
    }

    /// Holds `addressable_id` until [`unlock`](AddressableDirectory::unlock) is called for it.
    ///
    /// Other callers touching the id wait until then. Calls must be paired with `unlock` by the same logical
    /// caller; locking an id twice without unlocking it in between waits forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory was disposed.
    pub async fn lock(&self, addressable_id: AddressableId) -> Result<(), DirectoryError> {
        let token = self.lock_queue.acquire(addressable_id).await?;
        self.explicit_locks.insert(addressable_id, token);
        Ok(())
    }

    /// Releases an id held by [`lock`](AddressableDirectory::lock).
    ///
    /// A non-zero `route_id` replaces the id's route before the lock is released; `0` keeps the current route.
    /// `source` names the caller in the audit log. Unlocking an id that is not held is logged and does nothing.
    /// Returns `true` if the id was held.
    pub fn unlock(&self, addressable_id: AddressableId, route_id: RouteId, source: &str) -> bool {
        let Some((_, token)) = self.explicit_locks.remove(&addressable_id) else {
            error!(addressable_id, source, "addressable unlock not found");
            return false;
        };

        let old_route_id = self
            .routes
            .get(&addressable_id)
            .map(|route_id| *route_id)
            .unwrap_or(0);
        if route_id != 0 {
            self.routes.insert(addressable_id, route_id);
        }

        token.release();
        debug!(
            addressable_id,
            old_route_id, route_id, source, "addressable unlocked"
        );
        true
    }

    /// Returns `true` if `addressable_id` is held by [`lock`](AddressableDirectory::lock).
    pub fn is_locked(&self, addressable_id: AddressableId) -> bool {
        self.explicit_locks.contains_key(&addressable_id)
    }

    /// Returns the number of bound ids.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no id is bound.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Disposes the lock queue, drops every explicit lock and clears all routes.
    ///
    /// Callers waiting on an id are woken: lookups return `0` and explicit locks fail.
    pub fn dispose(&self) {
        // Disposing first keeps the dropped explicit locks from handing ids to waiters.
        self.lock_queue.dispose();
        self.explicit_locks.clear();
        self.routes.clear();
        debug!("addressable directory disposed");
    }
}

impl Default for AddressableDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for AddressableDirectory {
    fn name(&self) -> &'static str {
        "AddressableDirectory"
    }

    fn on_destroy(&self) {
        self.dispose();
    }
}

impl fmt::Debug for AddressableDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressableDirectory")
            .field("routes", &self.routes.len())
            .field("explicit_locks", &self.explicit_locks.len())
            .field("lock_queue", &self.lock_queue)
            .finish()
    }
}
