//! Creation and teardown hooks for long-lived components.
//!
//! The directory and the client transport own resources which must be torn down exactly once: suspended lock
//! waiters, sockets, background loops. They implement [`Component`] and are registered into a [`ComponentHost`],
//! which runs `on_create` on registration and `on_destroy` in reverse registration order when the host is
//! destroyed or dropped.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::debug;

/// A component with lifecycle hooks.
pub trait Component: Send + Sync + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Called once when the component is registered into a host.
    fn on_create(&self) {}

    /// Called once when the owning host is destroyed.
    fn on_destroy(&self);
}

/// Owns a set of components and destroys them together.
#[derive(Default)]
pub struct ComponentHost {
    components: Mutex<Vec<Arc<dyn Component>>>,
    destroyed: AtomicBool,
}

impl ComponentHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `component`, calling its `on_create` hook, and returns it.
    ///
    /// Registering into a destroyed host destroys the component straight away.
    pub fn add<C: Component>(&self, component: Arc<C>) -> Arc<C> {
        component.on_create();
        debug!(component = component.name(), "component created");

        if self.destroyed.load(Ordering::Acquire) {
            component.on_destroy();
            return component;
        }

        self.components.lock().push(component.clone());
        component
    }

    /// Returns the number of live components.
    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    /// Returns `true` if the host has no live components.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the host has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Destroys every component in reverse registration order. Later calls do nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let components = std::mem::take(&mut *self.components.lock());
        for component in components.iter().rev() {
            component.on_destroy();
            debug!(component = component.name(), "component destroyed");
        }
    }
}

impl Drop for ComponentHost {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for ComponentHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHost")
            .field("components", &self.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Component for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn on_create(&self) {
            self.log.lock().push(format!("create {}", self.name));
        }

        fn on_destroy(&self) {
            self.log.lock().push(format!("destroy {}", self.name));
        }
    }

    #[test]
    fn destroys_in_reverse_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = ComponentHost::new();
        for name in ["a", "b", "c"] {
            host.add(Arc::new(Recorder {
                name,
                log: log.clone(),
            }));
        }
        assert_eq!(host.len(), 3);

        host.destroy();
        host.destroy();
        drop(host);

        assert_eq!(
            *log.lock(),
            ["create a", "create b", "create c", "destroy c", "destroy b", "destroy a"]
        );
    }

    #[test]
    fn late_components_are_destroyed_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = ComponentHost::new();
        host.destroy();

        host.add(Arc::new(Recorder {
            name: "late",
            log: log.clone(),
        }));
        assert!(host.is_empty());
        assert_eq!(*log.lock(), ["create late", "destroy late"]);
    }
}
