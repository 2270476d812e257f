//! Bounded reuse of message instances.
//!
//! Decoding and encoding messages on a busy connection would otherwise allocate one object per frame. The
//! [`MessagePool`] keeps returned instances in a queue per concrete type and hands them out again on the next rent.
//! A single counter across all types bounds how many instances are retained; returns beyond it are dropped.
//!
//! The pool is owned by one task at a time and takes `&mut self`. Share it behind a mutex if several tasks need it.
//!
//! # Example
//!
//! ```
//! use shardline::message::{pool::MessagePool, Message, PoolFlag};
//!
//! #[derive(Message, Default)]
//! #[message(op_code = 7)]
//! struct Ping {
//!     #[message(pool_flag)]
//!     pooled: PoolFlag,
//! }
//!
//! let mut pool = MessagePool::new();
//! let ping = pool.rent::<Ping>();
//! let addr = &*ping as *const Ping;
//!
//! assert!(pool.return_message(ping));
//! let again = pool.rent::<Ping>();
//! assert_eq!(&*again as *const Ping, addr);
//! ```

use std::{
    any::{type_name, TypeId},
    collections::{HashMap, VecDeque},
    fmt,
};

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::error::PoolError;

use super::{downcast, Message};

/// Configuration for a [`MessagePool`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of instances retained across all message types.
    pub max_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_capacity: u16::MAX as usize,
        }
    }
}

struct Factory {
    type_name: &'static str,
    create: fn() -> Box<dyn Message>,
}

fn create<T: Message + Default>() -> Box<dyn Message> {
    Box::new(T::default())
}

/// A pool of reusable message instances.
pub struct MessagePool {
    config: PoolConfig,
    pooled: usize,
    queues: HashMap<TypeId, VecDeque<Box<dyn Message>>>,
    factories: HashMap<TypeId, Factory>,
    op_codes: HashMap<u32, TypeId>,
}

impl MessagePool {
    /// Creates an empty pool with the default capacity.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Creates an empty pool.
    pub fn with_config(config: PoolConfig) -> Self {
        MessagePool {
            config,
            pooled: 0,
            queues: HashMap::new(),
            factories: HashMap::new(),
            op_codes: HashMap::new(),
        }
    }

    /// Registers `T` so it can be rented by [`TypeId`] or op code.
    ///
    /// Registration happens once per type; renting `T` directly registers it as well. Returns `true` if `T` was
    /// not registered before.
    pub fn register<T>(&mut self) -> bool
    where
        T: Message + Default,
    {
        let type_id = TypeId::of::<T>();
        if self.factories.contains_key(&type_id) {
            return false;
        }

        let op_code = T::default().op_code();
        if let Some(existing) = self.op_codes.insert(op_code, type_id) {
            if let Some(factory) = self.factories.get(&existing) {
                warn!(
                    op_code,
                    previous = factory.type_name,
                    type_name = type_name::<T>(),
                    "op code registered twice, keeping the newer type"
                );
            }
        }

        self.factories.insert(
            type_id,
            Factory {
                type_name: type_name::<T>(),
                create: create::<T>,
            },
        );
        true
    }

    /// Returns `true` if `T` has been registered.
    pub fn is_registered<T: Message>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<T>())
    }

    /// Rents an instance of `T`, reusing a pooled one when available.
    pub fn rent<T>(&mut self) -> Box<T>
    where
        T: Message + Default,
    {
        self.register::<T>();

        if let Some(msg) = self.pop(TypeId::of::<T>()) {
            match downcast::<T>(msg) {
                Ok(mut msg) => {
                    msg.pool_flag_mut().set_on_loan(true);
                    return msg;
                }
                Err(_) => {
                    error!(type_name = type_name::<T>(), "pooled message had the wrong type");
                }
            }
        }

        let mut msg = Box::<T>::default();
        msg.pool_flag_mut().set_on_loan(true);
        msg
    }

    /// Rents an instance of the registered type `type_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnregisteredType`] if the type was never registered.
    pub fn rent_dyn(&mut self, type_id: TypeId) -> Result<Box<dyn Message>, PoolError> {
        let mut msg = match self.pop(type_id) {
            Some(msg) => msg,
            None => {
                let factory = self
                    .factories
                    .get(&type_id)
                    .ok_or(PoolError::UnregisteredType { type_id })?;
                (factory.create)()
            }
        };

        msg.pool_flag_mut().set_on_loan(true);
        Ok(msg)
    }

    /// Rents an instance of the registered type using `op_code` on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownOpCode`] if no registered type uses `op_code`.
    pub fn rent_by_op_code(&mut self, op_code: u32) -> Result<Box<dyn Message>, PoolError> {
        let type_id = *self
            .op_codes
            .get(&op_code)
            .ok_or(PoolError::UnknownOpCode(op_code))?;
        self.rent_dyn(type_id)
    }

    fn pop(&mut self, type_id: TypeId) -> Option<Box<dyn Message>> {
        let msg = self.queues.get_mut(&type_id)?.pop_front()?;
        self.pooled -= 1;
        Some(msg)
    }

    /// Returns a rented message to the pool.
    ///
    /// Messages that are not on loan from a pool are ignored, which covers messages built by hand, copies of rented
    /// messages, and messages already returned. When the pool is full the message is dropped. Returns `true` if the
    /// message was kept for reuse.
    pub fn return_message<T: Message>(&mut self, msg: Box<T>) -> bool {
        self.return_dyn(msg)
    }

    /// Returns a rented message of any type to the pool.
    ///
    /// See [`return_message`](MessagePool::return_message).
    pub fn return_dyn(&mut self, mut msg: Box<dyn Message>) -> bool {
        if !msg.pool_flag().is_on_loan() {
            trace!(op_code = msg.op_code(), "ignoring message not on loan");
            return false;
        }

        msg.pool_flag_mut().set_on_loan(false);
        if self.pooled >= self.config.max_capacity {
            trace!(op_code = msg.op_code(), "message pool full, dropping message");
            return false;
        }

        let type_id = (*msg).as_any().type_id();
        self.queues.entry(type_id).or_default().push_back(msg);
        self.pooled += 1;
        true
    }

    /// Returns the number of instances currently held by the pool.
    pub fn len(&self) -> usize {
        self.pooled
    }

    /// Returns `true` if the pool holds no instances.
    pub fn is_empty(&self) -> bool {
        self.pooled == 0
    }

    /// Returns the number of instances held for type `T`.
    pub fn len_of<T: Message>(&self) -> usize {
        self.queues
            .get(&TypeId::of::<T>())
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Returns the maximum number of instances the pool retains.
    pub fn capacity(&self) -> usize {
        self.config.max_capacity
    }

    /// Drops every pooled instance and forgets all registrations.
    pub fn clear(&mut self) {
        self.pooled = 0;
        self.queues.clear();
        self.factories.clear();
        self.op_codes.clear();
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePool")
            .field("pooled", &self.pooled)
            .field("capacity", &self.config.max_capacity)
            .field("types", &self.factories.len())
            .finish()
    }
}
