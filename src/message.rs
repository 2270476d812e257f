//! Messages exchanged between nodes and the pool that recycles them.
//!
//! A message is any type implementing [`Message`]. Most types derive it:
//!
//! ```
//! use shardline::message::{Message, PoolFlag};
//!
//! #[derive(Message, Default)]
//! #[message(op_code = 10_001)]
//! struct MoveTo {
//!     #[message(pool_flag)]
//!     pooled: PoolFlag,
//!     x: f32,
//!     y: f32,
//! }
//!
//! let msg = MoveTo::default();
//! assert_eq!(msg.op_code(), 10_001);
//! assert!(!msg.pool_flag().is_on_loan());
//! ```
//!
//! Pooling is handled by [`MessagePool`](pool::MessagePool).

pub mod pool;

use std::any::Any;

#[cfg(feature = "macros")]
pub use shardline_macros::Message;

/// Marks whether a message instance is currently on loan from a [`MessagePool`](pool::MessagePool).
///
/// Only instances handed out by the pool are on loan, and only those are accepted back. A returned instance is
/// no longer on loan, so returning it twice is a no-op.
///
/// Cloning a flag yields one that is *not* on loan: a copy of a rented message never came from the pool, so it
/// cannot be returned in place of the original.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PoolFlag(bool);

impl PoolFlag {
    /// Returns `true` if the owning message is on loan from a pool.
    pub fn is_on_loan(&self) -> bool {
        self.0
    }

    pub(crate) fn set_on_loan(&mut self, on_loan: bool) {
        self.0 = on_loan;
    }
}

impl Clone for PoolFlag {
    fn clone(&self) -> Self {
        PoolFlag(false)
    }
}

/// Conversion helpers to [`Any`] for message trait objects.
///
/// Implemented for every `'static + Send` type.
pub trait AsAny: Any + Send {
    /// Borrows `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;

    /// Converts a boxed `self` into a boxed `dyn Any`.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> AsAny for T
where
    T: Any + Send,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A message which can be framed on the wire and recycled by a [`MessagePool`](pool::MessagePool).
pub trait Message: AsAny {
    /// The op code identifying this message type on the wire.
    fn op_code(&self) -> u32;

    /// Returns the message's pool flag.
    fn pool_flag(&self) -> &PoolFlag;

    /// Returns the message's pool flag mutably.
    fn pool_flag_mut(&mut self) -> &mut PoolFlag;
}

impl dyn Message {
    /// Returns `true` if the boxed message is of type `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcasts a reference to a concrete message type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// Downcasts a boxed message to a concrete type, handing the box back if the type does not match.
pub fn downcast<T: Message>(msg: Box<dyn Message>) -> Result<Box<T>, Box<dyn Message>> {
    if msg.is::<T>() {
        AsAny::into_any(msg)
            .downcast::<T>()
            .map_err(|_| unreachable!("type was checked above"))
    } else {
        Err(msg)
    }
}
