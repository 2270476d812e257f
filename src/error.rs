//! Defines error handling constructs for shardline.
//!
//! Each subsystem has its own error enum. Only contract violations reach callers as `Err` values;
//! transient I/O faults, protocol faults and coordination anomalies are logged where they happen and turned
//! into connection teardown or a no-op, so most operations in this crate never return these types at all.

use std::{any::TypeId, error, fmt, io};

/// Error returned when acquiring a key from a [`LockQueue`](crate::lock::LockQueue).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockError {
    /// The lock queue was disposed before or while waiting for the key.
    Disposed,
    /// The key was not granted within the requested timeout.
    Timeout,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Disposed => write!(f, "lock queue disposed"),
            LockError::Timeout => write!(f, "timed out waiting for lock"),
        }
    }
}

impl error::Error for LockError {}

/// Error that can occur when renting a message from a [`MessagePool`](crate::message::pool::MessagePool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// The type was never registered with the pool, so no factory exists for it.
    UnregisteredType {
        /// The requested type.
        type_id: TypeId,
    },
    /// No registered message type uses the requested op code.
    UnknownOpCode(u32),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::UnregisteredType { type_id } => {
                write!(f, "{type_id:?} is not a registered message type")
            }
            PoolError::UnknownOpCode(op_code) => write!(f, "unknown message op code {op_code}"),
        }
    }
}

impl error::Error for PoolError {}

/// A malformed frame was found in the inbound byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The header declared a payload larger than the configured maximum.
    PacketTooLarge {
        /// Declared payload length.
        len: usize,
        /// Maximum accepted payload length.
        max: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PacketTooLarge { len, max } => {
                write!(f, "packet of {len} bytes exceeds the maximum of {max} bytes")
            }
        }
    }
}

impl error::Error for FrameError {}

/// Error returned by the client transport.
#[derive(Debug)]
pub enum NetworkError {
    /// `connect` was called on a transport that was already used. A new instance is needed to reconnect.
    AlreadyConnected,
    /// The transport has been disposed.
    Disposed,
    /// An IO failure.
    Io(io::Error),
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::AlreadyConnected => write!(
                f,
                "client network has already been connected; create a new instance to connect again"
            ),
            NetworkError::Disposed => write!(f, "client network disposed"),
            NetworkError::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            NetworkError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Error returned by the [`AddressableDirectory`](crate::addressable::AddressableDirectory).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectoryError {
    /// The underlying lock could not be acquired.
    Lock(LockError),
}

impl From<LockError> for DirectoryError {
    fn from(err: LockError) -> Self {
        DirectoryError::Lock(err)
    }
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryError::Lock(err) => write!(f, "addressable lock failed: {err}"),
        }
    }
}

impl error::Error for DirectoryError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            DirectoryError::Lock(err) => Some(err),
        }
    }
}
