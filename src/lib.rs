#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate self as shardline;

pub mod addressable;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod lock;
pub mod message;
pub mod network;
pub mod timer;

pub use addressable::AddressableDirectory;
pub use lifecycle::{Component, ComponentHost};
pub use lock::{LockQueue, LockToken};
pub use message::{pool::MessagePool, Message, PoolFlag};
pub use network::{ClientNetwork, ConnectCallbacks, Packet};
pub use timer::TimerScheduler;
