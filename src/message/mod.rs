//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write tagged `send`
//! and `recv` operations for a given transport layer (an in-process channel
//! transport is included). The trait then provides default implementations
//! for broadcast, reduce, and reduce-all operations.
//!

pub mod comm;
pub mod local;
pub mod util;

pub use comm::{Communicator, Tag};
pub use local::LocalCommunicator;
