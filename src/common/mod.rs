//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - Stream: unified async I/O abstraction
//! - Destination: routing key (network + address + port)
//! - Packet: first chunk handed to the dispatcher
//! - retry: bounded retry with fixed backoff
//! - access: per-connection access log

pub mod access;
mod address;
mod destination;
mod packet;
pub mod retry;
mod stream;

pub use address::Address;
pub use destination::{Destination, Network};
pub use packet::Packet;
pub use stream::{IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
