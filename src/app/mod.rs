//! Application Layer
//!
//! This module contains:
//! - Dispatcher: binds inbound packets to outbound handlers through rays
//! - InboundDetour: one VMess inbound per port of a range
//! - Runtime: configuration-driven construction of every handler

mod dispatcher;
mod inbound_detour;
mod runtime;

pub use dispatcher::Dispatcher;
pub use inbound_detour::InboundDetour;
pub use runtime::Runtime;
