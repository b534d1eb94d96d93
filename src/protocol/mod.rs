//! Proxy Protocol Layer
//!
//! Handlers sit on either side of a ray:
//!
//! ```text
//! client -> InboundHandler -> PacketDispatcher -> OutboundHandler -> target
//!                      InboundRay  <======>  OutboundRay
//! ```
//!
//! An inbound handler decodes a client connection into a [`Packet`] and hands
//! it to the dispatcher, which picks an outbound handler and connects both
//! ends with a fresh ray.

mod blackhole;
mod freedom;
pub mod vmess;

#[cfg(test)]
pub(crate) mod testing;

pub use blackhole::Blackhole;
pub use freedom::Freedom;
pub use vmess::{VmessInbound, VmessOutbound};

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::common::{Packet, Result};
use crate::ray::{InboundRay, OutboundRay};

/// Accepts client connections.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Start accepting on `port` (0 picks a free one) and return the bound
    /// address. Connections are served in background tasks.
    async fn listen(&self, port: u16) -> Result<SocketAddr>;

    /// Stop accepting new connections. Established ones run to completion.
    fn close(&self);
}

/// Carries a packet to its target.
///
/// `dispatch` consumes the ray, so the response queue is closed exactly once
/// whichever way the handler returns.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn dispatch(&self, first_packet: Packet, ray: OutboundRay) -> Result<()>;
}

/// Binds an inbound connection to an outbound handler.
pub trait PacketDispatcher: Send + Sync {
    fn dispatch_to_outbound(&self, first_packet: Packet) -> InboundRay;
}
