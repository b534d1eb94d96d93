//! Raw connections for handlers
//!
//! Inbounds bind through [`Transport::bind`], outbounds dial a
//! [`Destination`] through [`Transport::connect`]. Bytes pass untouched;
//! ciphers and framing live in the protocol layer.

mod tcp;

pub use tcp::TcpTransport;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::common::{Destination, Result, Stream};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `destination`; domains are resolved by the OS resolver.
    async fn connect(&self, destination: &Destination) -> Result<Stream>;

    /// Create a listener on all interfaces. Port 0 picks a free port.
    async fn bind(&self, port: u16) -> Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<(Stream, SocketAddr)>;

    /// Address actually bound, with the chosen port when 0 was asked for
    fn local_addr(&self) -> Result<SocketAddr>;
}
