//! TCP transport with Nagle disabled on every connection

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::common::{Address, Destination, IntoStream, Result, Stream};

use super::{Listener, Transport};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, destination: &Destination) -> Result<Stream> {
        let stream = match &destination.address {
            Address::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, destination.port)).await?,
            Address::Domain(domain) => {
                TcpStream::connect((domain.as_str(), destination.port)).await?
            }
        };

        stream.set_nodelay(true)?;

        Ok(stream.into_stream())
    }

    async fn bind(&self, port: u16) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&self) -> Result<(Stream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream.into_stream(), addr))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
