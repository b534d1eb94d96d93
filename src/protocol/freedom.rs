//! Freedom - connects straight to the destination
//!
//! TCP destinations get a plain connection with one pump per direction.
//! UDP destinations get a connected datagram socket: every request buffer
//! is one datagram, every datagram received becomes one response buffer.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::buf::{Buffer, BufferPools, SizeClass};
use crate::common::{Destination, Error, Packet, Result, Stream};
use crate::ray::{ray_to_writer, reader_to_ray, OutboundRay, Receiver, Sender};
use crate::transport::{TcpTransport, Transport};

use super::OutboundHandler;

/// How long a UDP session waits for the next response datagram
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest payload a single IPv4 UDP datagram can carry
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Direct outbound
pub struct Freedom {
    pools: BufferPools,
    transport: Arc<dyn Transport>,
    udp_idle_timeout: Duration,
}

impl Freedom {
    pub fn new(pools: BufferPools) -> Self {
        Self {
            pools,
            transport: Arc::new(TcpTransport::new()),
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }

    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    async fn dispatch_tcp(&self, mut packet: Packet, ray: OutboundRay) -> Result<()> {
        let destination = packet.destination().clone();
        let (mut request, response) = ray.split();

        let stream = match self.transport.connect(&destination).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Freedom: failed to connect to {}: {}", destination, e);
                return Err(e);
            }
        };
        info!("Freedom: opened connection to {}", destination);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let pools = &self.pools;

        let upload = async {
            let result = upload_tcp(&mut packet, &mut request, &mut writer).await;
            if let Err(e) = writer.shutdown().await {
                debug!("Freedom: shutdown to {} failed: {}", destination, e);
            }
            result
        };
        let download = async move {
            let result = reader_to_ray(pools, SizeClass::Medium, &mut reader, &response, None).await;
            response.close();
            result
        };

        let (up, down) = tokio::join!(upload, download);
        let (up, down) = (up?, down?);
        debug!("Freedom: closed {} (up {} down {})", destination, up, down);
        Ok(())
    }

    async fn dispatch_udp(&self, mut packet: Packet, ray: OutboundRay) -> Result<()> {
        let destination = packet.destination().clone();
        let (mut request, response) = ray.split();

        let socket = match connect_udp(&destination).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Freedom: failed to reach {}: {}", destination, e);
                return Err(e);
            }
        };
        let socket = &socket;
        debug!("Freedom: UDP session to {}", destination);

        let upload = async {
            let mut total = 0u64;
            if let Some(chunk) = packet.take_chunk() {
                total += send_datagram(socket, &destination, chunk).await?;
            }
            if packet.more_chunks() {
                while let Some(buffer) = request.recv().await {
                    total += send_datagram(socket, &destination, buffer).await?;
                }
            }
            Ok::<_, Error>(total)
        };
        let download = async move {
            let result = self.receive_datagrams(socket, &response).await;
            response.close();
            result
        };

        let (up, down) = tokio::join!(upload, download);
        let (up, down) = (up?, down?);
        debug!("Freedom: UDP session to {} done (up {} down {})", destination, up, down);
        Ok(())
    }

    /// Forward datagrams until none arrives within the idle timeout.
    async fn receive_datagrams(&self, socket: &UdpSocket, response: &Sender) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let mut buffer = self.pools.large();
            let received =
                tokio::time::timeout(self.udp_idle_timeout, socket.recv(buffer.spare_mut())).await;
            let n = match received {
                Ok(n) => n?,
                Err(_) => return Ok(total),
            };
            buffer.commit(n);
            total += n as u64;
            response.send(buffer).await?;
        }
    }
}

#[async_trait]
impl OutboundHandler for Freedom {
    async fn dispatch(&self, first_packet: Packet, ray: OutboundRay) -> Result<()> {
        if first_packet.destination().is_udp() {
            self.dispatch_udp(first_packet, ray).await
        } else {
            self.dispatch_tcp(first_packet, ray).await
        }
    }
}

async fn upload_tcp(
    packet: &mut Packet,
    request: &mut Receiver,
    writer: &mut WriteHalf<Stream>,
) -> Result<u64> {
    let mut total = 0u64;
    if let Some(chunk) = packet.take_chunk() {
        writer.write_all(chunk.bytes()).await?;
        writer.flush().await?;
        total += chunk.len() as u64;
    }
    if packet.more_chunks() {
        total += ray_to_writer(request, writer).await?;
    }
    Ok(total)
}

async fn connect_udp(destination: &Destination) -> Result<UdpSocket> {
    let target = match destination.socket_addr() {
        Some(addr) => addr,
        None => tokio::net::lookup_host(destination.host_port())
            .await?
            .next()
            .ok_or_else(|| Error::Protocol(format!("no address for {}", destination.address)))?,
    };
    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Send one buffer as one datagram. Payloads that would need IP
/// fragmentation are dropped.
async fn send_datagram(socket: &UdpSocket, destination: &Destination, buffer: Buffer) -> Result<u64> {
    if buffer.len() > MAX_UDP_PAYLOAD {
        warn!(
            "Freedom: dropping oversized UDP payload ({} bytes) to {}",
            buffer.len(),
            destination
        );
        return Ok(0);
    }
    let n = socket.send(buffer.bytes()).await?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::ray::new_ray;
    use std::net::IpAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn buffer(pools: &BufferPools, data: &[u8]) -> Buffer {
        let mut buffer = pools.small();
        buffer.append(data).unwrap();
        buffer
    }

    async fn collect(receiver: &mut Receiver) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(buffer) = receiver.recv().await {
            out.extend_from_slice(buffer.bytes());
        }
        out
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            let mut reply = b"Processed: ".to_vec();
            reply.extend_from_slice(&received);
            stream.write_all(&reply).await.unwrap();
        });

        let pools = BufferPools::default();
        let (inbound, outbound) = new_ray();
        let (request, mut response) = inbound.split();
        let packet = Packet::new(
            Destination::tcp(LOCALHOST, port),
            Some(buffer(&pools, b"Data to be ")),
            true,
        );

        let freedom = Freedom::new(pools.clone());
        let handler = tokio::spawn(async move { freedom.dispatch(packet, outbound).await });

        request.send(buffer(&pools, b"sent to remote")).await.unwrap();
        request.close();

        assert_eq!(collect(&mut response).await, b"Processed: Data to be sent to remote");
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_closes_response() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let pools = BufferPools::default();
        let (inbound, outbound) = new_ray();
        let (_request, mut response) = inbound.split();
        let packet = Packet::new(Destination::tcp(LOCALHOST, port), Some(buffer(&pools, b"x")), false);

        let result = Freedom::new(pools).dispatch(packet, outbound).await;
        assert!(result.is_err());
        assert!(response.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_udp_send_and_receive() {
        let server = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = b"Processed: ".to_vec();
            reply.extend_from_slice(&buf[..n]);
            server.send_to(&reply, peer).await.unwrap();
        });

        let pools = BufferPools::default();
        let (inbound, outbound) = new_ray();
        let (_request, mut response) = inbound.split();
        let packet = Packet::new(
            Destination::udp(Address::from(LOCALHOST), port),
            Some(buffer(&pools, b"Data to be sent to remote")),
            false,
        );

        let freedom = Freedom::new(pools).with_udp_idle_timeout(Duration::from_millis(300));
        let handler = tokio::spawn(async move { freedom.dispatch(packet, outbound).await });

        let reply = response.recv().await.unwrap();
        assert_eq!(reply.bytes(), b"Processed: Data to be sent to remote");
        assert!(response.recv().await.is_none());
        handler.await.unwrap().unwrap();
    }
}
