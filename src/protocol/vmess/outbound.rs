//! VMess outbound handler
//!
//! Picks a server and one of its users at random, sends the request header
//! together with the first payload chunk, then pumps both directions. UDP
//! targets use the chunk stream so datagram boundaries survive the tunnel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::buf::{BufferPools, SizeClass};
use crate::common::{Destination, Error, Packet, Result, Stream};
use crate::crypto::CryptionWriter;
use crate::protocol::OutboundHandler;
use crate::ray::{ray_to_writer, reader_to_ray, OutboundRay, Receiver};
use crate::transport::{TcpTransport, Transport};

use super::{
    chunks_to_ray, end_of_stream, random_timestamp, ray_to_chunks, unix_now, write_chunk,
    AuthChunkReader, ClientSession, RequestHeader, RequestOption, ResponseCommand, User,
};

/// A server to tunnel through, with the accounts it accepts
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub destination: Destination,
    pub users: Vec<Arc<User>>,
}

impl ServerSpec {
    pub fn new(destination: Destination, users: impl IntoIterator<Item = User>) -> Self {
        Self {
            destination,
            users: users.into_iter().map(Arc::new).collect(),
        }
    }
}

struct ServerEntry {
    spec: ServerSpec,
    /// `None` for configured servers; switch-account servers expire
    valid_until: Option<Instant>,
}

impl ServerEntry {
    fn is_valid(&self, now: Instant) -> bool {
        self.valid_until.map_or(true, |until| now < until)
    }
}

pub struct VmessOutbound {
    servers: RwLock<Vec<ServerEntry>>,
    pools: BufferPools,
    transport: Arc<dyn Transport>,
}

impl VmessOutbound {
    pub fn new(servers: Vec<ServerSpec>, pools: BufferPools) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::Config("vmess outbound needs at least one server".into()));
        }
        if let Some(server) = servers.iter().find(|s| s.users.is_empty()) {
            return Err(Error::Config(format!(
                "vmess server {} has no users",
                server.destination
            )));
        }
        let servers = servers
            .into_iter()
            .map(|spec| ServerEntry {
                spec,
                valid_until: None,
            })
            .collect();
        Ok(Self {
            servers: RwLock::new(servers),
            pools,
            transport: Arc::new(TcpTransport::new()),
        })
    }

    /// Servers currently eligible for new connections
    pub fn servers(&self) -> Vec<ServerSpec> {
        let now = Instant::now();
        self.servers
            .read()
            .iter()
            .filter(|entry| entry.is_valid(now))
            .map(|entry| entry.spec.clone())
            .collect()
    }

    fn pick(&self) -> Result<(Destination, Arc<User>)> {
        let now = Instant::now();
        let servers = self.servers.read();
        let live: Vec<&ServerEntry> = servers.iter().filter(|e| e.is_valid(now)).collect();

        let mut rng = rand::thread_rng();
        let entry = live
            .choose(&mut rng)
            .ok_or_else(|| Error::Config("no vmess server available".into()))?;
        let user = entry
            .spec
            .users
            .choose(&mut rng)
            .ok_or_else(|| Error::Config("vmess server without users".into()))?;
        Ok((entry.spec.destination.clone(), Arc::clone(user)))
    }

    fn handle_command(&self, server: &Destination, command: ResponseCommand) {
        match command {
            ResponseCommand::SwitchAccount(cmd) => {
                let address = cmd.host.unwrap_or_else(|| server.address.clone());
                let destination = Destination::tcp(address, cmd.port);
                let now = Instant::now();
                let valid_until = now + Duration::from_secs(u64::from(cmd.valid_min) * 60);
                info!(
                    "VMess out: switching to {} for {} minutes",
                    destination, cmd.valid_min
                );

                let mut servers = self.servers.write();
                servers.retain(|entry| entry.is_valid(now));
                let existing = servers.iter_mut().find(|entry| {
                    entry.valid_until.is_some()
                        && entry.spec.destination == destination
                        && entry.spec.users.iter().any(|u| *u.id.uuid() == cmd.id)
                });
                match existing {
                    Some(entry) => entry.valid_until = Some(valid_until),
                    None => {
                        let user = User::new(cmd.id, cmd.alter_ids, cmd.level, "");
                        servers.push(ServerEntry {
                            spec: ServerSpec::new(destination, [user]),
                            valid_until: Some(valid_until),
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl OutboundHandler for VmessOutbound {
    async fn dispatch(&self, mut first_packet: Packet, ray: OutboundRay) -> Result<()> {
        let (mut request, response) = ray.split();
        let target = first_packet.destination().clone();
        let (server, user) = self.pick()?;

        let stream = match self.transport.connect(&server).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("VMess out: failed to open {}: {}", server, e);
                return Err(e);
            }
        };
        info!("VMess out: tunneling request to {} via {}", target, server);

        let chunked = target.is_udp();
        let option = if chunked {
            RequestOption::CHUNK_STREAM
        } else {
            RequestOption::default()
        };
        let session = ClientSession::new();
        let header = RequestHeader::new(user, &target, option);
        let wire = session.encode_request_header(&header, random_timestamp(unix_now()))?;

        let (reader, mut writer) = tokio::io::split(stream);
        let pools = &self.pools;

        let upload = async {
            writer.write_all(&wire).await?;
            let mut body = session.encode_request_body(writer)?;
            let result = send_request(&mut first_packet, &mut request, &mut body, chunked).await;
            if let Err(e) = body.shutdown().await {
                debug!("VMess out: shutdown to {} failed: {}", server, e);
            }
            result
        };
        let download = async {
            let result = async {
                let (response_header, reader) = session.decode_response_header(reader).await?;
                if let Some(command) = response_header.command {
                    self.handle_command(&server, command);
                }
                if chunked {
                    let mut chunks = AuthChunkReader::new(reader);
                    chunks_to_ray(pools, &mut chunks, &response, None).await
                } else {
                    let mut reader = reader;
                    reader_to_ray(pools, SizeClass::Large, &mut reader, &response, None).await
                }
            }
            .await;
            response.close();
            result
        };

        let (up, down) = tokio::join!(upload, download);
        let (up, down) = (up?, down?);
        debug!("VMess out: {} via {} done (up {} down {})", target, server, up, down);
        Ok(())
    }
}

/// Send the first chunk (pulling one from the ray if the packet has none but
/// promises more), then everything else the ray delivers.
async fn send_request(
    packet: &mut Packet,
    request: &mut Receiver,
    body: &mut CryptionWriter<WriteHalf<Stream>>,
    chunked: bool,
) -> Result<u64> {
    let mut first = packet.take_chunk();
    let mut more = packet.more_chunks();
    if first.is_none() && more {
        first = request.recv().await;
        more = first.is_some();
    }

    let mut total = 0u64;
    if let Some(chunk) = first {
        total += chunk.len() as u64;
        if chunked {
            write_chunk(body, chunk).await?;
        } else {
            body.write_all(chunk.bytes()).await?;
        }
    }
    body.flush().await?;

    if more {
        total += if chunked {
            ray_to_chunks(request, body).await?
        } else {
            ray_to_writer(request, body).await?
        };
    } else if chunked {
        body.write_all(&end_of_stream()).await?;
        body.flush().await?;
    }
    Ok(total)
}
