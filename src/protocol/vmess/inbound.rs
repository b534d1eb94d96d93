//! VMess inbound handler
//!
//! Per connection: authenticate and decode the request header, dispatch the
//! destination, then run one pump per direction. A rejected header closes the
//! connection without a single byte written back. Every connection leaves one
//! line in the access log.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buf::{BufferPools, SizeClass};
use crate::common::access::{access, AccessStatus};
use crate::common::{retry, Packet, Result, Stream};
use crate::protocol::{InboundHandler, PacketDispatcher};
use crate::ray::{ray_to_writer, reader_to_ray};
use crate::transport::{Listener, TcpTransport, Transport};

use super::{
    chunks_to_ray, ray_to_chunks, AuthChunkReader, RequestHeader, ResponseCommand,
    ResponseHeader, ServerSession, SwitchAccount, TimedUserValidator, UserValidator,
};

/// Bind attempts before giving up on a port
const LISTEN_RETRY_ATTEMPTS: usize = 100;
const LISTEN_RETRY_DELAY_MS: u64 = 100;

/// Time a client gets to send a complete request header
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(16);

/// How long a detour account stays valid on the client, in minutes
pub const DETOUR_VALID_MIN: u8 = 255;

/// A listening inbound that clients can be switched to
#[derive(Clone)]
pub struct DetourHandler {
    pub tag: String,
    pub port: u16,
    pub validator: Arc<TimedUserValidator>,
    /// Minutes the client keeps the account
    pub valid_min: u8,
}

/// Where a switch-account command sends clients: a single inbound or a
/// group of inbounds spread over a port range.
pub trait DetourTarget: Send + Sync {
    /// `None` while nothing is listening
    fn pick_handler(&self) -> Option<DetourHandler>;
}

pub struct VmessInbound {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    tag: String,
    validator: Arc<TimedUserValidator>,
    dispatcher: Arc<dyn PacketDispatcher>,
    pools: BufferPools,
    transport: Arc<dyn Transport>,
    local_addr: Mutex<Option<SocketAddr>>,
    detour: RwLock<Option<Weak<dyn DetourTarget>>>,
}

impl VmessInbound {
    pub fn new(
        tag: impl Into<String>,
        validator: TimedUserValidator,
        dispatcher: Arc<dyn PacketDispatcher>,
        pools: BufferPools,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tag: tag.into(),
                validator: Arc::new(validator),
                dispatcher,
                pools,
                transport: Arc::new(TcpTransport::new()),
                local_addr: Mutex::new(None),
                detour: RwLock::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Bound port, once listening
    pub fn port(&self) -> Option<u16> {
        self.inner.port()
    }

    /// Send clients to `target` through a switch-account command in every
    /// response header.
    pub fn set_detour(&self, target: &Arc<dyn DetourTarget>) {
        *self.inner.detour.write() = Some(Arc::downgrade(target));
    }
}

impl DetourTarget for VmessInbound {
    fn pick_handler(&self) -> Option<DetourHandler> {
        Some(DetourHandler {
            tag: self.inner.tag.clone(),
            port: self.port()?,
            validator: Arc::clone(&self.inner.validator),
            valid_min: DETOUR_VALID_MIN,
        })
    }
}

#[async_trait]
impl InboundHandler for VmessInbound {
    async fn listen(&self, port: u16) -> Result<SocketAddr> {
        let inner = &self.inner;
        let transport = &inner.transport;
        let listener = retry::timed(LISTEN_RETRY_ATTEMPTS, LISTEN_RETRY_DELAY_MS)
            .on(|| transport.bind(port))
            .await
            .map_err(|e| {
                error!("[{}] Failed to listen on port {}: {}", inner.tag, port, e);
                e
            })?;
        let local_addr = listener.local_addr()?;
        *inner.local_addr.lock() = Some(local_addr);
        info!("[{}] Listening on {} (protocol: vmess)", inner.tag, local_addr);

        let accept = tokio::spawn(accept_loop(Arc::clone(inner), listener));
        let refresh = inner.validator.spawn_refresh();
        self.tasks.lock().extend([accept, refresh]);
        Ok(local_addr)
    }

    fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if self.inner.local_addr.lock().take().is_some() {
            info!("[{}] Closed", self.inner.tag);
        }
    }
}

impl Drop for VmessInbound {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: Box<dyn Listener>) {
    let mut conn_count: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, source)) => {
                conn_count += 1;
                let conn_id = conn_count;
                debug!("[{}] New connection #{} from {}", inner.tag, conn_id, source);

                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = inner.handle_connection(stream, source).await {
                        warn!("[{}] Connection #{} from {} error: {}", inner.tag, conn_id, source, e);
                    }
                });
            }
            Err(e) => {
                error!("[{}] Accept error: {}", inner.tag, e);
            }
        }
    }
}

impl Inner {
    fn port(&self) -> Option<u16> {
        self.local_addr.lock().map(|addr| addr.port())
    }

    async fn handle_connection(&self, stream: Stream, source: SocketAddr) -> Result<()> {
        let start = Instant::now();
        let (mut reader, writer) = tokio::io::split(stream);

        let validator: Arc<dyn UserValidator> = self.validator.clone();
        let mut session = ServerSession::new(validator);
        let header = match tokio::time::timeout(
            HEADER_READ_TIMEOUT,
            session.decode_request_header(&mut reader),
        )
        .await
        {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                access(source, "", AccessStatus::Rejected, &e);
                // Rejections are already logged by the session and the peer
                // learns nothing; anything else is a broken connection.
                return if e.is_header_rejection() { Ok(()) } else { Err(e) };
            }
            Err(_) => {
                access(source, "", AccessStatus::Rejected, "request header timed out");
                return Ok(());
            }
        };

        let destination = header.destination();
        access(source, &destination, AccessStatus::Accepted, "");
        debug!(
            "[{}] {} -> {} (user: {})",
            self.tag, source, destination, header.user.email
        );

        let ray = self
            .dispatcher
            .dispatch_to_outbound(Packet::new(destination.clone(), None, true));
        let (request, mut response) = ray.split();

        let chunked = header.option.is_chunk_stream();
        let read_timeout = header.user.settings().payload_read_timeout;
        let body = session.decode_request_body(reader)?;
        let response_header = ResponseHeader {
            command: self.switch_account(&header),
        };

        let pools = &self.pools;
        let upload = async move {
            let result = if chunked {
                let mut chunks = AuthChunkReader::new(body);
                chunks_to_ray(pools, &mut chunks, &request, read_timeout).await
            } else {
                let mut body = body;
                reader_to_ray(pools, SizeClass::Large, &mut body, &request, read_timeout).await
            };
            request.close();
            result
        };
        let download = async {
            let mut writer = session.encode_response_header(&response_header, writer).await?;
            let result = if chunked {
                ray_to_chunks(&mut response, &mut writer).await
            } else {
                ray_to_writer(&mut response, &mut writer).await
            };
            writer.shutdown().await?;
            result
        };

        let (up, down) = tokio::join!(upload, download);
        match (&up, &down) {
            (Ok(up), Ok(down)) => info!(
                "[{}] Closed: {} -> {} (up {}B down {}B {:?})",
                self.tag,
                source,
                destination,
                up,
                down,
                start.elapsed()
            ),
            _ => debug!("[{}] {} -> {} ended with an error", self.tag, source, destination),
        }
        up?;
        down?;
        Ok(())
    }

    /// Switch-account command pointing at the detour inbound, for the same
    /// email on that inbound.
    fn switch_account(&self, request: &RequestHeader) -> Option<ResponseCommand> {
        let detour = self.detour.read().as_ref()?.upgrade()?;
        let handler = detour.pick_handler()?;
        let user = handler.validator.user_by_email(&request.user.email)?;
        info!(
            "[{}] Pick detour handler [{}] on port {} for {} minutes",
            self.tag, handler.tag, handler.port, handler.valid_min
        );
        Some(ResponseCommand::SwitchAccount(SwitchAccount {
            host: None,
            port: handler.port,
            id: *user.id.uuid(),
            alter_ids: u16::try_from(user.alter_ids.len()).unwrap_or(u16::MAX),
            level: user.level,
            valid_min: handler.valid_min,
        }))
    }
}
