//! Runtime - builds the proxy from a validated [`Config`]
//!
//! Construction order: buffer pools, outbounds, router, dispatcher, then the
//! inbounds and inbound detours that feed the dispatcher, and finally the
//! detour links between them. Protocol names from the configuration are
//! resolved to concrete handlers here and nowhere else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::buf::BufferPools;
use crate::common::{Address, Destination, Result};
use crate::config::{
    Config, InboundProtocol, OutboundConfig, OutboundKind, VmessInboundSettings, VmessUser,
};
use crate::error::Error;
use crate::protocol::vmess::{
    DetourTarget, ServerSpec, TimedUserValidator, VmessInbound, VmessOutbound,
};
use crate::protocol::{Blackhole, Freedom, InboundHandler, OutboundHandler, PacketDispatcher};
use crate::router::RuleRouter;

use super::{Dispatcher, InboundDetour};

struct Inbound {
    port: u16,
    handler: Arc<VmessInbound>,
}

/// Runtime holds every handler built from the configuration
pub struct Runtime {
    inbounds: Vec<Inbound>,
    inbound_detours: Vec<Arc<InboundDetour>>,
}

impl Runtime {
    /// Build runtime from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let pools = BufferPools::new(config.buffers);

        let default = build_outbound(&config.outbound, &pools)?;
        let mut dispatcher = Dispatcher::new(config.outbound.tag.clone(), default);
        for detour in &config.outbound_detours {
            dispatcher = dispatcher.with_detour(detour.tag.clone(), build_outbound(detour, &pools)?);
        }
        if let Some(routing) = &config.routing {
            let router = RuleRouter::new(&routing.rules)?
                .with_cache_ttl(Duration::from_secs(routing.cache_ttl_secs));
            info!("Router: {} rules loaded", routing.rules.len());
            dispatcher = dispatcher.with_router(Arc::new(router));
        }
        let dispatcher = Arc::new(dispatcher);

        let mut inbounds = Vec::with_capacity(config.inbounds.len());
        for inbound in &config.inbounds {
            let handler = build_inbound(
                &inbound.tag,
                inbound.protocol,
                &inbound.settings,
                &dispatcher,
                &pools,
            )?;
            inbounds.push(Inbound {
                port: inbound.port,
                handler: Arc::new(handler),
            });
        }

        let mut inbound_detours = Vec::with_capacity(config.inbound_detours.len());
        for detour in &config.inbound_detours {
            let group = InboundDetour::new(detour.tag.clone(), detour.port_range, || {
                build_inbound(&detour.tag, detour.protocol, &detour.settings, &dispatcher, &pools)
            })?;
            info!("[{}] Inbound detour on ports {}", detour.tag, detour.port_range);
            inbound_detours.push(Arc::new(group));
        }

        for (inbound, entry) in config.inbounds.iter().zip(&inbounds) {
            let Some(tag) = &inbound.settings.detour_to else {
                continue;
            };
            // Plain inbounds first, then port-range groups
            let target: Arc<dyn DetourTarget> =
                if let Some(plain) = inbounds.iter().find(|i| i.handler.tag() == tag) {
                    plain.handler.clone()
                } else if let Some(group) = inbound_detours.iter().find(|d| d.tag() == tag) {
                    group.clone()
                } else {
                    return Err(Error::Config(format!("Unknown detour inbound: {}", tag)));
                };
            entry.handler.set_detour(&target);
            info!("[{}] Detour to [{}]", inbound.tag, tag);
        }

        Ok(Self {
            inbounds,
            inbound_detours,
        })
    }

    /// Start listening on every inbound, then on every inbound detour port;
    /// returns the bound addresses in that order.
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(self.inbounds.len());
        for inbound in &self.inbounds {
            match inbound.handler.listen(inbound.port).await {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    error!("[{}] Failed to start: {}", inbound.handler.tag(), e);
                    self.close();
                    return Err(e);
                }
            }
        }
        for detour in &self.inbound_detours {
            match detour.start().await {
                Ok(detour_addrs) => addrs.extend(detour_addrs),
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
        info!(
            "Runtime started with {} inbounds and {} inbound detours",
            self.inbounds.len(),
            self.inbound_detours.len()
        );
        Ok(addrs)
    }

    /// Stop accepting on every inbound
    pub fn close(&self) {
        for inbound in &self.inbounds {
            inbound.handler.close();
        }
        for detour in &self.inbound_detours {
            detour.close();
        }
    }

    /// Start, then serve until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        self.close();
        Ok(())
    }
}

fn build_inbound(
    tag: &str,
    protocol: InboundProtocol,
    settings: &VmessInboundSettings,
    dispatcher: &Arc<Dispatcher>,
    pools: &BufferPools,
) -> Result<VmessInbound> {
    match protocol {
        InboundProtocol::Vmess => {
            let validator = TimedUserValidator::new(settings.users.iter().map(VmessUser::to_user))?;
            let dispatcher: Arc<dyn PacketDispatcher> = dispatcher.clone();
            Ok(VmessInbound::new(tag, validator, dispatcher, pools.clone()))
        }
    }
}

fn build_outbound(config: &OutboundConfig, pools: &BufferPools) -> Result<Arc<dyn OutboundHandler>> {
    let handler: Arc<dyn OutboundHandler> = match config.kind()? {
        OutboundKind::Freedom => Arc::new(Freedom::new(pools.clone())),
        OutboundKind::Blackhole => Arc::new(Blackhole::new()),
        OutboundKind::Vmess(settings) => {
            let servers = settings
                .servers
                .iter()
                .map(|server| {
                    let destination = Destination::tcp(Address::parse(&server.address), server.port);
                    ServerSpec::new(destination, server.users.iter().map(VmessUser::to_user))
                })
                .collect();
            Arc::new(VmessOutbound::new(servers, pools.clone())?)
        }
    };
    info!("[{}] Outbound ready (protocol: {:?})", config.tag, config.protocol);
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buffer;
    use crate::common::Packet;
    use crate::protocol::vmess::{User, UserLevel};
    use crate::ray::{new_ray, Receiver};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    const USER_ID: &str = "a3482e88-686a-4a58-8126-99c9df64b7bf";

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// TCP server that answers "Processed: <request>" once the client is done
    async fn processing_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    stream.read_to_end(&mut request).await.unwrap();
                    let mut reply = b"Processed: ".to_vec();
                    reply.extend_from_slice(&request);
                    stream.write_all(&reply).await.unwrap();
                });
            }
        });
        port
    }

    fn server_config(port: u16) -> Config {
        Config::from_json(&format!(
            r#"{{
                "inbounds": [{{
                    "tag": "vmess-in", "port": {port}, "protocol": "vmess",
                    "settings": {{ "users": [{{ "id": "{USER_ID}", "alter_ids": 4, "level": 1, "email": "a@example.com" }}] }}
                }}],
                "outbound": {{ "tag": "direct", "protocol": "freedom" }},
                "outbound_detours": [{{ "tag": "block", "protocol": "blackhole" }}],
                "routing": {{ "rules": [{{ "domain": ["domain:blocked.example"], "outbound_tag": "block" }}] }}
            }}"#
        ))
        .unwrap()
    }

    fn client(server_port: u16) -> VmessOutbound {
        let user = User::new(Uuid::parse_str(USER_ID).unwrap(), 4, UserLevel(1), "");
        let server = Destination::tcp(Address::parse("127.0.0.1"), server_port);
        VmessOutbound::new(vec![ServerSpec::new(server, [user])], BufferPools::default()).unwrap()
    }

    fn chunk(data: &[u8]) -> Buffer {
        let mut buffer = BufferPools::default().small();
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
    async fn test_end_to_end_through_freedom() {
        let target_port = processing_server().await;
        let runtime = Runtime::from_config(&server_config(free_port().await)).unwrap();
        let addrs = runtime.start().await.unwrap();
        let client = client(addrs[0].port());

        let (inbound, outbound) = new_ray();
        let (request, mut response) = inbound.split();
        let target = Destination::tcp(Address::parse("127.0.0.1"), target_port);
        let packet = Packet::new(target, Some(chunk(b"Data to be sent")), false);
        let handler = tokio::spawn(async move { client.dispatch(packet, outbound).await });
        drop(request);

        assert_eq!(collect(&mut response).await, b"Processed: Data to be sent");
        handler.await.unwrap().unwrap();
        runtime.close();
    }

    #[tokio::test]
    async fn test_routed_to_blackhole() {
        let runtime = Runtime::from_config(&server_config(free_port().await)).unwrap();
        let addrs = runtime.start().await.unwrap();
        let client = client(addrs[0].port());

        let (inbound, outbound) = new_ray();
        let (request, mut response) = inbound.split();
        let target = Destination::tcp(Address::domain("ads.blocked.example"), 80);
        let packet = Packet::new(target, Some(chunk(b"GET / HTTP/1.1\r\n\r\n")), false);
        let handler = tokio::spawn(async move { client.dispatch(packet, outbound).await });
        drop(request);

        assert!(collect(&mut response).await.is_empty());
        handler.await.unwrap().unwrap();
    }

    /// `len` consecutive ports that are free right now
    fn free_port_range(len: u16) -> (u16, u16) {
        loop {
            let first = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
            let from = first.local_addr().unwrap().port();
            if from > u16::MAX - len {
                continue;
            }
            let rest: Vec<_> = (1..len)
                .map(|i| std::net::TcpListener::bind(("0.0.0.0", from + i)))
                .collect();
            if rest.iter().all(|l| l.is_ok()) {
                return (from, from + len - 1);
            }
        }
    }

    #[tokio::test]
    async fn test_switch_account_into_port_range() {
        use crate::protocol::vmess::{
            unix_now, ClientSession, RequestHeader, RequestOption, ResponseCommand,
        };

        const DETOUR_ID: &str = "0b6a8d8e-3c43-4ad1-9d0b-3f1f2d7c9e55";
        let (from, to) = free_port_range(3);
        let mut config = server_config(free_port().await);
        config.inbounds[0].settings.detour_to = Some("dynamic".into());
        config.inbound_detours = serde_json::from_str(&format!(
            r#"[{{
                "tag": "dynamic", "port_range": "{from}-{to}", "protocol": "vmess",
                "settings": {{ "users": [{{ "id": "{DETOUR_ID}", "alter_ids": 2, "email": "a@example.com" }}] }}
            }}]"#
        ))
        .unwrap();
        let runtime = Runtime::from_config(&config).unwrap();
        let addrs = runtime.start().await.unwrap();
        assert_eq!(addrs.len(), 4);

        let user = User::new(Uuid::parse_str(USER_ID).unwrap(), 4, UserLevel(1), "a@example.com");
        let stream = tokio::net::TcpStream::connect(addrs[0]).await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        let session = ClientSession::new();
        let header = RequestHeader::new(
            Arc::new(user),
            &Destination::tcp(Address::domain("blocked.example"), 80),
            RequestOption::default(),
        );
        writer
            .write_all(&session.encode_request_header(&header, unix_now()).unwrap())
            .await
            .unwrap();
        let mut body = session.encode_request_body(writer).unwrap();
        body.shutdown().await.unwrap();

        let (response, _) = session.decode_response_header(reader).await.unwrap();
        match response.command {
            Some(ResponseCommand::SwitchAccount(switch)) => {
                assert!((from..=to).contains(&switch.port));
                assert_eq!(switch.id, Uuid::parse_str(DETOUR_ID).unwrap());
                assert_eq!(switch.alter_ids, 2);
                assert_eq!(switch.valid_min, 255);
            }
            other => panic!("expected switch account, got {:?}", other),
        }
        runtime.close();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = server_config(10086);
        config.inbounds[0].settings.detour_to = Some("nowhere".into());
        assert!(matches!(Runtime::from_config(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_start_fails_on_busy_port() {
        let busy = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();
        let runtime = Runtime::from_config(&server_config(port)).unwrap();

        tokio::time::pause();
        let result = runtime.start().await;
        assert!(matches!(result, Err(Error::RetryFailed(100))));
    }
}
