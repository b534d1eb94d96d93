//! Dispatcher - Core Execution Flow
//!
//! The dispatcher binds an inbound connection to an outbound handler:
//!
//! ```text
//! InboundHandler ── Packet ──> Dispatcher.dispatch_to_outbound()
//!                                  ↓
//!                         Router.take_detour(Destination)
//!                                  ↓
//!                     filter packet, OutboundHandler.dispatch()
//! ```
//!
//! Each dispatch runs in a separate tokio task; the inbound handler gets its
//! half of the ray back immediately.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{Destination, Packet};
use crate::protocol::{OutboundHandler, PacketDispatcher};
use crate::ray::{new_ray, InboundRay, OutboundRay};
use crate::router::Router;

/// Dispatcher with a default outbound and optional routed detours
pub struct Dispatcher {
    default_tag: String,
    default: Arc<dyn OutboundHandler>,
    detours: HashMap<String, Arc<dyn OutboundHandler>>,
    router: Option<Arc<dyn Router>>,
}

impl Dispatcher {
    pub fn new(default_tag: impl Into<String>, default: Arc<dyn OutboundHandler>) -> Self {
        Self {
            default_tag: default_tag.into(),
            default,
            detours: HashMap::new(),
            router: None,
        }
    }

    pub fn with_detour(mut self, tag: impl Into<String>, handler: Arc<dyn OutboundHandler>) -> Self {
        self.detours.insert(tag.into(), handler);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Outbound for `destination`: the routed detour, else the default.
    fn select(&self, destination: &Destination) -> (&str, Arc<dyn OutboundHandler>) {
        let Some(router) = &self.router else {
            return (&self.default_tag, Arc::clone(&self.default));
        };
        match router.take_detour(destination) {
            Ok(tag) => match self.detours.get_key_value(tag.as_str()) {
                Some((tag, handler)) => (tag, Arc::clone(handler)),
                // The default outbound may be routed to by its own tag
                None if tag == self.default_tag => (&self.default_tag, Arc::clone(&self.default)),
                None => {
                    warn!(
                        "Dispatcher: unknown outbound [{}] for {}, using [{}]",
                        tag, destination, self.default_tag
                    );
                    (&self.default_tag, Arc::clone(&self.default))
                }
            },
            Err(e) => {
                debug!(
                    "Dispatcher: {} for {}, using [{}]",
                    e, destination, self.default_tag
                );
                (&self.default_tag, Arc::clone(&self.default))
            }
        }
    }
}

impl PacketDispatcher for Dispatcher {
    fn dispatch_to_outbound(&self, first_packet: Packet) -> InboundRay {
        let (inbound, outbound) = new_ray();
        let (tag, handler) = self.select(first_packet.destination());
        debug!("Dispatcher: {} via [{}]", first_packet.destination(), tag);
        tokio::spawn(filter_packet_and_dispatch(
            first_packet,
            outbound,
            tag.to_string(),
            handler,
        ));
        inbound
    }
}

/// Make sure the outbound sees a payload, or nothing at all.
///
/// While the packet carries no payload but more is promised, the first
/// buffer is pulled off the request queue. A packet that ends up empty with
/// nothing more to come closes the response without any outbound work.
async fn filter_packet_and_dispatch(
    mut packet: Packet,
    ray: OutboundRay,
    tag: String,
    handler: Arc<dyn OutboundHandler>,
) {
    let OutboundRay {
        mut request,
        response,
    } = ray;

    while !packet.has_payload() && packet.more_chunks() {
        let destination = packet.destination().clone();
        packet = match request.recv().await {
            Some(chunk) => Packet::new(destination, Some(chunk), true),
            None => Packet::new(destination, None, false),
        };
    }

    if !packet.has_payload() && !packet.more_chunks() {
        debug!(
            "[{}] Empty request for {}, closing",
            tag,
            packet.destination()
        );
        response.close();
        return;
    }

    let destination = packet.destination().clone();
    if let Err(e) = handler.dispatch(packet, OutboundRay { request, response }).await {
        warn!("[{}] Dispatch to {} failed: {}", tag, destination, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{Buffer, BufferPools};
    use crate::common::{Address, Result};
    use crate::router::{Rule, RuleRouter};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replies with its own name and records the first chunk it saw
    struct Named {
        name: &'static str,
        pools: BufferPools,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl Named {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                pools: BufferPools::default(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OutboundHandler for Named {
        async fn dispatch(&self, mut first_packet: Packet, ray: OutboundRay) -> Result<()> {
            let first = first_packet.take_chunk().map(|c| c.to_vec()).unwrap_or_default();
            self.seen.lock().push(first);
            let mut reply = self.pools.small();
            reply.append(self.name.as_bytes())?;
            ray.response.send(reply).await
        }
    }

    fn chunk(data: &[u8]) -> Buffer {
        let mut buffer = BufferPools::default().small();
        buffer.append(data).unwrap();
        buffer
    }

    fn dispatcher(default: Arc<Named>, blocked: Arc<Named>) -> Dispatcher {
        let rules = vec![
            Rule {
                domain: vec!["domain:blocked.example".into()],
                outbound_tag: "block".into(),
                ..Default::default()
            },
            Rule {
                domain: vec!["domain:ghost.example".into()],
                outbound_tag: "missing".into(),
                ..Default::default()
            },
        ];
        Dispatcher::new("direct", default)
            .with_detour("block", blocked)
            .with_router(Arc::new(RuleRouter::new(&rules).unwrap()))
    }

    async fn reply_of(dispatcher: &Dispatcher, host: &str) -> Vec<u8> {
        let packet = Packet::new(Destination::tcp(Address::domain(host), 80), Some(chunk(b"x")), false);
        let mut ray = dispatcher.dispatch_to_outbound(packet);
        let mut out = Vec::new();
        while let Some(buffer) = ray.response.recv().await {
            out.extend_from_slice(buffer.bytes());
        }
        out
    }

    #[tokio::test]
    async fn test_routes_to_detour() {
        let dispatcher = dispatcher(Named::new("direct"), Named::new("block"));
        assert_eq!(reply_of(&dispatcher, "www.blocked.example").await, b"block");
    }

    #[tokio::test]
    async fn test_falls_back_to_default() {
        let dispatcher = dispatcher(Named::new("direct"), Named::new("block"));
        // No rule applies
        assert_eq!(reply_of(&dispatcher, "example.com").await, b"direct");
        // Rule names an outbound that does not exist
        assert_eq!(reply_of(&dispatcher, "ghost.example").await, b"direct");
    }

    #[tokio::test]
    async fn test_without_router_uses_default() {
        let dispatcher = Dispatcher::new("direct", Named::new("direct"));
        assert_eq!(reply_of(&dispatcher, "blocked.example").await, b"direct");
    }

    #[tokio::test]
    async fn test_first_chunk_pulled_from_request() {
        let direct = Named::new("direct");
        let dispatcher = Dispatcher::new("direct", direct.clone());

        let packet = Packet::new(Destination::tcp(Address::domain("example.com"), 80), None, true);
        let ray = dispatcher.dispatch_to_outbound(packet);
        let (request, mut response) = ray.split();

        // An empty buffer does not count as payload
        request.send(chunk(b"")).await.unwrap();
        request.send(chunk(b"payload")).await.unwrap();

        assert_eq!(response.recv().await.unwrap().bytes(), b"direct");
        assert_eq!(direct.seen.lock().clone(), vec![b"payload".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_packet_never_reaches_outbound() {
        let direct = Named::new("direct");
        let dispatcher = Dispatcher::new("direct", direct.clone());

        let packet = Packet::new(Destination::tcp(Address::domain("example.com"), 80), None, true);
        let ray = dispatcher.dispatch_to_outbound(packet);
        let (request, mut response) = ray.split();
        request.close();

        assert!(response.recv().await.is_none());
        assert!(direct.seen.lock().is_empty());
    }
}
