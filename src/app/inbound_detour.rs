//! Inbound detour - one VMess inbound per port of a range
//!
//! Every port of the range gets its own handler, built up front and started
//! together. Switch-account commands pointing at the group pick one of the
//! listening handlers at random, spreading detoured clients over the range.

use std::net::SocketAddr;

use rand::seq::SliceRandom;
use tracing::{error, info};

use crate::common::Result;
use crate::config::PortRange;
use crate::protocol::vmess::{DetourHandler, DetourTarget, VmessInbound};
use crate::protocol::InboundHandler;

struct PortHandler {
    port: u16,
    handler: VmessInbound,
}

pub struct InboundDetour {
    tag: String,
    handlers: Vec<PortHandler>,
}

impl InboundDetour {
    /// Build one handler per port with `build`.
    pub fn new(
        tag: impl Into<String>,
        range: PortRange,
        mut build: impl FnMut() -> Result<VmessInbound>,
    ) -> Result<Self> {
        let handlers = range
            .ports()
            .map(|port| Ok(PortHandler { port, handler: build()? }))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            tag: tag.into(),
            handlers,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Listen on every port in order. On failure the handlers already
    /// started are closed again.
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(self.handlers.len());
        for entry in &self.handlers {
            match entry.handler.listen(entry.port).await {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    error!("[{}] Failed to start port {}: {}", self.tag, entry.port, e);
                    self.close();
                    return Err(e);
                }
            }
        }
        info!("[{}] Listening on {} ports", self.tag, addrs.len());
        Ok(addrs)
    }

    pub fn close(&self) {
        for entry in &self.handlers {
            entry.handler.close();
        }
    }
}

impl DetourTarget for InboundDetour {
    fn pick_handler(&self) -> Option<DetourHandler> {
        let listening: Vec<DetourHandler> = self
            .handlers
            .iter()
            .filter_map(|entry| entry.handler.pick_handler())
            .collect();
        let mut picked = listening.choose(&mut rand::thread_rng())?.clone();
        picked.tag = self.tag.clone();
        Some(picked)
    }
}
