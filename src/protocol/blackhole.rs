//! Blackhole - drops all traffic
//!
//! Used to block unwanted traffic: nothing is ever sent back, and whatever
//! the client keeps sending is read and discarded.

use async_trait::async_trait;
use tracing::debug;

use crate::common::{Packet, Result};
use crate::ray::OutboundRay;

use super::OutboundHandler;

/// Outbound that silently swallows the entire payload
pub struct Blackhole;

impl Blackhole {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Blackhole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundHandler for Blackhole {
    async fn dispatch(&self, mut first_packet: Packet, ray: OutboundRay) -> Result<()> {
        drop(first_packet.take_chunk());

        let (mut request, response) = ray.split();
        response.close();

        if first_packet.more_chunks() {
            let mut dropped = 0usize;
            while let Some(buffer) = request.recv().await {
                dropped += buffer.len();
            }
            debug!("Blackhole: discarded {} bytes for {}", dropped, first_packet.destination());
        }
        Ok(())
    }
}
