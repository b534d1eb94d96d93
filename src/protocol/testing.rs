//! Test doubles for handler tests

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{Destination, Packet};
use crate::ray::{new_ray, InboundRay};

use super::PacketDispatcher;

/// Echoes every request buffer back on the response queue and remembers
/// which destinations were asked for.
#[derive(Default)]
pub struct EchoDispatcher {
    destinations: Arc<Mutex<Vec<Destination>>>,
}

impl EchoDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.lock().clone()
    }
}

impl PacketDispatcher for EchoDispatcher {
    fn dispatch_to_outbound(&self, mut first_packet: Packet) -> InboundRay {
        self.destinations.lock().push(first_packet.destination().clone());
        let (inbound, outbound) = new_ray();
        let (mut request, response) = outbound.split();
        tokio::spawn(async move {
            if let Some(chunk) = first_packet.take_chunk() {
                if response.send(chunk).await.is_err() {
                    return;
                }
            }
            if first_packet.more_chunks() {
                while let Some(buffer) = request.recv().await {
                    if response.send(buffer).await.is_err() {
                        return;
                    }
                }
            }
        });
        inbound
    }
}
