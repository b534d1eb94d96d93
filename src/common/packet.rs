//! First packet handed from an inbound handler to the dispatcher

use crate::buf::Buffer;

use super::Destination;

/// Destination plus an optional first payload chunk.
///
/// `more_chunks` tells the outbound whether further payload will arrive on
/// the ray's request queue.
#[derive(Debug)]
pub struct Packet {
    destination: Destination,
    chunk: Option<Buffer>,
    more_chunks: bool,
}

impl Packet {
    pub fn new(destination: Destination, chunk: Option<Buffer>, more_chunks: bool) -> Self {
        Self {
            destination,
            chunk,
            more_chunks,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn chunk(&self) -> Option<&Buffer> {
        self.chunk.as_ref()
    }

    /// Take the first chunk out, leaving `None` behind
    pub fn take_chunk(&mut self) -> Option<Buffer> {
        self.chunk.take()
    }

    pub fn more_chunks(&self) -> bool {
        self.more_chunks
    }

    /// Payload-free packets are what the dispatcher filters out
    pub fn has_payload(&self) -> bool {
        self.chunk.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }
}
