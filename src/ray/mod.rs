//! Ray - the pipe between an inbound and an outbound handler
//!
//! A ray is two one-directional queues of [`Buffer`]s:
//!
//! ```text
//!                 request (client -> target)
//!   InboundRay  ============================>  OutboundRay
//!               <============================
//!                 response (target -> client)
//! ```
//!
//! Queues are rendezvous channels: `send` returns only once the receiving
//! side has taken the buffer, so a slow consumer throttles its producer.
//! Dropping (or `close`-ing) the sender is the only end-of-stream signal.

mod channel;
mod io;

pub use channel::{channel, Receiver, Sender};
pub use io::{ray_to_writer, reader_to_ray};

/// The inbound handler's half: produces requests, consumes responses.
#[derive(Debug)]
pub struct InboundRay {
    pub request: Sender,
    pub response: Receiver,
}

/// The outbound handler's half: consumes requests, produces responses.
#[derive(Debug)]
pub struct OutboundRay {
    pub request: Receiver,
    pub response: Sender,
}

impl InboundRay {
    pub fn split(self) -> (Sender, Receiver) {
        (self.request, self.response)
    }
}

impl OutboundRay {
    pub fn split(self) -> (Receiver, Sender) {
        (self.request, self.response)
    }
}

/// Create a connected pair of ray halves.
pub fn new_ray() -> (InboundRay, OutboundRay) {
    let (request_tx, request_rx) = channel();
    let (response_tx, response_rx) = channel();
    (
        InboundRay {
            request: request_tx,
            response: response_rx,
        },
        OutboundRay {
            request: request_rx,
            response: response_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;

    #[tokio::test]
    async fn test_ray_directions() {
        let pool = BufferPool::new(256, 4);
        let (inbound, outbound) = new_ray();
        let (request_tx, mut response_rx) = inbound.split();
        let (mut request_rx, response_tx) = outbound.split();

        let client = tokio::spawn(async move {
            let mut buffer = pool.allocate();
            buffer.append(b"ping").unwrap();
            request_tx.send(buffer).await.unwrap();
            request_tx.close();

            let reply = response_rx.recv().await.unwrap();
            assert_eq!(reply.bytes(), b"pong");
            assert!(response_rx.recv().await.is_none());
        });

        let request = request_rx.recv().await.unwrap();
        assert_eq!(request.bytes(), b"ping");
        assert!(request_rx.recv().await.is_none());

        let pool = BufferPool::new(256, 4);
        let mut reply = pool.allocate();
        reply.append(b"pong").unwrap();
        response_tx.send(reply).await.unwrap();
        drop(response_tx);

        client.await.unwrap();
    }
}
