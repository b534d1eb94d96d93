//! Rendezvous channel of buffers
//!
//! tokio has no zero-capacity channel, so a capacity-1 `mpsc` carries each
//! buffer together with a `oneshot` that the receiver fires when it takes the
//! buffer. The sender waits on that acknowledgement, which gives blocking
//! hand-off semantics: at most one buffer is ever in flight.

use tokio::sync::{mpsc, oneshot};

use crate::buf::Buffer;
use crate::error::{Error, Result};

struct Handoff {
    buffer: Buffer,
    taken: oneshot::Sender<()>,
}

/// Producing end. Not `Clone`: each queue has exactly one producer, and
/// dropping it closes the queue exactly once.
pub struct Sender {
    tx: mpsc::Sender<Handoff>,
}

/// Consuming end.
pub struct Receiver {
    rx: mpsc::Receiver<Handoff>,
}

/// Create a rendezvous channel.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel(1);
    (Sender { tx }, Receiver { rx })
}

impl Sender {
    /// Hand `buffer` to the receiver, waiting until it has been taken.
    ///
    /// Fails with `ConnectionClosed` if the receiver is gone; the buffer then
    /// returns to its pool.
    pub async fn send(&self, buffer: Buffer) -> Result<()> {
        let (taken_tx, taken_rx) = oneshot::channel();
        self.tx
            .send(Handoff {
                buffer,
                taken: taken_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        taken_rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Close the queue. Equivalent to dropping the sender.
    pub fn close(self) {}

    /// True once the receiving end has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Receiver {
    /// Next buffer, or `None` once the sender closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Buffer> {
        let handoff = self.rx.recv().await?;
        // The sender may have given up waiting; the buffer is ours either way.
        let _ = handoff.taken.send(());
        Some(handoff.buffer)
    }

    /// Stop accepting buffers; pending senders fail with `ConnectionClosed`.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;
    use std::time::Duration;

    fn buffer_with(pool: &BufferPool, byte: u8) -> Buffer {
        let mut buffer = pool.allocate();
        buffer.append(&[byte]).unwrap();
        buffer
    }

    #[tokio::test]
    async fn test_delivers_n_in_order_then_closes() {
        let pool = BufferPool::new(64, 8);
        let (tx, mut rx) = channel();

        let producer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for i in 0..10u8 {
                    tx.send(buffer_with(&pool, i)).await.unwrap();
                }
                tx.close();
            })
        };

        let mut received = Vec::new();
        while let Some(buffer) = rx.recv().await {
            received.push(buffer.bytes()[0]);
        }
        producer.await.unwrap();

        assert_eq!(received, (0..10u8).collect::<Vec<_>>());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_blocks_until_taken() {
        let pool = BufferPool::new(64, 8);
        let (tx, mut rx) = channel();

        let send = tx.send(buffer_with(&pool, 1));
        tokio::pin!(send);

        // Nobody is receiving: the hand-off cannot complete.
        let blocked = tokio::time::timeout(Duration::from_millis(50), &mut send).await;
        assert!(blocked.is_err());

        let (sent, received) = tokio::join!(send, rx.recv());
        assert!(sent.is_ok());
        assert_eq!(received.unwrap().bytes(), &[1]);
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_fails() {
        let pool = BufferPool::new(64, 2);
        let idle = pool.idle();
        let (tx, rx) = channel();
        drop(rx);

        let err = tx.send(buffer_with(&pool, 9)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(tx.is_closed());
        // Buffer went back to the pool.
        assert_eq!(pool.idle(), idle);
    }

    #[tokio::test]
    async fn test_drain_after_close() {
        let pool = BufferPool::new(64, 4);
        let (tx, mut rx) = channel();

        let producer = tokio::spawn(async move {
            tx.send(buffer_with(&pool, 42)).await.unwrap();
            // tx dropped here
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rx.recv().await.unwrap().bytes(), &[42]);
        assert!(rx.recv().await.is_none());
        producer.await.unwrap();
    }
}
