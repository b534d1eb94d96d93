//! Pumps between byte streams and rays

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::buf::{BufferPools, SizeClass};
use crate::error::{Error, Result};

use super::{Receiver, Sender};

/// Copy `reader` into `ray` one buffer at a time until EOF.
///
/// Each read is bounded by `read_timeout` when one is given. Returns the
/// number of bytes forwarded. The sender is left open; the caller decides
/// when to close it.
pub async fn reader_to_ray<R>(
    pools: &BufferPools,
    class: SizeClass,
    reader: &mut R,
    ray: &Sender,
    read_timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let mut buffer = pools.allocate(class);
        let n = match read_timeout {
            Some(limit) => tokio::time::timeout(limit, buffer.fill_from(reader)).await??,
            None => buffer.fill_from(reader).await?,
        };
        if n == 0 {
            trace!("reader_to_ray: EOF after {} bytes", total);
            return Ok(total);
        }
        total += n as u64;
        ray.send(buffer).await?;
    }
}

/// Write every buffer received from `ray` into `writer` until the queue closes.
///
/// Returns the number of bytes written. The writer is flushed but not shut
/// down.
pub async fn ray_to_writer<W>(ray: &mut Receiver, writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    while let Some(buffer) = ray.recv().await {
        if buffer.is_empty() {
            continue;
        }
        writer.write_all(buffer.bytes()).await.map_err(Error::Io)?;
        total += buffer.len() as u64;
        writer.flush().await?;
    }
    trace!("ray_to_writer: queue closed after {} bytes", total);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::PoolSizes;
    use crate::ray::channel;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pump_through_ray() {
        let pools = BufferPools::new(PoolSizes::default());
        let (tx, mut rx) = channel();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let producer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut reader = std::io::Cursor::new(payload);
                let n = reader_to_ray(&pools, SizeClass::Small, &mut reader, &tx, None)
                    .await
                    .unwrap();
                assert_eq!(n, 5000);
            })
        };

        let (mut near, mut far) = tokio::io::duplex(16 * 1024);
        let written = ray_to_writer(&mut rx, &mut near).await.unwrap();
        producer.await.unwrap();
        drop(near);

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(written, 5000);
        assert_eq!(received, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_timeout() {
        let pools = BufferPools::new(PoolSizes::default());
        let (tx, _rx) = channel();
        // The far end never writes.
        let (mut idle, _far) = tokio::io::duplex(64);

        let err = reader_to_ray(
            &pools,
            SizeClass::Small,
            &mut idle,
            &tx,
            Some(Duration::from_secs(120)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
