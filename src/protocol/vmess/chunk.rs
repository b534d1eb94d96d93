//! Auth chunk framing for chunk-stream sessions
//!
//! ```text
//! +-------------+---------------+-----------+
//! | length (2B) | fnv1a32 (4B)  | payload   |
//! +-------------+---------------+-----------+
//!   length = payload + 4; a chunk with an empty payload ends the stream
//! ```

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::buf::{Buffer, BufferPools};
use crate::crypto::fnv1a32;
use crate::error::{Error, Result};
use crate::ray::{Receiver, Sender};

/// Bytes added in front of each payload
pub const CHUNK_OVERHEAD: usize = 6;

/// Largest payload the 2-byte length field can describe
pub const MAX_CHUNK_PAYLOAD: usize = u16::MAX as usize - 4;

/// Length and checksum that go in front of `payload`
fn chunk_header(payload: &[u8]) -> Result<[u8; CHUNK_OVERHEAD]> {
    let len = u16::try_from(payload.len() + 4).map_err(|_| Error::BufferOverflow {
        requested: payload.len() + 4,
        available: u16::MAX as usize,
    })?;
    let mut header = [0u8; CHUNK_OVERHEAD];
    header[..2].copy_from_slice(&len.to_be_bytes());
    header[2..].copy_from_slice(&fnv1a32(payload).to_be_bytes());
    Ok(header)
}

/// Frame the buffer's content in place, using its prepend margin.
pub fn authenticate(buffer: &mut Buffer) -> Result<()> {
    let header = chunk_header(buffer.bytes())?;
    buffer.prepend(&header)
}

/// The frame that terminates a chunk stream
pub fn end_of_stream() -> [u8; CHUNK_OVERHEAD] {
    let mut frame = [0u8; CHUNK_OVERHEAD];
    frame[..2].copy_from_slice(&4u16.to_be_bytes());
    frame[2..].copy_from_slice(&fnv1a32(&[]).to_be_bytes());
    frame
}

/// Write `buffer` as one auth chunk. The header is prepended in place when
/// the margin allows it, otherwise it is written on its own first.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, mut buffer: Buffer) -> Result<()> {
    if buffer.headroom() >= CHUNK_OVERHEAD {
        authenticate(&mut buffer)?;
    } else {
        writer.write_all(&chunk_header(buffer.bytes())?).await?;
    }
    writer.write_all(buffer.bytes()).await?;
    Ok(())
}

/// Reads auth chunks, verifying each checksum.
pub struct AuthChunkReader<R> {
    inner: R,
    finished: bool,
}

impl<R: AsyncRead + Unpin> AuthChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// Next payload, or `None` at the end-of-stream chunk (or a clean EOF on
    /// a chunk boundary).
    pub async fn read_chunk(&mut self, pools: &BufferPools) -> Result<Option<Buffer>> {
        if self.finished {
            return Ok(None);
        }

        let mut len = [0u8; 2];
        let n = self.inner.read(&mut len[..1]).await?;
        if n == 0 {
            self.finished = true;
            return Ok(None);
        }
        self.inner.read_exact(&mut len[1..]).await?;
        let len = u16::from_be_bytes(len) as usize;
        if len < 4 {
            return Err(Error::CorruptedPacket);
        }

        let mut checksum = [0u8; 4];
        self.inner.read_exact(&mut checksum).await?;
        let payload_len = len - 4;

        if payload_len == 0 {
            if u32::from_be_bytes(checksum) != fnv1a32(&[]) {
                return Err(Error::CorruptedPacket);
            }
            trace!("AuthChunkReader: end of stream");
            self.finished = true;
            return Ok(None);
        }

        let mut buffer = pools.large();
        if payload_len > buffer.remaining() {
            // Near-maximal chunks need the margin as well
            buffer.clear_without_margin();
        }
        if payload_len > buffer.remaining() {
            return Err(Error::CorruptedPacket);
        }
        while buffer.len() < payload_len {
            let want = payload_len - buffer.len();
            let n = read_some(&mut self.inner, &mut buffer, want).await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }

        if u32::from_be_bytes(checksum) != fnv1a32(buffer.bytes()) {
            return Err(Error::CorruptedPacket);
        }
        Ok(Some(buffer))
    }
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut Buffer,
    max: usize,
) -> Result<usize> {
    let mut limited = reader.take(max as u64);
    Ok(buffer.fill_from(&mut limited).await?)
}

/// Forward chunk payloads into `ray` until the stream ends.
pub async fn chunks_to_ray<R: AsyncRead + Unpin>(
    pools: &BufferPools,
    reader: &mut AuthChunkReader<R>,
    ray: &Sender,
    read_timeout: Option<Duration>,
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let chunk = match read_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read_chunk(pools)).await??,
            None => reader.read_chunk(pools).await?,
        };
        let Some(chunk) = chunk else {
            return Ok(total);
        };
        total += chunk.len() as u64;
        ray.send(chunk).await?;
    }
}

/// Write every buffer from `ray` as an auth chunk, then the terminator.
pub async fn ray_to_chunks<W: AsyncWrite + Unpin>(ray: &mut Receiver, writer: &mut W) -> Result<u64> {
    let mut total = 0u64;
    while let Some(buffer) = ray.recv().await {
        if buffer.is_empty() {
            continue;
        }
        total += buffer.len() as u64;
        write_chunk(writer, buffer).await?;
        writer.flush().await?;
    }
    writer.write_all(&end_of_stream()).await?;
    writer.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::PoolSizes;

    #[test]
    fn test_authenticate_layout() {
        let pools = BufferPools::new(PoolSizes::default());
        let mut buffer = pools.small();
        buffer.append(b"abc").unwrap();
        authenticate(&mut buffer).unwrap();

        assert_eq!(buffer.len(), 3 + CHUNK_OVERHEAD);
        assert_eq!(&buffer[..2], &7u16.to_be_bytes());
        assert_eq!(&buffer[2..6], &fnv1a32(b"abc").to_be_bytes());
        assert_eq!(&buffer[6..], b"abc");
    }

    #[tokio::test]
    async fn test_chunks_roundtrip_through_ray() {
        let pools = BufferPools::new(PoolSizes::default());
        let (tx, mut rx) = crate::ray::channel();

        let producer = {
            let pools = pools.clone();
            tokio::spawn(async move {
                for word in [&b"first"[..], b"second"] {
                    let mut buffer = pools.small();
                    buffer.append(word).unwrap();
                    tx.send(buffer).await.unwrap();
                }
            })
        };

        let mut wire = Vec::new();
        ray_to_chunks(&mut rx, &mut wire).await.unwrap();
        producer.await.unwrap();
        assert_eq!(&wire[wire.len() - CHUNK_OVERHEAD..], &end_of_stream());

        let mut reader = AuthChunkReader::new(std::io::Cursor::new(wire));
        let first = reader.read_chunk(&pools).await.unwrap().unwrap();
        assert_eq!(first.bytes(), b"first");
        let second = reader.read_chunk(&pools).await.unwrap().unwrap();
        assert_eq!(second.bytes(), b"second");
        assert!(reader.read_chunk(&pools).await.unwrap().is_none());
        assert!(reader.read_chunk(&pools).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_chunk_rejected() {
        let pools = BufferPools::new(PoolSizes::default());
        let mut buffer = pools.small();
        buffer.append(b"payload").unwrap();
        authenticate(&mut buffer).unwrap();
        let mut wire = buffer.bytes().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 1;

        let mut reader = AuthChunkReader::new(std::io::Cursor::new(wire));
        assert!(matches!(
            reader.read_chunk(&pools).await,
            Err(Error::CorruptedPacket)
        ));
    }

    #[tokio::test]
    async fn test_length_below_checksum_rejected() {
        let pools = BufferPools::new(PoolSizes::default());
        let wire = vec![0x00, 0x02, 0xAA, 0xBB];
        let mut reader = AuthChunkReader::new(std::io::Cursor::new(wire));
        assert!(matches!(
            reader.read_chunk(&pools).await,
            Err(Error::CorruptedPacket)
        ));
    }

    /// Frame with the largest payload the length field allows
    fn maximal_chunk() -> (Vec<u8>, Vec<u8>) {
        let payload: Vec<u8> = (0..MAX_CHUNK_PAYLOAD).map(|i| (i % 251) as u8).collect();
        let mut wire = 65535u16.to_be_bytes().to_vec();
        wire.extend_from_slice(&fnv1a32(&payload).to_be_bytes());
        wire.extend_from_slice(&payload);
        (payload, wire)
    }

    #[tokio::test]
    async fn test_maximal_chunk_accepted() {
        let pools = BufferPools::new(PoolSizes::default());
        let (payload, mut wire) = maximal_chunk();
        wire.extend_from_slice(&end_of_stream());

        let mut reader = AuthChunkReader::new(std::io::Cursor::new(wire));
        let chunk = reader.read_chunk(&pools).await.unwrap().unwrap();
        assert_eq!(chunk.len(), MAX_CHUNK_PAYLOAD);
        assert_eq!(chunk.bytes(), &payload[..]);
        assert!(reader.read_chunk(&pools).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_maximal_chunk_relayed_without_margin() {
        let pools = BufferPools::new(PoolSizes::default());
        let (_, wire) = maximal_chunk();
        let mut reader = AuthChunkReader::new(std::io::Cursor::new(wire.clone()));
        let chunk = reader.read_chunk(&pools).await.unwrap().unwrap();
        assert_eq!(chunk.headroom(), 0);

        let mut relayed = Vec::new();
        write_chunk(&mut relayed, chunk).await.unwrap();
        assert_eq!(relayed, wire);
    }
}
