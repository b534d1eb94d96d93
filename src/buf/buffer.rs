//! Pool-backed byte buffer with a prepend margin

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

use super::pool::PoolInner;
use super::PREPEND_MARGIN;

/// A view `[start, end)` over a pool-owned byte array.
///
/// The array goes back to its pool when the buffer is released or dropped,
/// so a buffer can never be used after release.
pub struct Buffer {
    head: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
    start: usize,
    end: usize,
}

impl Buffer {
    pub(super) fn new(head: Box<[u8]>, pool: Arc<PoolInner>) -> Self {
        let start = PREPEND_MARGIN.min(head.len());
        Self {
            head: Some(head),
            pool,
            start,
            end: start,
        }
    }

    fn head(&self) -> &[u8] {
        self.head.as_deref().unwrap_or_default()
    }

    fn head_mut(&mut self) -> &mut [u8] {
        self.head.as_deref_mut().unwrap_or_default()
    }

    /// Content bytes
    pub fn bytes(&self) -> &[u8] {
        &self.head()[self.start..self.end]
    }

    /// Mutable content bytes
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        &mut self.head_mut()[start..end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True once the content reaches the end of the backing array
    pub fn is_full(&self) -> bool {
        self.end == self.head().len()
    }

    /// Largest content length reachable from the current offset
    pub fn capacity(&self) -> usize {
        self.head().len() - self.start
    }

    /// Bytes that can still be appended
    pub fn remaining(&self) -> usize {
        self.head().len() - self.end
    }

    /// Bytes that can still be prepended
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Reset to an empty buffer with the full prepend margin.
    pub fn clear(&mut self) -> &mut Self {
        self.start = PREPEND_MARGIN.min(self.head().len());
        self.end = self.start;
        self
    }

    /// Reset to an empty buffer that gives up its prepend margin, so content
    /// can span the whole backing array.
    pub fn clear_without_margin(&mut self) -> &mut Self {
        self.start = 0;
        self.end = 0;
        self
    }

    /// Append `data` after the content.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining() {
            return Err(Error::BufferOverflow {
                requested: data.len(),
                available: self.remaining(),
            });
        }
        let end = self.end;
        self.head_mut()[end..end + data.len()].copy_from_slice(data);
        self.end += data.len();
        Ok(())
    }

    /// Write `data` in front of the content, consuming margin.
    ///
    /// Fails without touching the buffer when the margin is too small.
    pub fn prepend(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.start {
            return Err(Error::BufferOverflow {
                requested: data.len(),
                available: self.start,
            });
        }
        let start = self.start - data.len();
        self.head_mut()[start..start + data.len()].copy_from_slice(data);
        self.start = start;
        Ok(())
    }

    /// Narrow the content to `[from, to)` (relative to the current content).
    ///
    /// # Panics
    ///
    /// Panics if `from > to` or `to > len()`, like slice indexing.
    pub fn slice(&mut self, from: usize, to: usize) -> &mut Self {
        assert!(
            from <= to && to <= self.len(),
            "slice {}..{} out of range for buffer of length {}",
            from,
            to,
            self.len()
        );
        self.end = self.start + to;
        self.start += from;
        self
    }

    /// Drop the first `from` content bytes.
    ///
    /// # Panics
    ///
    /// Panics if `from > len()`.
    pub fn slice_from(&mut self, from: usize) -> &mut Self {
        let len = self.len();
        self.slice(from, len)
    }

    /// Consume `n` bytes from the front of the content.
    ///
    /// # Panics
    ///
    /// Panics if `n > len()`.
    pub fn advance(&mut self, n: usize) -> &mut Self {
        self.slice_from(n)
    }

    /// Move the first `n` content bytes into `dst`, returning how many were copied.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self.bytes()[..n]);
        self.start += n;
        n
    }

    /// Free space after the content, for callers that fill it themselves.
    /// Follow with [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.head_mut()[end..]
    }

    /// Extend the content over `n` bytes written through `spare_mut`.
    ///
    /// # Panics
    ///
    /// Panics if `n > remaining()`.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.remaining(), "commit {} past capacity", n);
        self.end += n;
    }

    /// Read once from `reader` into the free space after the content.
    ///
    /// Returns the number of bytes read; `0` means EOF (or a full buffer).
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let end = self.end;
        let n = reader.read(&mut self.head_mut()[end..]).await?;
        self.end += n;
        Ok(n)
    }

    /// Return the backing array to its pool.
    ///
    /// Dropping a buffer has the same effect; this spells the intent out.
    pub fn release(self) {}

    #[cfg(test)]
    pub(crate) fn backing_ptr(&self) -> *const u8 {
        self.head().as_ptr()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(head) = self.head.take() {
            self.pool.recycle(head);
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;

    fn pool() -> BufferPool {
        BufferPool::new(64, 4)
    }

    #[test]
    fn test_append_and_slice() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"hello world").unwrap();
        assert_eq!(buffer.bytes(), b"hello world");

        buffer.slice(6, 11);
        assert_eq!(buffer.bytes(), b"world");

        buffer.slice_from(2);
        assert_eq!(&buffer[..], b"rld");
    }

    #[test]
    fn test_prepend_within_margin() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"body").unwrap();
        buffer.prepend(&[0xAA, 0xBB]).unwrap();
        assert_eq!(buffer.bytes(), &[0xAA, 0xBB, b'b', b'o', b'd', b'y']);
        assert_eq!(buffer.headroom(), PREPEND_MARGIN - 2);
    }

    #[test]
    fn test_prepend_beyond_margin_fails_closed() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"body").unwrap();
        buffer.prepend(&[1u8; 10]).unwrap();

        let err = buffer.prepend(&[2u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferOverflow { requested: 7, available: 6 }
        ));
        // Content untouched
        assert_eq!(buffer.len(), 14);
        assert_eq!(&buffer[..10], &[1u8; 10]);
        assert_eq!(&buffer[10..], b"body");
    }

    #[test]
    fn test_append_beyond_capacity_fails() {
        let pool = pool();
        let mut buffer = pool.allocate();
        let room = buffer.remaining();
        assert_eq!(room, 64 - PREPEND_MARGIN);
        buffer.append(&vec![0u8; room]).unwrap();
        assert!(buffer.is_full());
        assert!(buffer.append(b"x").is_err());
    }

    #[test]
    fn test_clear_restores_margin() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"abc").unwrap();
        buffer.prepend(b"xy").unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.headroom(), PREPEND_MARGIN);
    }

    #[test]
    fn test_clear_without_margin_spans_whole_array() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"abc").unwrap();
        buffer.clear_without_margin();
        assert_eq!(buffer.headroom(), 0);
        assert_eq!(buffer.remaining(), 64);
        buffer.append(&[5u8; 64]).unwrap();
        assert!(buffer.is_full());
        assert!(buffer.prepend(b"x").is_err());
    }

    #[test]
    fn test_read_into_consumes_front() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"abcdef").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(buffer.read_into(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buffer.bytes(), b"ef");
    }

    #[test]
    fn test_spare_and_commit() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"ab").unwrap();
        buffer.spare_mut()[..3].copy_from_slice(b"cde");
        buffer.commit(3);
        assert_eq!(buffer.bytes(), b"abcde");
        assert_eq!(buffer.remaining(), 64 - PREPEND_MARGIN - 5);
    }

    #[test]
    #[should_panic]
    fn test_slice_out_of_range_panics() {
        let pool = pool();
        let mut buffer = pool.allocate();
        buffer.append(b"abc").unwrap();
        buffer.slice(1, 4);
    }

    #[tokio::test]
    async fn test_fill_from_reads_up_to_capacity() {
        let pool = pool();
        let mut buffer = pool.allocate();
        let data = vec![7u8; 100];
        let mut reader = std::io::Cursor::new(data);

        let n = buffer.fill_from(&mut reader).await.unwrap();
        assert_eq!(n, 64 - PREPEND_MARGIN);
        assert!(buffer.is_full());

        let mut empty = std::io::Cursor::new(Vec::<u8>::new());
        let mut other = pool.allocate();
        assert_eq!(other.fill_from(&mut empty).await.unwrap(), 0);
    }
}
