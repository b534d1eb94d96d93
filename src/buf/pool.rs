//! Size-class buffer pools

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Buffer, LARGE_BUFFER_SIZE, MEDIUM_BUFFER_SIZE, SMALL_BUFFER_SIZE};

/// Default number of idle arrays retained per class
const DEFAULT_SMALL_POOL: usize = 64;
const DEFAULT_MEDIUM_POOL: usize = 128;
const DEFAULT_LARGE_POOL: usize = 64;

/// Buffer capacity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 1KB
    Small,
    /// 8KB
    Medium,
    /// 64KB
    Large,
}

/// Shared free-list; buffers keep an `Arc` to it so they can find their way home.
pub(super) struct PoolInner {
    buffer_size: usize,
    pool_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PoolInner {
    fn take(&self) -> Box<[u8]> {
        if let Some(head) = self.free.lock().pop() {
            return head;
        }
        trace!("BufferPool({}): free list empty, allocating", self.buffer_size);
        vec![0u8; self.buffer_size].into_boxed_slice()
    }

    pub(super) fn recycle(&self, head: Box<[u8]>) {
        if head.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.pool_size {
            free.push(head);
        }
        // Over capacity: the array is simply dropped.
    }
}

/// Pool of equally sized byte arrays.
///
/// Cloning is cheap and yields a handle to the same free-list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte arrays retaining at most
    /// `pool_size` idle arrays. Half of them are allocated up front.
    pub fn new(buffer_size: usize, pool_size: usize) -> Self {
        let prewarmed = (0..pool_size / 2)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect::<Vec<_>>();
        let mut free = Vec::with_capacity(pool_size);
        free.extend(prewarmed);

        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                pool_size,
                free: Mutex::new(free),
            }),
        }
    }

    /// Hand out an empty buffer. Never fails: an empty free-list falls back
    /// to a fresh allocation.
    pub fn allocate(&self) -> Buffer {
        Buffer::new(self.inner.take(), Arc::clone(&self.inner))
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of arrays currently sitting in the free-list
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("pool_size", &self.inner.pool_size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// Idle-array limits for the three size classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    #[serde(default = "default_small")]
    pub small: usize,
    #[serde(default = "default_medium")]
    pub medium: usize,
    #[serde(default = "default_large")]
    pub large: usize,
}

fn default_small() -> usize {
    DEFAULT_SMALL_POOL
}

fn default_medium() -> usize {
    DEFAULT_MEDIUM_POOL
}

fn default_large() -> usize {
    DEFAULT_LARGE_POOL
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            small: DEFAULT_SMALL_POOL,
            medium: DEFAULT_MEDIUM_POOL,
            large: DEFAULT_LARGE_POOL,
        }
    }
}

/// The three size-class pools, built once and shared by every handler.
#[derive(Debug, Clone)]
pub struct BufferPools {
    small: BufferPool,
    medium: BufferPool,
    large: BufferPool,
}

impl BufferPools {
    pub fn new(sizes: PoolSizes) -> Self {
        Self {
            small: BufferPool::new(SMALL_BUFFER_SIZE, sizes.small),
            medium: BufferPool::new(MEDIUM_BUFFER_SIZE, sizes.medium),
            large: BufferPool::new(LARGE_BUFFER_SIZE, sizes.large),
        }
    }

    pub fn allocate(&self, class: SizeClass) -> Buffer {
        self.pool(class).allocate()
    }

    /// 1KB buffer
    pub fn small(&self) -> Buffer {
        self.small.allocate()
    }

    /// 8KB buffer
    pub fn medium(&self) -> Buffer {
        self.medium.allocate()
    }

    /// 64KB buffer
    pub fn large(&self) -> Buffer {
        self.large.allocate()
    }

    pub fn pool(&self, class: SizeClass) -> &BufferPool {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => &self.large,
        }
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(PoolSizes::default())
    }
}
