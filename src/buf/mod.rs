//! Pooled byte buffers
//!
//! Every payload chunk travelling through a ray lives in a [`Buffer`] whose
//! backing array belongs to one of three size-class pools. Buffers reserve a
//! fixed margin in front of their content so framing headers can be
//! prepended without copying.
//!
//! ```text
//! backing: [ margin (16) | content ............ | free ]
//!                        ^start                ^end
//! ```

mod buffer;
mod pool;

pub use buffer::Buffer;
pub use pool::{BufferPool, BufferPools, PoolSizes, SizeClass};

/// Bytes reserved in front of fresh content for `Buffer::prepend`
pub const PREPEND_MARGIN: usize = 16;

/// Backing array size of the small class (1KB)
pub const SMALL_BUFFER_SIZE: usize = 1024;

/// Backing array size of the medium class (8KB)
pub const MEDIUM_BUFFER_SIZE: usize = 8 * 1024;

/// Backing array size of the large class (64KB)
pub const LARGE_BUFFER_SIZE: usize = 64 * 1024;
