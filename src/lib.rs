//! raycore - a traffic-relaying proxy core
//!
//! # Architecture
//!
//! ```text
//! client ─TCP─> VmessInbound ─Packet─> Dispatcher ─> Router
//!                    │                     │
//!                InboundRay <═══ Ray ═══> OutboundRay
//!                                          │
//!                          Freedom / Blackhole / VmessOutbound ─> target
//! ```
//!
//! ## Core Principles
//!
//! - Payload travels in pooled [`Buffer`]s end to end
//! - Handlers never see each other, only their half of a ray
//! - Router only depends on Destination, no IO
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── buf/             # BufferPool, Buffer
//! ├── common/          # Address, Destination, Packet, Stream, retry, access log
//! ├── crypto/          # AES-128-CFB streams, MD5, HMAC-MD5, FNV-1a
//! ├── ray/             # Rendezvous pipes between handlers
//! ├── protocol/        # Handler traits, Freedom, Blackhole, VMess
//! ├── router/          # Rule-based routing with a validity cache
//! ├── transport/       # TCP transport
//! └── app/             # Dispatcher, InboundDetour, Runtime
//! ```

// Core types
pub mod buf;
pub mod common;
pub mod error;

// Data path
pub mod crypto;
pub mod protocol;
pub mod ray;
pub mod router;
pub mod transport;

// Application
pub mod app;
pub mod config;

// Re-exports for convenience
pub use buf::{Buffer, BufferPool, BufferPools};
pub use common::{Address, Destination, Network, Packet, Stream};
pub use config::Config;
pub use error::{Error, Result};

pub use app::{Dispatcher, Runtime};
pub use protocol::{InboundHandler, OutboundHandler, PacketDispatcher};
pub use router::Router;
pub use transport::Transport;
