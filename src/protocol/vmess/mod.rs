//! VMess session codec
//!
//! The original VMess wire format: a 16-byte identity token, an AES-128-CFB
//! encrypted request header keyed by the user's command key, then the body
//! encrypted with per-session keys chosen by the client.
//!
//! ```text
//! client -> server
//! +------------+-------------------------------------------------+
//! | token 16B  | AES-CFB(cmd key, md5(ts x4)):                   |
//! |            |  ver | body IV | body key | echo | opt | rsv 2  |
//! |            |  cmd | port | addr type | addr | fnv1a32        |
//! +------------+-------------------------------------------------+
//! server -> client
//! +----------------------------------------------------------+
//! | AES-CFB(md5(body key), md5(body IV)):                    |
//! |  echo | 0x00 | command or 0x00 0x00 | body ...           |
//! +----------------------------------------------------------+
//! ```

mod chunk;
mod client;
mod command;
mod id;
mod inbound;
mod outbound;
mod server;
mod user;
mod validator;

pub use chunk::{
    authenticate, chunks_to_ray, end_of_stream, ray_to_chunks, write_chunk, AuthChunkReader,
    CHUNK_OVERHEAD, MAX_CHUNK_PAYLOAD,
};
pub use client::{random_timestamp, ClientSession};
pub use command::{ResponseCommand, SwitchAccount};
pub use id::{new_alter_ids, next_uuid, Id, ID_BYTES_LEN};
pub use inbound::{DetourHandler, DetourTarget, VmessInbound, DETOUR_VALID_MIN};
pub use outbound::{ServerSpec, VmessOutbound};
pub use server::{ServerSession, SessionState};
pub use user::{User, UserLevel, UserSettings};
pub use validator::{unix_now, TimedUserValidator, UserValidator, TIME_WINDOW_SECS};

use std::fmt;
use std::sync::Arc;

use crate::common::{Address, Destination, Network};
use crate::crypto::md5_sum;

pub const VERSION: u8 = 1;

// Address types
const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x02;
const ADDR_TYPE_IPV6: u8 = 0x03;

/// version + body IV + body key + echo + option + reserved + command + port + addr type
const FIXED_HEADER_LEN: usize = 41;

/// What the client asks the server to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCommand {
    Tcp,
    Udp,
}

impl RequestCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            RequestCommand::Tcp => 0x01,
            RequestCommand::Udp => 0x02,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(RequestCommand::Tcp),
            0x02 => Some(RequestCommand::Udp),
            _ => None,
        }
    }
}

/// Request option bits
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOption(pub u8);

impl RequestOption {
    /// Body is framed as auth chunks
    pub const CHUNK_STREAM: RequestOption = RequestOption(0x01);

    pub fn is_chunk_stream(self) -> bool {
        self.0 & Self::CHUNK_STREAM.0 == Self::CHUNK_STREAM.0
    }
}

impl fmt::Debug for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestOption(0x{:02x})", self.0)
    }
}

/// Decoded (server) or to-be-encoded (client) request header
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub version: u8,
    pub user: Arc<User>,
    pub command: RequestCommand,
    pub option: RequestOption,
    pub address: Address,
    pub port: u16,
}

impl RequestHeader {
    pub fn new(user: Arc<User>, destination: &Destination, option: RequestOption) -> Self {
        let command = match destination.network {
            Network::Tcp => RequestCommand::Tcp,
            Network::Udp => RequestCommand::Udp,
        };
        Self {
            version: VERSION,
            user,
            command,
            option,
            address: destination.address.clone(),
            port: destination.port,
        }
    }

    pub fn destination(&self) -> Destination {
        match self.command {
            RequestCommand::Udp => Destination::udp(self.address.clone(), self.port),
            RequestCommand::Tcp => Destination::tcp(self.address.clone(), self.port),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub command: Option<ResponseCommand>,
}

/// IV of the request header cipher: md5 of the timestamp repeated 4 times
fn timestamp_iv(timestamp: u64) -> [u8; 16] {
    let ts = timestamp.to_be_bytes();
    md5_sum(&[&ts[..], &ts[..], &ts[..], &ts[..]])
}
