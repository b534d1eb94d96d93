//! Response commands carried in the server's response header
//!
//! ```text
//! +--------+--------+---------------+-----------+
//! | cmd id | length | fnv1a32 (4B)  | payload   |
//! +--------+--------+---------------+-----------+
//!            length = payload + 4, at most 255
//! ```

use uuid::Uuid;

use crate::common::Address;
use crate::crypto::fnv1a32;
use crate::error::{Error, Result};

use super::UserLevel;

const CMD_SWITCH_ACCOUNT: u8 = 0x01;

/// Largest value the one-byte length field can carry
const MAX_COMMAND_LEN: usize = 255;

/// Tells the client to use another account (usually on another port) for
/// the next `valid_min` minutes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchAccount {
    /// `None` means "the server you are talking to"
    pub host: Option<Address>,
    pub port: u16,
    pub id: Uuid,
    pub alter_ids: u16,
    pub level: UserLevel,
    pub valid_min: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCommand {
    SwitchAccount(SwitchAccount),
}

impl ResponseCommand {
    pub fn id(&self) -> u8 {
        match self {
            ResponseCommand::SwitchAccount(_) => CMD_SWITCH_ACCOUNT,
        }
    }

    /// Append `cmd id | length | checksum | payload` to `out`.
    ///
    /// Nothing is written when the payload is too large.
    pub fn marshal(&self, out: &mut Vec<u8>) -> Result<()> {
        let payload = match self {
            ResponseCommand::SwitchAccount(cmd) => cmd.payload()?,
        };
        let len = payload.len() + 4;
        if len > MAX_COMMAND_LEN {
            return Err(Error::CommandTooLarge(len));
        }
        out.push(self.id());
        out.push(len as u8);
        out.extend_from_slice(&fnv1a32(&payload).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode a command body (`checksum | payload`, i.e. the `length` bytes
    /// following the id and length fields).
    pub fn unmarshal(cmd_id: u8, data: &[u8]) -> Result<Self> {
        if cmd_id != CMD_SWITCH_ACCOUNT {
            return Err(Error::UnknownCommand(cmd_id));
        }
        if data.len() < 4 {
            return Err(Error::CorruptedPacket);
        }
        let (checksum, payload) = data.split_at(4);
        if fnv1a32(payload).to_be_bytes() != checksum {
            return Err(Error::CorruptedPacket);
        }
        SwitchAccount::from_payload(payload).map(ResponseCommand::SwitchAccount)
    }
}

impl SwitchAccount {
    fn payload(&self) -> Result<Vec<u8>> {
        let host = match &self.host {
            Some(Address::Ip(ip)) => ip.to_string(),
            Some(Address::Domain(domain)) => domain.clone(),
            None => String::new(),
        };
        let host_len = u8::try_from(host.len()).map_err(|_| Error::CommandTooLarge(host.len()))?;
        let mut payload = Vec::with_capacity(1 + host.len() + 22);
        payload.push(host_len);
        payload.extend_from_slice(host.as_bytes());
        payload.extend_from_slice(&self.port.to_be_bytes());
        payload.extend_from_slice(self.id.as_bytes());
        payload.extend_from_slice(&self.alter_ids.to_be_bytes());
        // One byte on the wire; levels above 255 saturate.
        payload.push(self.level.0.min(u8::MAX as u32) as u8);
        payload.push(self.valid_min);
        Ok(payload)
    }

    fn from_payload(payload: &[u8]) -> Result<Self> {
        let host_len = *payload.first().ok_or(Error::CorruptedPacket)? as usize;
        let rest = payload.get(1 + host_len..).ok_or(Error::CorruptedPacket)?;
        if rest.len() < 2 + 16 + 2 + 1 + 1 {
            return Err(Error::CorruptedPacket);
        }

        let host = if host_len > 0 {
            let host = std::str::from_utf8(&payload[1..1 + host_len])
                .map_err(|_| Error::CorruptedPacket)?;
            Some(Address::parse(host))
        } else {
            None
        };
        let port = u16::from_be_bytes([rest[0], rest[1]]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&rest[2..18]);
        let alter_ids = u16::from_be_bytes([rest[18], rest[19]]);

        Ok(Self {
            host,
            port,
            id: Uuid::from_bytes(uuid),
            alter_ids,
            level: UserLevel(rest[20] as u32),
            valid_min: rest[21],
        })
    }
}
