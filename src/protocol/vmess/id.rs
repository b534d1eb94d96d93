//! User IDs, command keys and alter IDs

use std::fmt;

use md5::{Digest, Md5};
use uuid::Uuid;

use crate::crypto::{hmac_md5, md5_sum};
use crate::error::Result;

/// Length of an ID and of a user token
pub const ID_BYTES_LEN: usize = 16;

const CMD_KEY_SALT: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
const ALTER_ID_SALT: &[u8] = b"16167dc8-16b6-4e6d-b8bb-65dd68113a81";
const ALTER_ID_RESALT: &[u8] = b"533eff8a-4113-4b10-b5ce-0f5d76b98cd2";

/// A UUID together with its derived command key.
#[derive(Clone, PartialEq, Eq)]
pub struct Id {
    uuid: Uuid,
    cmd_key: [u8; ID_BYTES_LEN],
}

impl Id {
    pub fn new(uuid: Uuid) -> Self {
        let cmd_key = md5_sum(&[&uuid.as_bytes()[..], CMD_KEY_SALT]);
        Self { uuid, cmd_key }
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn bytes(&self) -> &[u8; ID_BYTES_LEN] {
        self.uuid.as_bytes()
    }

    /// Key for the AES-CFB request header
    pub fn cmd_key(&self) -> &[u8; ID_BYTES_LEN] {
        &self.cmd_key
    }

    /// The 16-byte identity token a client sends for `timestamp`:
    /// HMAC-MD5 keyed by the ID over the big-endian timestamp.
    pub fn token(&self, timestamp: u64) -> Result<[u8; ID_BYTES_LEN]> {
        hmac_md5(self.uuid.as_bytes(), &timestamp.to_be_bytes())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The command key is secret material.
        f.debug_tuple("Id").field(&self.uuid).finish()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Derive the UUID following `prev` in an alter-ID chain.
pub fn next_uuid(prev: &Uuid) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(prev.as_bytes());
    hasher.update(ALTER_ID_SALT);
    loop {
        let mut bytes = [0u8; ID_BYTES_LEN];
        bytes.copy_from_slice(&hasher.clone().finalize());
        if &bytes != prev.as_bytes() {
            return Uuid::from_bytes(bytes);
        }
        hasher.update(ALTER_ID_RESALT);
    }
}

/// `count` alter IDs chained from `primary`
pub fn new_alter_ids(primary: &Id, count: u16) -> Vec<Id> {
    let mut ids = Vec::with_capacity(count as usize);
    let mut prev = primary.uuid;
    for _ in 0..count {
        let next = next_uuid(&prev);
        ids.push(Id::new(next));
        prev = next;
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary() -> Id {
        Id::new(Uuid::parse_str("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap())
    }

    #[test]
    fn test_cmd_key_derivation() {
        let id = primary();
        let mut input = id.bytes().to_vec();
        input.extend_from_slice(CMD_KEY_SALT);
        assert_eq!(id.cmd_key(), &md5_sum(&[input.as_slice()]));
    }

    #[test]
    fn test_alter_ids_chain() {
        let id = primary();
        let alter_ids = new_alter_ids(&id, 5);
        assert_eq!(alter_ids.len(), 5);
        assert_eq!(alter_ids[0].uuid(), &next_uuid(id.uuid()));
        for pair in alter_ids.windows(2) {
            assert_eq!(pair[1].uuid(), &next_uuid(pair[0].uuid()));
            assert_ne!(pair[0], pair[1]);
        }
        // Deterministic
        assert_eq!(alter_ids, new_alter_ids(&id, 5));
    }

    #[test]
    fn test_token_depends_on_time_and_id() {
        let id = primary();
        let other = Id::new(Uuid::new_v4());
        let t1 = id.token(1_000_000).unwrap();
        assert_eq!(t1, id.token(1_000_000).unwrap());
        assert_ne!(t1, id.token(1_000_001).unwrap());
        assert_ne!(t1, other.token(1_000_000).unwrap());
    }
}
