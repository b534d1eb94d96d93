//! Users, levels and per-level settings

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::id::{new_alter_ids, Id};

/// Trust level of a user. Higher is more trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserLevel(pub u32);

impl UserLevel {
    pub const UNTRUSTED: UserLevel = UserLevel(0);
    pub const ADMIN: UserLevel = UserLevel(999);
}

/// Behaviour derived from a user's level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSettings {
    /// Idle limit while reading request payload; `None` waits forever
    pub payload_read_timeout: Option<Duration>,
}

impl UserSettings {
    pub fn for_level(level: UserLevel) -> Self {
        let payload_read_timeout = if level > UserLevel::UNTRUSTED {
            None
        } else {
            Some(Duration::from_secs(120))
        };
        Self {
            payload_read_timeout,
        }
    }
}

/// An account: primary ID plus derived alter IDs.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Id,
    pub alter_ids: Vec<Id>,
    pub level: UserLevel,
    pub email: String,
}

impl User {
    pub fn new(uuid: Uuid, alter_id_count: u16, level: UserLevel, email: impl Into<String>) -> Self {
        let id = Id::new(uuid);
        let alter_ids = new_alter_ids(&id, alter_id_count);
        Self {
            id,
            alter_ids,
            level,
            email: email.into(),
        }
    }

    /// The primary ID followed by every alter ID
    pub fn ids(&self) -> impl Iterator<Item = &Id> {
        std::iter::once(&self.id).chain(self.alter_ids.iter())
    }

    /// ID a client authenticates with: a random alter ID, or the primary
    /// when there are none.
    pub fn any_valid_id(&self) -> &Id {
        if self.alter_ids.is_empty() {
            return &self.id;
        }
        let index = rand::thread_rng().gen_range(0..self.alter_ids.len());
        &self.alter_ids[index]
    }

    pub fn settings(&self) -> UserSettings {
        UserSettings::for_level(self.level)
    }
}
