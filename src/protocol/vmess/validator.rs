//! Time-windowed user validator
//!
//! Clients authenticate with `HMAC-MD5(id, timestamp)`. The validator keeps
//! an index from every token that is valid right now (any ID of any user,
//! any timestamp within the window around the current time) back to the
//! user and the timestamp. A background task slides the window forward.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

use super::id::ID_BYTES_LEN;
use super::User;

/// Accepted clock skew in either direction, in seconds
pub const TIME_WINDOW_SECS: u64 = 120;

/// Interval between index refreshes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Looks up the user that produced an identity token.
pub trait UserValidator: Send + Sync {
    /// The user and the timestamp the token was generated for
    fn get(&self, token: &[u8; ID_BYTES_LEN]) -> Option<(Arc<User>, u64)>;
}

struct Entry {
    user: Arc<User>,
    timestamp: u64,
}

#[derive(Default)]
struct Index {
    users: Vec<Arc<User>>,
    tokens: HashMap<[u8; ID_BYTES_LEN], Entry>,
    /// Newest timestamp already indexed; `None` before the first update
    indexed_until: Option<u64>,
}

impl Index {
    fn index_user(&mut self, user: &Arc<User>, from: u64, to: u64) -> Result<()> {
        for id in user.ids() {
            for timestamp in from..=to {
                self.tokens.insert(
                    id.token(timestamp)?,
                    Entry {
                        user: Arc::clone(user),
                        timestamp,
                    },
                );
            }
        }
        Ok(())
    }
}

/// Validator accepting tokens within ±[`TIME_WINDOW_SECS`] of now.
///
/// Cloning is cheap and shares the index.
#[derive(Clone)]
pub struct TimedUserValidator {
    index: Arc<RwLock<Index>>,
}

impl TimedUserValidator {
    pub fn new(users: impl IntoIterator<Item = User>) -> Result<Self> {
        Self::new_at(users, unix_now())
    }

    /// Build a validator whose window is centred on `now`.
    pub fn new_at(users: impl IntoIterator<Item = User>, now: u64) -> Result<Self> {
        let validator = Self {
            index: Arc::new(RwLock::new(Index::default())),
        };
        for user in users {
            validator.add(user)?;
        }
        validator.update_to(now)?;
        Ok(validator)
    }

    /// Register a user, indexing its tokens for the current window.
    pub fn add(&self, user: User) -> Result<()> {
        let user = Arc::new(user);
        let mut index = self.index.write();
        if let Some(until) = index.indexed_until {
            let from = until.saturating_sub(2 * TIME_WINDOW_SECS);
            index.index_user(&user, from, until)?;
        }
        index.users.push(user);
        Ok(())
    }

    /// Registered users
    pub fn users(&self) -> Vec<Arc<User>> {
        self.index.read().users.clone()
    }

    /// First user whose email matches
    pub fn user_by_email(&self, email: &str) -> Option<Arc<User>> {
        self.index
            .read()
            .users
            .iter()
            .find(|u| u.email == email)
            .cloned()
    }

    /// Slide the window to be centred on `now` (unix seconds).
    ///
    /// Tokens newer than anything indexed so far are added; tokens older than
    /// the window are evicted.
    pub fn update_to(&self, now: u64) -> Result<()> {
        let oldest = now.saturating_sub(TIME_WINDOW_SECS);
        let newest = now + TIME_WINDOW_SECS;

        let mut index = self.index.write();
        let from = match index.indexed_until {
            Some(until) if until >= oldest => until + 1,
            _ => oldest,
        };
        if from <= newest {
            let users = index.users.clone();
            for user in &users {
                index.index_user(user, from, newest)?;
            }
        }
        index.tokens.retain(|_, entry| entry.timestamp >= oldest);
        index.indexed_until = Some(newest.max(index.indexed_until.unwrap_or(0)));

        debug!(
            "UserValidator: {} tokens indexed up to {}",
            index.tokens.len(),
            newest
        );
        Ok(())
    }

    /// Spawn the background refresher.
    ///
    /// The task holds only a weak reference and exits once every validator
    /// handle is dropped.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let weak: Weak<RwLock<Index>> = Arc::downgrade(&self.index);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(index) = weak.upgrade() else {
                    break;
                };
                let validator = TimedUserValidator { index };
                if let Err(e) = validator.update_to(unix_now()) {
                    warn!("UserValidator: refresh failed: {}", e);
                }
            }
        })
    }

    #[cfg(test)]
    fn token_count(&self) -> usize {
        self.index.read().tokens.len()
    }
}

impl UserValidator for TimedUserValidator {
    fn get(&self, token: &[u8; ID_BYTES_LEN]) -> Option<(Arc<User>, u64)> {
        self.index
            .read()
            .tokens
            .get(token)
            .map(|entry| (Arc::clone(&entry.user), entry.timestamp))
    }
}

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
