//! Anonymous visitor identifiers
//!
//! A visitor is identified by a keyed hash of website, IP and user agent.
//! The key is random and rotates every UTC day and is never stored, so ids
//! can be counted within a day but not linked across days or back to an IP.

use chrono::{DateTime, NaiveDate, Utc};
use rand::RngCore;
use std::sync::Mutex;

pub struct VisitorHasher {
    salt: Mutex<(NaiveDate, [u8; 32])>,
}

fn fresh_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

impl VisitorHasher {
    pub fn new() -> Self {
        Self {
            salt: Mutex::new((Utc::now().date_naive(), fresh_salt())),
        }
    }

    /// Current day's salt, rotating it once the day has changed
    fn salt_for(&self, day: NaiveDate) -> [u8; 32] {
        let mut guard = self.salt.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.0 != day {
            *guard = (day, fresh_salt());
        }
        guard.1
    }

    pub fn visitor_id(&self, website_id: i64, ip: &str, user_agent: &str, at: DateTime<Utc>) -> String {
        let salt = self.salt_for(at.date_naive());
        let mut hasher = blake3::Hasher::new_keyed(&salt);
        hasher.update(&website_id.to_le_bytes());
        hasher.update(ip.as_bytes());
        hasher.update(&[0]);
        hasher.update(user_agent.as_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

impl Default for VisitorHasher {
    fn default() -> Self {
        Self::new()
    }
}
