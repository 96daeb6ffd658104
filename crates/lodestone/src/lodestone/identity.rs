use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Correlation tolerance between a login timestamp and an observed flow.
pub const LOGIN_TOLERANCE_MS: i64 = 30_000;

/// Registered logins older than this are swept by `cleanup`.
const ENTRY_TTL_MS: i64 = 5 * 60 * 1000;

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRecord {
    pub username: String,
    pub timestamp: i64,
}

/// Short-lived map of login timestamp -> username.
///
/// Multiple timestamps may coexist for the same username (one per login
/// event). All operations scan linearly; the map stays small because
/// entries live for minutes at most.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: Mutex<HashMap<i64, LoginRecord>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_login(&self, timestamp: i64, username: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            timestamp,
            LoginRecord {
                username: username.to_string(),
                timestamp,
            },
        );
    }

    /// Remove the first entry for `username` whose timestamp lies within
    /// the tolerance of `timestamp`. No-op when none matches.
    pub fn register_logout(&self, timestamp: i64, username: &str) {
        let mut entries = self.entries.lock().unwrap();
        let key = entries
            .values()
            .find(|r| r.username == username && (r.timestamp - timestamp).abs() <= LOGIN_TOLERANCE_MS)
            .map(|r| r.timestamp);
        if let Some(k) = key {
            entries.remove(&k);
        }
    }

    /// Username of the entry closest to `conn_timestamp`, provided the
    /// distance is strictly below the tolerance.
    pub fn find(&self, conn_timestamp: i64) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .map(|r| ((r.timestamp - conn_timestamp).abs(), r))
            .filter(|(d, _)| *d < LOGIN_TOLERANCE_MS)
            .min_by_key(|(d, _)| *d)
            .map(|(_, r)| r.username.clone())
    }

    /// Evict entries older than the TTL. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let cutoff = now_unix_ms() - ENTRY_TTL_MS;
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, r| r.timestamp >= cutoff);
        before - entries.len()
    }

    pub fn snapshot(&self) -> Vec<LoginRecord> {
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<LoginRecord> = entries.values().cloned().collect();
        out.sort_by_key(|r| r.timestamp);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_within_tolerance_prefers_closest() {
        let m = IdentityMap::new();
        m.register_login(100_000, "alex");
        m.register_login(110_000, "steve");

        assert_eq!(m.find(108_000).as_deref(), Some("steve"));
        assert_eq!(m.find(101_000).as_deref(), Some("alex"));
        // Exactly at the tolerance boundary: distance is not < 30_000.
        assert_eq!(m.find(140_000), None);
        assert_eq!(m.find(139_999).as_deref(), Some("steve"));
    }

    #[test]
    fn logout_removes_only_matching_entry() {
        let m = IdentityMap::new();
        m.register_login(100_000, "steve");
        m.register_login(500_000, "steve");

        m.register_logout(105_000, "steve");
        assert_eq!(m.find(100_000), None);
        assert_eq!(m.find(500_000).as_deref(), Some("steve"));

        // Wrong username is a no-op.
        m.register_logout(500_000, "alex");
        assert_eq!(m.find(500_000).as_deref(), Some("steve"));
    }

    #[test]
    fn cleanup_evicts_stale_entries() {
        let m = IdentityMap::new();
        let now = now_unix_ms();
        m.register_login(now - 6 * 60 * 1000, "old");
        m.register_login(now, "fresh");

        assert_eq!(m.cleanup(), 1);
        assert_eq!(m.snapshot().len(), 1);
        assert_eq!(m.snapshot()[0].username, "fresh");
    }

    #[test]
    fn same_user_multiple_logins_coexist() {
        let m = IdentityMap::new();
        m.register_login(1_000, "steve");
        m.register_login(2_000, "steve");
        assert_eq!(m.snapshot().len(), 2);
    }
}
