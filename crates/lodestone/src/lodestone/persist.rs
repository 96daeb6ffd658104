use std::{path::PathBuf, sync::Mutex};

use serde::{Deserialize, Serialize};

use crate::lodestone::{identity::now_unix_ms, net::Protocol};

pub const DEFAULT_STORE_FILE: &str = "playerIP.json";

/// Days of inactivity after which a stored address is dropped by the
/// startup sweep.
pub const STALE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: String,
    pub protocol: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    username: String,
    ips: Vec<IpEntry>,
}

/// Durable username -> last-known address map, backed by a pretty-printed
/// JSON file that is rewritten whole (temp file + rename) after every
/// mutation.
///
/// Only the most recent address per user is retained. Legacy documents
/// that carry several addresses or `ports` arrays collapse to the entry
/// with the newest `lastSeen` on load. I/O and decode failures are logged
/// and otherwise ignored; the in-memory state is authoritative.
pub struct PlayerIpStore {
    path: PathBuf,
    enabled: bool,
    records: Mutex<Vec<Record>>,
}

impl PlayerIpStore {
    /// Load (and immediately rewrite, normalized) the store at `path`.
    /// With `enabled` false the loader is skipped and every mutator is a
    /// no-op.
    pub async fn load(path: impl Into<PathBuf>, enabled: bool) -> Self {
        let store = Self {
            path: path.into(),
            enabled,
            records: Mutex::new(Vec::new()),
        };
        if !enabled {
            return store;
        }

        let existed = match tokio::fs::read(&store.path).await {
            Ok(data) => match serde_json::from_slice::<Vec<Record>>(&data) {
                Ok(records) => {
                    let normalized = records.into_iter().map(normalize_record).collect();
                    *store.records.lock().unwrap() = normalized;
                    true
                }
                Err(err) => {
                    tracing::warn!(path = %store.path.display(), err = %err, "persist: invalid store, starting empty");
                    false
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                tracing::warn!(path = %store.path.display(), err = %err, "persist: read failed, starting empty");
                false
            }
        };

        if existed {
            store.flush().await;
        }
        store
    }

    /// Record `ip`/`protocol` as the user's current address. The retained
    /// entry is replaced whenever either differs; `lastSeen` always moves
    /// to now.
    pub async fn register(&self, username: &str, ip: &str, protocol: Protocol) {
        if !self.enabled {
            return;
        }

        let now = now_unix_ms();
        {
            let mut records = self.records.lock().unwrap();
            let idx = match records.iter().position(|r| r.username == username) {
                Some(i) => i,
                None => {
                    records.push(Record {
                        username: username.to_string(),
                        ips: Vec::new(),
                    });
                    records.len() - 1
                }
            };
            let record = &mut records[idx];

            match record.ips.first_mut() {
                Some(e) if e.ip == ip && e.protocol == protocol.as_str() => {
                    e.last_seen = now;
                }
                _ => {
                    record.ips = vec![IpEntry {
                        ip: ip.to_string(),
                        protocol: protocol.as_str().to_string(),
                        last_seen: now,
                    }];
                }
            }
        }
        self.flush().await;
    }

    /// Drop addresses unseen for `older_than_days` and any user left with
    /// none.
    pub async fn cleanup(&self, older_than_days: i64) {
        if !self.enabled {
            return;
        }

        let cutoff = now_unix_ms() - older_than_days * 24 * 60 * 60 * 1000;
        let changed = {
            let mut records = self.records.lock().unwrap();
            let before: usize = records.iter().map(|r| r.ips.len()).sum();
            for r in records.iter_mut() {
                r.ips.retain(|e| e.last_seen >= cutoff);
            }
            records.retain(|r| !r.ips.is_empty());
            before != records.iter().map(|r| r.ips.len()).sum::<usize>()
        };
        if changed {
            self.flush().await;
        }
    }

    /// Stored addresses for `username` (zero or one entry).
    pub fn lookup(&self, username: &str) -> Vec<IpEntry> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .find(|r| r.username == username)
            .map(|r| r.ips.clone())
            .unwrap_or_default()
    }

    async fn flush(&self) {
        let json = {
            let records = self.records.lock().unwrap();
            match serde_json::to_string_pretty(&*records) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(err = %err, "persist: serialize failed");
                    return;
                }
            }
        };

        let tmp = self.path.with_extension("json.tmp");
        if let Err(err) = tokio::fs::write(&tmp, json.as_bytes()).await {
            tracing::warn!(path = %tmp.display(), err = %err, "persist: write failed");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            tracing::warn!(path = %self.path.display(), err = %err, "persist: rename failed");
        }
    }
}

/// Keep only the most recent address by `lastSeen`. Legacy `ports` fields
/// are dropped by deserialization already.
fn normalize_record(mut r: Record) -> Record {
    if r.ips.len() > 1 {
        r.ips.sort_by_key(|e| std::cmp::Reverse(e.last_seen));
        r.ips.truncate(1);
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_store_path(tag: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "lodestone-{tag}-{}-{n}.json",
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn legacy_document_is_normalized_on_load() {
        let path = temp_store_path("legacy");
        let legacy = r#"[
          {
            "username": "Steve",
            "ips": [
              { "ip": "10.0.0.1", "protocol": "tcp", "lastSeen": 100, "ports": [80, 443] },
              { "ip": "10.0.0.2", "protocol": "udp", "lastSeen": 900, "ports": [19132] }
            ]
          }
        ]"#;
        tokio::fs::write(&path, legacy).await.unwrap();

        let store = PlayerIpStore::load(&path, true).await;
        let ips = store.lookup("Steve");
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].ip, "10.0.0.2");
        assert_eq!(ips[0].last_seen, 900);

        // The rewritten file no longer carries ports or extra entries.
        let rewritten = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!rewritten.contains("ports"));
        assert!(!rewritten.contains("10.0.0.1"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn register_replaces_on_address_change() {
        let path = temp_store_path("register");
        let store = PlayerIpStore::load(&path, true).await;

        store.register("Alex", "198.51.100.7", Protocol::Tcp).await;
        let first = store.lookup("Alex");
        assert_eq!(first[0].ip, "198.51.100.7");
        assert_eq!(first[0].protocol, "tcp");

        // Same address, same protocol: only lastSeen moves.
        store.register("Alex", "198.51.100.7", Protocol::Tcp).await;
        assert_eq!(store.lookup("Alex").len(), 1);

        // Protocol change replaces the entry.
        store.register("Alex", "198.51.100.7", Protocol::Udp).await;
        let after = store.lookup("Alex");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].protocol, "udp");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn cleanup_drops_stale_users() {
        let path = temp_store_path("cleanup");
        let doc = format!(
            r#"[
              {{ "username": "old", "ips": [ {{ "ip": "10.0.0.1", "protocol": "tcp", "lastSeen": 1000 }} ] }},
              {{ "username": "new", "ips": [ {{ "ip": "10.0.0.2", "protocol": "tcp", "lastSeen": {} }} ] }}
            ]"#,
            now_unix_ms()
        );
        tokio::fs::write(&path, doc).await.unwrap();

        let store = PlayerIpStore::load(&path, true).await;
        store.cleanup(30).await;

        assert!(store.lookup("old").is_empty());
        assert_eq!(store.lookup("new").len(), 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn disabled_store_is_inert() {
        let path = temp_store_path("disabled");
        let store = PlayerIpStore::load(&path, false).await;
        store.register("Steve", "10.0.0.1", Protocol::Tcp).await;
        assert!(store.lookup("Steve").is_empty());
        assert!(tokio::fs::metadata(&path).await.is_err());
    }

    #[tokio::test]
    async fn invalid_document_starts_empty_without_clobbering() {
        let path = temp_store_path("invalid");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = PlayerIpStore::load(&path, true).await;
        assert!(store.lookup("anyone").is_empty());
        // Untouched until the first mutation.
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "not json");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
