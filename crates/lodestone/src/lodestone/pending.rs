use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::oneshot;

use crate::lodestone::{identity::LOGIN_TOLERANCE_MS, net::Protocol};

/// How long an observed flow waits for an identity before resolving empty.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// A network flow awaiting identity correlation.
#[derive(Debug, Clone)]
pub struct PendingFlow {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub arrived_ms: i64,
    pub target: String,
}

struct Entry {
    seq: u64,
    flow: PendingFlow,
    resolve: oneshot::Sender<Option<String>>,
}

/// Buffer of flows observed by the forwarders while the system waits for a
/// matching login on the control endpoint.
///
/// Each entry is resolved exactly once: `Some(username)` when a login
/// correlates it, `None` when its individual timeout fires first. Removal
/// from the map always happens before delivery, so the two paths never
/// both consume an entry.
pub struct PendingBuffer {
    seq: AtomicU64,
    entries: Mutex<HashMap<String, Entry>>,
    timeout: Duration,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::with_timeout(PENDING_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            seq: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn key(flow: &PendingFlow) -> String {
        format!("{}:{}:{}", flow.ip, flow.port, flow.protocol)
    }

    /// Insert a flow and schedule its individual timeout.
    ///
    /// The returned receiver yields the resolution. A re-observed flow
    /// replaces its predecessor; the superseded entry's receiver closes
    /// without a value.
    pub fn insert(self: &Arc<Self>, flow: PendingFlow) -> oneshot::Receiver<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = Self::key(&flow);

        {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(
                key.clone(),
                Entry {
                    seq,
                    flow,
                    resolve: tx,
                },
            );
        }

        let buf = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(buf.timeout).await;
            let entry = {
                let mut entries = buf.entries.lock().unwrap();
                match entries.get(&key) {
                    Some(e) if e.seq == seq => entries.remove(&key),
                    _ => None,
                }
            };
            if let Some(e) = entry {
                tracing::debug!(flow = %key, "pending: timed out without identity");
                let _ = e.resolve.send(None);
            }
        });

        rx
    }

    /// Consume every entry whose arrival lies within the correlation
    /// window of `timestamp`, delivering `username` to each, and report
    /// the flows that remain pending.
    pub fn process_for_player(
        &self,
        username: &str,
        timestamp: i64,
    ) -> (Vec<PendingFlow>, Vec<PendingFlow>) {
        let mut entries = self.entries.lock().unwrap();

        let matched_keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| (e.flow.arrived_ms - timestamp).abs() <= LOGIN_TOLERANCE_MS)
            .map(|(k, _)| k.clone())
            .collect();

        let mut matched = Vec::with_capacity(matched_keys.len());
        for k in matched_keys {
            if let Some(e) = entries.remove(&k) {
                matched.push(e.flow.clone());
                let _ = e.resolve.send(Some(username.to_string()));
            }
        }

        let unmatched = entries.values().map(|e| e.flow.clone()).collect();
        (matched, unmatched)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
