use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::lodestone::{
    net::Protocol,
    notify::{self, SharedSink},
};

/// Debounce window: inserts into a bucket within this span of the first
/// one are flushed together.
pub const FLUSH_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    webhook: String,
    protocol: Protocol,
    target: String,
}

type PortsByIp = BTreeMap<String, BTreeSet<u16>>;
type Buckets = Mutex<HashMap<BucketKey, PortsByIp>>;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Connect,
    Disconnect,
}

/// Groups bursts of anonymous connect/disconnect events into one webhook
/// per `(webhook, protocol, target)` per flush window.
///
/// A bucket exists exactly while its flush timer is pending: it is created
/// (and the timer started) on the first insert and removed atomically when
/// the timer fires, so an insert that arrives after a flush opens a fresh
/// bucket with a fresh window.
pub struct Aggregator {
    sink: SharedSink,
    window: Duration,
    connects: Buckets,
    disconnects: Buckets,
}

impl Aggregator {
    pub fn new(sink: SharedSink) -> Self {
        Self::with_window(sink, FLUSH_WINDOW)
    }

    pub fn with_window(sink: SharedSink, window: Duration) -> Self {
        Self {
            sink,
            window,
            connects: Mutex::new(HashMap::new()),
            disconnects: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_connect(
        self: &Arc<Self>,
        webhook: &str,
        target: &str,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
    ) {
        self.add(Kind::Connect, webhook, target, ip, port, protocol);
    }

    pub fn add_disconnect(
        self: &Arc<Self>,
        webhook: &str,
        target: &str,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
    ) {
        self.add(Kind::Disconnect, webhook, target, ip, port, protocol);
    }

    fn family(&self, kind: Kind) -> &Buckets {
        match kind {
            Kind::Connect => &self.connects,
            Kind::Disconnect => &self.disconnects,
        }
    }

    fn add(
        self: &Arc<Self>,
        kind: Kind,
        webhook: &str,
        target: &str,
        ip: IpAddr,
        port: u16,
        protocol: Protocol,
    ) {
        let key = BucketKey {
            webhook: webhook.to_string(),
            protocol,
            target: target.to_string(),
        };

        let start_timer = {
            let mut buckets = self.family(kind).lock().unwrap();
            let fresh = !buckets.contains_key(&key);
            buckets
                .entry(key.clone())
                .or_default()
                .entry(ip.to_string())
                .or_default()
                .insert(port);
            fresh
        };

        if start_timer {
            let agg = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(agg.window).await;
                agg.flush(kind, &key);
            });
        }
    }

    fn flush(&self, kind: Kind, key: &BucketKey) {
        let Some(by_ip) = self.family(kind).lock().unwrap().remove(key) else {
            return;
        };

        let embed = match kind {
            Kind::Connect => notify::connect_summary(&key.target, key.protocol, &by_ip),
            Kind::Disconnect => notify::disconnect_summary(&key.target, key.protocol, &by_ip),
        };
        tracing::info!(
            target_addr = %key.target,
            protocol = %key.protocol,
            clients = by_ip.len(),
            "aggregate: flushing grouped notification"
        );
        self.sink.dispatch(&key.webhook, embed);
    }
}
