use std::{net::SocketAddr, sync::Arc, sync::Mutex, time::Duration};

use anyhow::Context;
use dashmap::DashMap;
use tokio::{net::UdpSocket, sync::watch, time::Instant};

use crate::lodestone::{
    aggregate::Aggregator,
    identity::{now_unix_ms, IdentityMap},
    net::{self, Protocol, SharedResolver},
    notify::{self, SharedSink},
    pending::{PendingBuffer, PendingFlow},
    persist::PlayerIpStore,
    ppv2,
};

/// A pseudo-session with no client datagrams for this long is evicted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const DATAGRAM_BUF: usize = 64 * 1024;

pub struct UdpForwarderOptions {
    pub target_host: String,
    pub target_port: u16,
    /// Prepend a PROXY v2 header to the first datagram of each session.
    pub emit_ppv2: bool,
    pub webhook: Option<String>,
    pub correlate: bool,
    pub resolver: SharedResolver,
    pub identity: Arc<IdentityMap>,
    pub pending: Arc<PendingBuffer>,
    pub store: Arc<PlayerIpStore>,
    pub aggregator: Arc<Aggregator>,
    pub sink: SharedSink,
    pub idle_timeout: Duration,
}

#[derive(Debug, Default)]
struct SessionFlags {
    ppv2_sent: bool,
    logged: bool,
    notified: bool,
}

/// Connection-like state synthesized over connectionless datagrams.
///
/// Each session owns its egress socket exclusively; the session task is
/// the only place that closes it (by dropping), so close happens exactly
/// once.
struct UdpSession {
    client: SocketAddr,
    egress: Arc<UdpSocket>,
    flags: Mutex<SessionFlags>,
    resolved: Mutex<Option<SocketAddr>>,
    player: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
}

pub struct UdpForwarder {
    listen: Arc<UdpSocket>,
    opts: Arc<UdpForwarderOptions>,
    sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
    target: String,
}

impl UdpForwarder {
    pub async fn bind(listen_addr: &str, opts: UdpForwarderOptions) -> anyhow::Result<Self> {
        let listen = UdpSocket::bind(listen_addr)
            .await
            .with_context(|| format!("bind udp {listen_addr}"))?;
        let target = net::join_host_port(&opts.target_host, opts.target_port);
        Ok(Self {
            listen: Arc::new(listen),
            opts: Arc::new(opts),
            sessions: Arc::new(DashMap::new()),
            target,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen.local_addr().ok()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            listen_addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            target_addr = %self.target,
            emit_ppv2 = self.opts.emit_ppv2,
            "udp: listening"
        );

        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            tokio::select! {
                res = self.listen.recv_from(&mut buf) => {
                    match res {
                        Ok((n, peer)) => self.handle_datagram(peer, &buf[..n]).await,
                        Err(err) => {
                            tracing::debug!(err = %err, "udp: recv failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_datagram(&self, peer: SocketAddr, data: &[u8]) {
        let session = match self.lookup(&peer) {
            Some(s) => s,
            None => match self.create_session(peer).await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(client = %peer, err = %err, "udp: session setup failed");
                    return;
                }
            },
        };

        *session.last_activity.lock().unwrap() = Instant::now();

        let chain = ppv2::decode_chain(data);
        let original = chain.original_source().unwrap_or(peer);
        let payload = chain.payload(data);

        // At most one header per session, attached to the first outbound
        // datagram.
        let header = {
            let mut flags = session.flags.lock().unwrap();
            if self.opts.emit_ppv2 && !flags.ppv2_sent {
                flags.ppv2_sent = true;
                let (dst_ip, dst_port) = match *session.resolved.lock().unwrap() {
                    Some(sa) => (sa.ip().to_string(), sa.port()),
                    None => (self.opts.target_host.clone(), self.opts.target_port),
                };
                Some(ppv2::encode(
                    &original.ip().to_string(),
                    original.port(),
                    &dst_ip,
                    dst_port,
                    true,
                ))
            } else {
                None
            }
        };

        let sent = match header {
            Some(mut out) => {
                out.extend_from_slice(payload);
                self.send_to_backend(&session, &out).await
            }
            None => self.send_to_backend(&session, payload).await,
        };

        match sent {
            Ok(_) => self.after_first_send(&session, original),
            Err(err) => {
                tracing::debug!(client = %peer, target_addr = %self.target, err = %err, "udp: forward failed");
            }
        }
    }

    fn lookup(&self, peer: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions.get(peer).map(|s| s.value().clone())
    }

    async fn create_session(&self, peer: SocketAddr) -> anyhow::Result<Arc<UdpSession>> {
        // Egress family follows the target; a hostname defaults to v4.
        let egress_bind = if net::is_ipv6_host(&self.opts.target_host) {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let egress = Arc::new(
            UdpSocket::bind(egress_bind)
                .await
                .context("bind egress socket")?,
        );

        let session = Arc::new(UdpSession {
            client: peer,
            egress,
            flags: Mutex::new(SessionFlags::default()),
            resolved: Mutex::new(None),
            player: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        });
        self.sessions.insert(peer, session.clone());
        tracing::debug!(client = %peer, "udp: session created");

        // Resolution runs concurrently; until it lands, sends fall back to
        // the raw configured host.
        {
            let resolver = self.opts.resolver.clone();
            let host = self.opts.target_host.clone();
            let port = self.opts.target_port;
            let s = session.clone();
            tokio::spawn(async move {
                match resolver.resolve(&host, port).await {
                    Ok(sa) => *s.resolved.lock().unwrap() = Some(sa),
                    Err(err) => {
                        tracing::debug!(host = %host, err = %err, "udp: target resolve failed, using configured host");
                    }
                }
            });
        }

        tokio::spawn(session_task(
            self.listen.clone(),
            self.sessions.clone(),
            self.opts.clone(),
            self.target.clone(),
            session.clone(),
        ));

        Ok(session)
    }

    async fn send_to_backend(&self, session: &UdpSession, buf: &[u8]) -> std::io::Result<usize> {
        let resolved = *session.resolved.lock().unwrap();
        match resolved {
            Some(sa) => session.egress.send_to(buf, sa).await,
            None => {
                session
                    .egress
                    .send_to(buf, (self.opts.target_host.as_str(), self.opts.target_port))
                    .await
            }
        }
    }

    /// First successful egress send: log the session once and take the
    /// notification latch.
    fn after_first_send(&self, session: &Arc<UdpSession>, original: SocketAddr) {
        let (log_now, notify_now) = {
            let mut flags = session.flags.lock().unwrap();
            let log_now = !flags.logged;
            flags.logged = true;
            let notify_now = self.opts.webhook.is_some() && !flags.notified;
            flags.notified = flags.notified || notify_now;
            (log_now, notify_now)
        };

        if log_now {
            tracing::info!(client = %session.client, original = %original, target_addr = %self.target, "udp: session opened");
        }
        if !notify_now {
            return;
        }
        let url = self.opts.webhook.as_deref().unwrap_or_default().to_string();

        if self.opts.correlate {
            // A login registered shortly before this flow identifies it on
            // the spot.
            if let Some(name) = self.opts.identity.find(now_unix_ms()) {
                let ip = original.ip().to_string();
                self.opts.sink.dispatch(
                    &url,
                    notify::identity_join(&name, &ip, &[original.port()], Protocol::Udp),
                );
                *session.player.lock().unwrap() = Some(name.clone());
                let store = self.opts.store.clone();
                tokio::spawn(async move {
                    store.register(&name, &ip, Protocol::Udp).await;
                });
                return;
            }

            let rx = self.opts.pending.insert(PendingFlow {
                ip: original.ip(),
                port: original.port(),
                protocol: Protocol::Udp,
                arrived_ms: now_unix_ms(),
                target: self.target.clone(),
            });
            let aggregator = self.opts.aggregator.clone();
            let target = self.target.clone();
            let s = session.clone();
            tokio::spawn(async move {
                match rx.await {
                    // The control endpoint announced the identified join;
                    // remember the name for the eventual leave.
                    Ok(Some(name)) => *s.player.lock().unwrap() = Some(name),
                    Ok(None) => {
                        aggregator.add_connect(
                            &url,
                            &target,
                            original.ip(),
                            original.port(),
                            Protocol::Udp,
                        );
                    }
                    Err(_) => {}
                }
            });
        } else {
            self.opts.aggregator.add_connect(
                &url,
                &self.target,
                original.ip(),
                original.port(),
                Protocol::Udp,
            );
        }
    }
}

/// Per-session task: forwards backend responses to the client and evicts
/// the session once it has been idle for the full timeout. Dropping the
/// task's handles closes the egress socket.
async fn session_task(
    listen: Arc<UdpSocket>,
    sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
    opts: Arc<UdpForwarderOptions>,
    target: String,
    session: Arc<UdpSession>,
) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let deadline = *session.last_activity.lock().unwrap() + opts.idle_timeout;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                // A datagram may have landed while we slept; only expire
                // when the deadline still holds.
                let idle_since = *session.last_activity.lock().unwrap();
                if Instant::now() >= idle_since + opts.idle_timeout {
                    break;
                }
            }
            res = session.egress.recv_from(&mut buf) => {
                match res {
                    Ok((n, _)) => {
                        if let Err(err) = listen.send_to(&buf[..n], session.client).await {
                            tracing::debug!(client = %session.client, err = %err, "udp: response send failed");
                        }
                    }
                    Err(err) => {
                        tracing::debug!(client = %session.client, err = %err, "udp: egress recv failed");
                    }
                }
            }
        }
    }

    sessions.remove(&session.client);
    tracing::info!(client = %session.client, "udp: session expired");

    if let Some(url) = &opts.webhook {
        let player = session.player.lock().unwrap().clone();
        match player {
            Some(name) => {
                let embed =
                    notify::session_leave(&name, &session.client.ip().to_string(), Protocol::Udp);
                opts.sink.dispatch(url, embed);
            }
            None if !opts.correlate => {
                opts.aggregator.add_disconnect(
                    url,
                    &target,
                    session.client.ip(),
                    session.client.port(),
                    Protocol::Udp,
                );
            }
            None => {}
        }
    }
}
