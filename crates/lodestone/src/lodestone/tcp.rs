use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::lodestone::{
    aggregate::Aggregator,
    identity::{now_unix_ms, IdentityMap},
    net::{self, Protocol, SharedResolver},
    notify::{self, SharedSink},
    pending::{PendingBuffer, PendingFlow},
    persist::PlayerIpStore,
    ppv2,
};

pub struct TcpForwarderOptions {
    pub target_host: String,
    pub target_port: u16,
    /// Prepend a freshly encoded PROXY v2 header towards the backend.
    pub emit_ppv2: bool,
    pub webhook: Option<String>,
    /// Correlation mode: new flows wait in the pending buffer instead of
    /// notifying immediately.
    pub correlate: bool,
    pub resolver: SharedResolver,
    pub identity: Arc<IdentityMap>,
    pub pending: Arc<PendingBuffer>,
    pub store: Arc<PlayerIpStore>,
    pub aggregator: Arc<Aggregator>,
    pub sink: SharedSink,
}

pub struct TcpForwarder {
    ln: TcpListener,
    opts: Arc<TcpForwarderOptions>,
}

impl TcpForwarder {
    pub async fn bind(listen_addr: &str, opts: TcpForwarderOptions) -> anyhow::Result<Self> {
        let ln = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("bind tcp {listen_addr}"))?;
        Ok(Self {
            ln,
            opts: Arc::new(opts),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let target = net::join_host_port(&self.opts.target_host, self.opts.target_port);
        tracing::info!(
            listen_addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            target_addr = %target,
            emit_ppv2 = self.opts.emit_ppv2,
            "tcp: listening"
        );

        loop {
            tokio::select! {
                res = self.ln.accept() => {
                    let (conn, peer) = res?;
                    let opts = self.opts.clone();
                    tokio::spawn(async move {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            tracing::debug!(client = %peer, "tcp: accepted");
                        }
                        handle_conn(conn, peer, opts).await;
                    });
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
}

async fn handle_conn(mut client: TcpStream, peer: SocketAddr, opts: Arc<TcpForwarderOptions>) {
    let target = net::join_host_port(&opts.target_host, opts.target_port);

    let mut backend =
        match TcpStream::connect((opts.target_host.as_str(), opts.target_port)).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(client = %peer, target_addr = %target, err = %err, "tcp: backend dial failed");
                let _ = client.shutdown().await;
                return;
            }
        };

    // The first inbound chunk is captured before splicing starts so an
    // inbound PROXY chain can be inspected. A client that closes without
    // sending leaves it empty; the connection still runs its course.
    let mut first = vec![0u8; 8192];
    let n = match client.read(&mut first).await {
        Ok(n) => n,
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "tcp: first read failed");
            let _ = backend.shutdown().await;
            return;
        }
    };
    first.truncate(n);
    if first.is_empty() {
        tracing::debug!(client = %peer, "tcp: client closed before sending");
    }

    let chain = ppv2::decode_chain(&first);
    let original = chain.original_source().unwrap_or(peer);
    if !chain.headers.is_empty() {
        tracing::debug!(client = %peer, layers = chain.headers.len(), "tcp: inbound proxy chain");
    }
    tracing::info!(client = %peer, original = %original, target_addr = %target, "tcp: connection mapped");

    let prelude_ok = if opts.emit_ppv2 {
        // The freshly encoded header replaces any inbound chain.
        let (dst_ip, dst_port) = resolve_or_raw(&opts).await;
        let header = ppv2::encode(
            &original.ip().to_string(),
            original.port(),
            &dst_ip,
            dst_port,
            false,
        );
        write_prelude(&mut backend, &header, chain.payload(&first)).await
    } else {
        write_prelude(&mut backend, &[], &first).await
    };

    if let Err(err) = prelude_ok {
        tracing::debug!(client = %peer, err = %err, "tcp: prelude write failed");
        let _ = client.shutdown().await;
        return;
    }

    notify_connect(&opts, original, &target);

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((sent, received)) => {
            tracing::info!(client = %peer, sent, received, "tcp: connection closed");
        }
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "tcp: connection ended with error");
        }
    }
    let _ = backend.shutdown().await;
    let _ = client.shutdown().await;
}

async fn resolve_or_raw(opts: &TcpForwarderOptions) -> (String, u16) {
    match opts
        .resolver
        .resolve(&opts.target_host, opts.target_port)
        .await
    {
        Ok(sa) => (sa.ip().to_string(), sa.port()),
        Err(err) => {
            tracing::debug!(host = %opts.target_host, err = %err, "tcp: target resolve failed, using configured host");
            (opts.target_host.clone(), opts.target_port)
        }
    }
}

async fn write_prelude(
    backend: &mut TcpStream,
    header: &[u8],
    payload: &[u8],
) -> std::io::Result<()> {
    if !header.is_empty() {
        backend.write_all(header).await?;
    }
    if !payload.is_empty() {
        backend.write_all(payload).await?;
    }
    Ok(())
}

/// At most one notification per accepted connection.
fn notify_connect(opts: &Arc<TcpForwarderOptions>, original: SocketAddr, target: &str) {
    let Some(url) = &opts.webhook else {
        return;
    };

    if opts.correlate {
        // A login may already be registered (player logged in, then
        // connected); in that case the flow is identified on the spot.
        if let Some(name) = opts.identity.find(now_unix_ms()) {
            let ip = original.ip().to_string();
            opts.sink.dispatch(
                url,
                notify::identity_join(&name, &ip, &[original.port()], Protocol::Tcp),
            );
            let store = opts.store.clone();
            tokio::spawn(async move {
                store.register(&name, &ip, Protocol::Tcp).await;
            });
            return;
        }

        let rx = opts.pending.insert(PendingFlow {
            ip: original.ip(),
            port: original.port(),
            protocol: Protocol::Tcp,
            arrived_ms: now_unix_ms(),
            target: target.to_string(),
        });
        let aggregator = opts.aggregator.clone();
        let url = url.clone();
        let target = target.to_string();
        tokio::spawn(async move {
            // Identified joins are announced by the control endpoint; a
            // flow that times out falls back to the anonymous summary.
            if let Ok(None) = rx.await {
                aggregator.add_connect(&url, &target, original.ip(), original.port(), Protocol::Tcp);
            }
        });
    } else {
        opts.aggregator
            .add_connect(url, target, original.ip(), original.port(), Protocol::Tcp);
    }
}
