use std::{
    collections::HashSet,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{net::TcpStream, sync::watch, task::JoinSet};

use crate::lodestone::{
    aggregate, config, control, identity, logging, net, notify, pending, persist, tcp, udp,
};

const IDENTITY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILE));
    let created = config::ensure_config_file(&path)?;
    let cfg = config::load_config(&path)
        .with_context(|| format!("load config: {}", path.display()))?;

    let _log_guard = logging::init(&cfg.logging)?;
    if created {
        tracing::warn!(path = %path.display(), "config: created default config file");
    }

    let tcp_rules: usize = cfg
        .listeners
        .iter()
        .filter(|l| l.tcp.is_some() && l.target.tcp.is_some())
        .count();
    let udp_rules: usize = cfg
        .listeners
        .iter()
        .filter(|l| l.udp.is_some() && l.target.udp.is_some())
        .count();
    if tcp_rules + udp_rules == 0 && !cfg.use_rest_api {
        anyhow::bail!(
            "config: nothing to run (no listener has a port with a matching target port)"
        );
    }

    tracing::info!(
        config = %path.display(),
        tcp_rules,
        udp_rules,
        use_rest_api = cfg.use_rest_api,
        save_player_ip = cfg.save_player_ip,
        "lodestone: starting"
    );

    // Collaborator graph; everything is passed in explicitly.
    let sink: notify::SharedSink = Arc::new(notify::Notifier::new());
    let resolver: net::SharedResolver = Arc::new(net::DnsResolver);
    let identity_map = Arc::new(identity::IdentityMap::new());
    let pending = Arc::new(pending::PendingBuffer::new());
    let store = Arc::new(
        persist::PlayerIpStore::load(persist::DEFAULT_STORE_FILE, cfg.save_player_ip).await,
    );
    store.cleanup(persist::STALE_AFTER_DAYS).await;
    let aggregator = Arc::new(aggregate::Aggregator::new(sink.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Control endpoint, only in correlation mode.
    if cfg.use_rest_api {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.endpoint));
        let state = control::ControlState {
            identity: identity_map.clone(),
            pending: pending.clone(),
            store: store.clone(),
            sink: sink.clone(),
            webhooks: distinct_webhooks(&cfg),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { control::serve(addr, state, shutdown).await });
    }

    // Forwarders. A half-rule without a matching target port stays inactive.
    for l in &cfg.listeners {
        if let (Some(port), Some(target_port)) = (l.tcp, l.target.tcp) {
            let listen_addr =
                net::normalize_bind_addr(&net::join_host_port(&l.bind, port)).into_owned();
            spawn_probe(l.target.host.clone(), target_port);

            let fwd = tcp::TcpForwarder::bind(
                &listen_addr,
                tcp::TcpForwarderOptions {
                    target_host: l.target.host.clone(),
                    target_port,
                    emit_ppv2: l.emit_ppv2,
                    webhook: l.webhook.clone(),
                    correlate: cfg.use_rest_api,
                    resolver: resolver.clone(),
                    identity: identity_map.clone(),
                    pending: pending.clone(),
                    store: store.clone(),
                    aggregator: aggregator.clone(),
                    sink: sink.clone(),
                },
            )
            .await?;
            let shutdown = shutdown_rx.clone();
            tasks.spawn(fwd.run(shutdown));
        } else if l.tcp.is_some() || l.target.tcp.is_some() {
            tracing::debug!(bind = %l.bind, "config: tcp half of rule inactive (listener and target ports must both be set)");
        }

        if let (Some(port), Some(target_port)) = (l.udp, l.target.udp) {
            let listen_addr =
                net::normalize_bind_addr(&net::join_host_port(&l.bind, port)).into_owned();

            let fwd = Arc::new(
                udp::UdpForwarder::bind(
                    &listen_addr,
                    udp::UdpForwarderOptions {
                        target_host: l.target.host.clone(),
                        target_port,
                        emit_ppv2: l.emit_ppv2,
                        webhook: l.webhook.clone(),
                        correlate: cfg.use_rest_api,
                        resolver: resolver.clone(),
                        identity: identity_map.clone(),
                        pending: pending.clone(),
                        store: store.clone(),
                        aggregator: aggregator.clone(),
                        sink: sink.clone(),
                        idle_timeout: udp::IDLE_TIMEOUT,
                    },
                )
                .await?,
            );
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { fwd.run(shutdown).await });
        } else if l.udp.is_some() || l.target.udp.is_some() {
            tracing::debug!(bind = %l.bind, "config: udp half of rule inactive (listener and target ports must both be set)");
        }
    }

    // Periodic identity sweep.
    {
        let identity_map = identity_map.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(IDENTITY_CLEANUP_INTERVAL);
            tick.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let evicted = identity_map.cleanup();
                        if evicted > 0 {
                            tracing::debug!(evicted, "identity: swept stale logins");
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
        });
    }

    // Wait for a shutdown signal or an unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; enforce a cap only if something hangs.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn distinct_webhooks(cfg: &config::Config) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for l in &cfg.listeners {
        if let Some(url) = &l.webhook {
            if seen.insert(url.clone()) {
                out.push(url.clone());
            }
        }
    }
    out
}

/// Startup reachability diagnostic; failures are logged, never fatal, and
/// the listener starts regardless.
fn spawn_probe(host: String, port: u16) {
    tokio::spawn(async move {
        let addr = net::join_host_port(&host, port);
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await
        {
            Ok(Ok(_)) => tracing::debug!(target_addr = %addr, "probe: target reachable"),
            Ok(Err(err)) => {
                tracing::warn!(target_addr = %addr, err = %err, "probe: target unreachable")
            }
            Err(_) => tracing::warn!(target_addr = %addr, "probe: target probe timed out"),
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
