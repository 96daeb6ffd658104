use std::{borrow::Cow, net::IpAddr, net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` or a bare interface
/// address; Tokio bind APIs want a full `host:port`. `normalize_bind_addr`
/// turns `":PORT"` into `"0.0.0.0:PORT"` and leaves everything else alone.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// True when `host` reads as an IPv6 literal (with or without brackets).
pub fn is_ipv6_host(host: &str) -> bool {
    let h = host.trim().trim_start_matches('[').trim_end_matches(']');
    h.contains(':')
}

/// Join a host and port into a dialable/displayable `host:port`,
/// bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let h = host.trim();
    if is_ipv6_host(h) && !h.starts_with('[') {
        format!("[{h}]:{port}")
    } else {
        format!("{h}:{port}")
    }
}

/// Transport protocol of a forwarded flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Async "host -> numeric address" oracle.
///
/// The forwarders only ever need a single numeric address for a configured
/// target host; everything else about name resolution stays behind this
/// seam.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr>;
}

pub type SharedResolver = Arc<dyn Resolver>;

/// System resolver backed by `tokio::net::lookup_host`, with numeric
/// passthrough so already-numeric hosts never hit DNS.
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        let h = host.trim().trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = h.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let mut it = tokio::net::lookup_host((h, port)).await?;
        it.next()
            .ok_or_else(|| anyhow::anyhow!("net: no address for {host:?}"))
    }
}
