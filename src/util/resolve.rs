//! Asynchronous IPv4 name resolution with a small TTL cache.
//!
//! Session dials only ever use IPv4 addresses (the request packet carries the
//! IPv4 address type exclusively), so lookups keep A records and drop
//! everything else.

use crate::util::{Result, TunnelError};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};

/// TTL for cached DNS entries.
const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Timeout for DNS lookup operations.
const DNS_TIMEOUT: Duration = Duration::from_secs(10);

static DNS_CACHE: Lazy<DnsCache> = Lazy::new(DnsCache::new);
static DNS_RESOLVER: Lazy<RwLock<Option<Arc<TokioAsyncResolver>>>> =
    Lazy::new(|| RwLock::new(None));

struct CacheEntry {
    addresses: Vec<Ipv4Addr>,
    expires_at: Instant,
    next_index: usize,
}

struct DnsCache {
    inner: RwLock<HashMap<String, CacheEntry>>,
}

impl DnsCache {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    async fn get(&self, host: &str) -> Option<Ipv4Addr> {
        let cache = self.inner.read().await;
        if let Some(entry) = cache.get(host)
            && Instant::now() <= entry.expires_at
            && !entry.addresses.is_empty()
        {
            let index = entry.next_index % entry.addresses.len();
            let addr = entry.addresses[index];
            trace!("[DNS] Cache hit for {} -> {}", host, addr);
            return Some(addr);
        }
        None
    }

    async fn insert(&self, host: String, addresses: Vec<Ipv4Addr>) {
        let mut cache = self.inner.write().await;
        cache.insert(
            host,
            CacheEntry {
                addresses,
                expires_at: Instant::now() + DEFAULT_TTL,
                next_index: 0,
            },
        );
    }

    async fn advance(&self, host: &str) {
        let mut cache = self.inner.write().await;
        if let Some(entry) = cache.get_mut(host) {
            entry.next_index = entry.next_index.wrapping_add(1);
        }
    }

    async fn clear(&self) {
        let mut cache = self.inner.write().await;
        cache.clear();
    }
}

/// Resolve a hostname to an IPv4 socket address, with caching and timeout.
///
/// Lookup failures map to [`TunnelError::Resolve`]; a lookup that succeeds but
/// yields no IPv4 address maps to [`TunnelError::NoAddress`].
pub async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }
    if host.parse::<IpAddr>().is_ok() {
        // IPv6 literal: nothing we can put into an IPv4 request packet.
        return Err(TunnelError::NoAddress(host.to_string()));
    }

    if let Some(addr) = DNS_CACHE.get(host).await {
        DNS_CACHE.advance(host).await;
        return Ok(SocketAddr::new(IpAddr::V4(addr), port));
    }

    let resolver_opt = DNS_RESOLVER.read().await.clone();
    let mut addresses: Vec<Ipv4Addr> = if let Some(resolver) = resolver_opt {
        let lookup = tokio::time::timeout(DNS_TIMEOUT, resolver.lookup_ip(host))
            .await
            .map_err(|_| TunnelError::Resolve {
                host: host.to_string(),
                reason: format!("timeout after {}s", DNS_TIMEOUT.as_secs()),
            })?
            .map_err(|err| TunnelError::Resolve {
                host: host.to_string(),
                reason: err.to_string(),
            })?;
        lookup
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect()
    } else {
        let lookup_future = lookup_host((host, port));
        tokio::time::timeout(DNS_TIMEOUT, lookup_future)
            .await
            .map_err(|_| TunnelError::Resolve {
                host: host.to_string(),
                reason: format!("timeout after {}s", DNS_TIMEOUT.as_secs()),
            })?
            .map_err(|err| TunnelError::Resolve {
                host: host.to_string(),
                reason: err.to_string(),
            })?
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect()
    };

    if addresses.is_empty() {
        return Err(TunnelError::NoAddress(host.to_string()));
    }

    // Sort to keep stability across runs (helps caching)
    addresses.sort_unstable_by_key(|ip| ip.octets());
    addresses.dedup();

    debug!(
        "[DNS] Resolved {} -> {} entries (ttl={}s)",
        host,
        addresses.len(),
        DEFAULT_TTL.as_secs()
    );

    let first = addresses[0];
    DNS_CACHE.insert(host.to_string(), addresses).await;
    DNS_CACHE.advance(host).await;
    Ok(SocketAddr::new(IpAddr::V4(first), port))
}

/// Replace the resolver backend. An empty list restores the system resolver.
pub async fn set_dns_servers(servers: &[String]) -> Result<()> {
    let mut parsed_servers = Vec::new();
    for raw in servers {
        let socket = parse_dns_server(raw)
            .map_err(|err| TunnelError::Config(format!("Invalid DNS server '{}': {}", raw, err)))?;
        parsed_servers.push(socket);
    }

    let mut resolver_guard = DNS_RESOLVER.write().await;

    if parsed_servers.is_empty() {
        *resolver_guard = None;
        DNS_CACHE.clear().await;
        info!("[DNS] Using system DNS resolver");
        return Ok(());
    }

    let mut resolver_config = ResolverConfig::new();
    for server in &parsed_servers {
        resolver_config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
        resolver_config.add_name_server(NameServerConfig::new(*server, Protocol::Tcp));
    }

    let resolver = TokioAsyncResolver::tokio(resolver_config, ResolverOpts::default());
    *resolver_guard = Some(Arc::new(resolver));
    DNS_CACHE.clear().await;

    info!(
        "[DNS] Custom DNS servers configured: {}",
        parsed_servers
            .iter()
            .map(|addr| addr.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(())
}

fn parse_dns_server(entry: &str) -> std::io::Result<SocketAddr> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "DNS server address is empty",
        ));
    }

    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    Err(Error::new(
        ErrorKind::InvalidInput,
        format!("invalid DNS server '{}'", entry),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_literal_short_circuits() {
        let addr = tokio_test::block_on(resolve_ipv4("127.0.0.1", 1080)).unwrap();
        assert_eq!(addr, "127.0.0.1:1080".parse().unwrap());
    }

    #[test]
    fn test_ipv6_literal_rejected() {
        let err = tokio_test::block_on(resolve_ipv4("::1", 1080)).unwrap_err();
        assert!(matches!(err, TunnelError::NoAddress(_)));
    }

    #[test]
    fn test_parse_dns_server_defaults_port() {
        let addr = parse_dns_server("8.8.8.8").unwrap();
        assert_eq!(addr, "8.8.8.8:53".parse().unwrap());
        assert!(parse_dns_server("").is_err());
        assert!(parse_dns_server("not-an-ip").is_err());
    }
}
