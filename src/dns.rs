//! TTL-caching DNS resolver (C1).
//!
//! Caches resolved address lists per hostname. Unlike a per-entry-TTL cache,
//! the whole cache is cleared on a fixed interval (`ttl`) rather than expiring
//! individual entries — preserved verbatim from original_source's
//! `core/dns_resolver.py`, whose `_refresh_loop` calls `self.cache.clear()`
//! wholesale every `ttl` seconds. A resolution failure falls back to a stale
//! cache entry, if one exists, rather than propagating the error.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    /// Host string is already a literal address; resolution is a parse, not
    /// a lookup, and the result is never cached.
    Literal,
    /// Host string is a domain name and must go through the resolver.
    Name,
}

pub fn classify_host(host: &str) -> HostKind {
    if host.parse::<IpAddr>().is_ok() {
        HostKind::Literal
    } else {
        HostKind::Name
    }
}

struct Cache {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl Cache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<Cache>,
    ttl: Duration,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DnsResolver {
    /// Build a resolver from the system configuration (`/etc/resolv.conf`
    /// where available), falling back to `hickory-resolver`'s built-in
    /// public-resolver defaults otherwise.
    pub fn new(ttl: Duration) -> Result<Arc<Self>, RelayError> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(_) => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        };
        Ok(Arc::new(Self {
            resolver,
            cache: Mutex::new(Cache::new()),
            ttl,
            refresh_handle: Mutex::new(None),
        }))
    }

    /// Resolve `host` to its address list. IP literals bypass the cache and
    /// resolver entirely. Looks up both A and AAAA records, matching
    /// original_source's `AF_UNSPEC` resolution.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, RelayError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        {
            let cache = self.cache.lock().await;
            if let Some(addrs) = cache.entries.get(host) {
                return Ok(addrs.clone());
            }
        }

        match self.lookup(host).await {
            Ok(addrs) => {
                let mut cache = self.cache.lock().await;
                cache.entries.insert(host.to_string(), addrs.clone());
                Ok(addrs)
            }
            Err(err) => {
                let cache = self.cache.lock().await;
                if let Some(stale) = cache.entries.get(host) {
                    tracing::warn!(host, error = %err, "dns lookup failed, serving stale cache entry");
                    Ok(stale.clone())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, RelayError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| RelayError::Dns(format!("resolving '{host}': {e}")))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(RelayError::Dns(format!("no addresses found for '{host}'")));
        }
        Ok(addrs)
    }

    /// Drop a single hostname's cache entry. Used on the first connect
    /// failure for a backend, so the next attempt re-resolves rather than
    /// retrying a possibly-stale address.
    pub async fn invalidate(&self, host: &str) {
        let mut cache = self.cache.lock().await;
        cache.entries.remove(host);
    }

    /// Drop every cached entry.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.entries.clear();
    }

    /// Start the background task that clears the whole cache every `ttl`.
    /// Idempotent: calling it twice replaces the previous task.
    pub async fn start_refresh_task(self: &Arc<Self>) {
        let mut handle = self.refresh_handle.lock().await;
        if let Some(existing) = handle.take() {
            existing.abort();
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.ttl);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                this.clear_cache().await;
                tracing::debug!("dns cache cleared");
            }
        }));
    }

    pub async fn stop_refresh_task(&self) {
        let mut handle = self.refresh_handle.lock().await;
        if let Some(existing) = handle.take() {
            existing.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ipv4_literal() {
        assert_eq!(classify_host("10.0.0.1"), HostKind::Literal);
    }

    #[test]
    fn classifies_ipv6_literal() {
        assert_eq!(classify_host("::1"), HostKind::Literal);
    }

    #[test]
    fn classifies_domain_name() {
        assert_eq!(classify_host("example.com"), HostKind::Name);
    }

    #[tokio::test]
    async fn literal_resolution_bypasses_cache() {
        let resolver = DnsResolver::new(Duration::from_secs(3600)).unwrap();
        let addrs = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        let cache = resolver.cache.lock().await;
        assert!(cache.entries.is_empty());
    }

    #[tokio::test]
    async fn invalidate_removes_single_entry() {
        let resolver = DnsResolver::new(Duration::from_secs(3600)).unwrap();
        {
            let mut cache = resolver.cache.lock().await;
            cache
                .entries
                .insert("a.example".to_string(), vec!["1.2.3.4".parse().unwrap()]);
            cache
                .entries
                .insert("b.example".to_string(), vec!["5.6.7.8".parse().unwrap()]);
        }
        resolver.invalidate("a.example").await;
        let cache = resolver.cache.lock().await;
        assert!(!cache.entries.contains_key("a.example"));
        assert!(cache.entries.contains_key("b.example"));
    }

    #[tokio::test]
    async fn clear_cache_drops_everything() {
        let resolver = DnsResolver::new(Duration::from_secs(3600)).unwrap();
        {
            let mut cache = resolver.cache.lock().await;
            cache
                .entries
                .insert("a.example".to_string(), vec!["1.2.3.4".parse().unwrap()]);
        }
        resolver.clear_cache().await;
        let cache = resolver.cache.lock().await;
        assert!(cache.entries.is_empty());
    }
}
