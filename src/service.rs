//! Service (C5): a single named listener binding together a protocol, a
//! listen address, and a [`BackendPool`], started and stopped as a unit.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{Protocol, ServiceConfig};
use crate::dns::DnsResolver;
use crate::error::{ConfigError, RelayError, Result};
use crate::events::EventSender;
use crate::pool::{Backend, BackendPool};
use crate::relay::tcp::{bind_reuseport as bind_tcp, run_tcp_listener, TcpStats};
use crate::relay::udp::{bind_reuseport as bind_udp, run_udp_listener, UdpStats};
use crate::relay::DEFAULT_IDLE_TIMEOUT;

/// Counters snapshot for a running service (spec §4.5): TCP connection
/// counts and byte totals, UDP packet and byte totals.
#[derive(Debug, Clone, Default)]
pub struct ServiceCounters {
    pub tcp_connections_total: u64,
    pub tcp_connections_active: u64,
    pub tcp_connections_rejected: u64,
    pub tcp_bytes_sent: u64,
    pub tcp_bytes_received: u64,
    pub udp_packets_in: u64,
    pub udp_packets_out: u64,
    pub udp_bytes_sent: u64,
    pub udp_bytes_received: u64,
}

pub struct Service {
    pub name: String,
    pub config: ServiceConfig,
    pool: Arc<BackendPool>,
    tcp_stats: Arc<TcpStats>,
    udp_stats: Arc<UdpStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    pub fn new(config: ServiceConfig, dns: Arc<DnsResolver>, events: EventSender) -> Result<Self> {
        let backends: Vec<Backend> = config
            .backends
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let (host, port) = crate::config::parse_backend(spec)?;
                Ok::<_, crate::error::ConfigError>(Backend::with_index(host, port, index))
            })
            .collect::<std::result::Result<_, _>>()?;

        let cooldown = Duration::from_secs_f64(config.backend_cooldown);
        let pool = BackendPool::new(
            config.name.clone(),
            backends,
            cooldown,
            dns,
            events,
            config.health_check.clone(),
        );

        Ok(Self {
            name: config.name.clone(),
            config,
            pool,
            tcp_stats: Arc::new(TcpStats::default()),
            udp_stats: Arc::new(UdpStats::default()),
            tasks: Vec::new(),
        })
    }

    pub fn pool(&self) -> Arc<BackendPool> {
        Arc::clone(&self.pool)
    }

    pub async fn start(&mut self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.listen.address, self.config.listen.port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "service '{}': invalid listen address '{}:{}'",
                    self.name, self.config.listen.address, self.config.listen.port
                ))
            })?;

        if matches!(self.config.protocol, Protocol::Tcp | Protocol::Both) {
            let listener = bind_tcp(addr).map_err(|source| RelayError::Bind { addr, source })?;
            let name = self.name.clone();
            let pool = Arc::clone(&self.pool);
            let stats = Arc::clone(&self.tcp_stats);
            let handle = tokio::spawn(async move {
                if let Err(e) = run_tcp_listener(name.clone(), listener, pool, DEFAULT_IDLE_TIMEOUT, stats).await {
                    tracing::error!(service = %name, error = %e, "tcp listener exited");
                }
            });
            self.tasks.push(handle);
        }

        if matches!(self.config.protocol, Protocol::Udp | Protocol::Both) {
            let socket = bind_udp(addr).map_err(|source| RelayError::Bind { addr, source })?;
            let name = self.name.clone();
            let pool = Arc::clone(&self.pool);
            let udp_stats = Arc::clone(&self.udp_stats);
            let handle = tokio::spawn(async move {
                if let Err(e) = run_udp_listener(name.clone(), socket, pool, DEFAULT_IDLE_TIMEOUT, udp_stats).await {
                    tracing::error!(service = %name, error = %e, "udp listener exited");
                }
            });
            self.tasks.push(handle);
        }

        self.pool.start_health_check().await;
        tracing::info!(service = %self.name, %addr, protocol = ?self.config.protocol, "service started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.pool.stop_health_check().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(service = %self.name, "service stopped");
    }

    pub async fn status(&self) -> crate::pool::PoolStatus {
        self.pool.status().await
    }

    /// Counters snapshot for the out-of-scope admin UI's `get_status`
    /// consumer (spec §4.5).
    pub fn counters(&self) -> ServiceCounters {
        ServiceCounters {
            tcp_connections_total: self.tcp_stats.connections_accepted.load(Ordering::Relaxed),
            tcp_connections_active: self.tcp_stats.connections_active.load(Ordering::Relaxed),
            tcp_connections_rejected: self.tcp_stats.connections_rejected.load(Ordering::Relaxed),
            tcp_bytes_sent: self.tcp_stats.bytes_out.load(Ordering::Relaxed),
            tcp_bytes_received: self.tcp_stats.bytes_in.load(Ordering::Relaxed),
            udp_packets_in: self.udp_stats.packets_in.load(Ordering::Relaxed),
            udp_packets_out: self.udp_stats.packets_out.load(Ordering::Relaxed),
            udp_bytes_sent: self.udp_stats.bytes_out.load(Ordering::Relaxed),
            udp_bytes_received: self.udp_stats.bytes_in.load(Ordering::Relaxed),
        }
    }
}
