//! Backend pool with two-strike failover (C2).
//!
//! Selection is sequential, primary-first: backends are always tried in
//! configured order, never rotated or load-balanced across. A backend earns
//! two strikes before it is quarantined: the first connect failure
//! invalidates its DNS cache entry (the address may simply be stale), the
//! second marks it unhealthy for `backend_cooldown` and moves it to the tail
//! of the selection order. A successful connect clears both strikes and the
//! cooldown. `all_backends_unavailable` is edge-triggered: it fires once when
//! every backend becomes ineligible, and is cleared the next time selection
//! finds at least one eligible backend again — not merely on a connect
//! success, since the quarantine clock alone can restore eligibility.
//!
//! Grounded in original_source's `backend_pool.py`, carrying its exact
//! two-strike/cooldown semantics; snapshot-then-probe structure for health
//! checks follows the teacher's `BackendPool::select_and_connect` pattern of
//! cloning state before doing I/O so the lock is never held across a network
//! call.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::HealthCheckConfig;
use crate::dns::{classify_host, DnsResolver, HostKind};
use crate::events::{Event, EventKind, EventSender};

#[derive(Debug, Clone, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub host_kind: HostKind,
    /// Position in the original configured backend list. Diagnostic only —
    /// never consulted for selection order, which lives in the pool's vector
    /// position instead, and deliberately excluded from equality/hashing so
    /// identity is purely the dial target.
    pub original_index: usize,
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.host_kind == other.host_kind
    }
}

impl std::hash::Hash for Backend {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.host_kind.hash(state);
    }
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_index(host, port, 0)
    }

    pub fn with_index(host: impl Into<String>, port: u16, original_index: usize) -> Self {
        let host = host.into();
        let host_kind = classify_host(&host);
        Self {
            host,
            port,
            host_kind,
            original_index,
        }
    }

    pub fn display(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

struct BackendState {
    backend: Backend,
    strikes: u32,
    unhealthy_until: Option<Instant>,
    attempted: u64,
    succeeded: u64,
}

impl BackendState {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            strikes: 0,
            unhealthy_until: None,
            attempted: 0,
            succeeded: 0,
        }
    }

    fn eligible(&self, now: Instant) -> bool {
        match self.unhealthy_until {
            None => true,
            Some(until) => until <= now,
        }
    }

    fn is_unhealthy(&self) -> bool {
        self.unhealthy_until.is_some()
    }
}

struct PoolState {
    backends: Vec<BackendState>,
    all_unavailable: bool,
}

#[derive(Debug, Clone)]
pub struct BackendStatusEntry {
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub strikes: u32,
    pub connections_attempted: u64,
    pub connections_succeeded: u64,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub backends: Vec<BackendStatusEntry>,
    pub all_unavailable: bool,
}

pub struct BackendPool {
    service_name: String,
    cooldown: Duration,
    state: Mutex<PoolState>,
    dns: Arc<DnsResolver>,
    events: EventSender,
    health_check: Option<HealthCheckConfig>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    dial_counter: AtomicU64,
}

impl BackendPool {
    pub fn new(
        service_name: impl Into<String>,
        backends: Vec<Backend>,
        cooldown: Duration,
        dns: Arc<DnsResolver>,
        events: EventSender,
        health_check: Option<HealthCheckConfig>,
    ) -> Arc<Self> {
        let states = backends.into_iter().map(BackendState::new).collect();
        Arc::new(Self {
            service_name: service_name.into(),
            cooldown,
            state: Mutex::new(PoolState {
                backends: states,
                all_unavailable: false,
            }),
            dns,
            events,
            health_check,
            health_task: Mutex::new(None),
            dial_counter: AtomicU64::new(0),
        })
    }

    /// Eligible backends in fixed configured order, each paired with the IP
    /// resolved for this selection pass. A backend in cooldown, or whose DNS
    /// resolution fails, is skipped without being charged a strike — only
    /// `OnConnectFailure` strikes a backend. Resolution happens without
    /// holding the pool lock (the snapshot of cooldown state is taken first)
    /// so one slow DNS lookup can't serialize every other pool operation;
    /// see the "resolved under the pool lock" open question in the design
    /// notes for why this departs from the naive reading of the algorithm.
    ///
    /// `all_backends_unavailable` is edge-triggered here, exactly where the
    /// selection algorithm computes it: it fires once when every backend is
    /// skipped (by cooldown or DNS failure) and clears the moment selection
    /// produces a non-empty result again.
    pub async fn get_backends_in_order(&self) -> Vec<(Backend, IpAddr)> {
        let now = Instant::now();
        let snapshot: Vec<(Backend, bool)> = {
            let state = self.state.lock().await;
            state
                .backends
                .iter()
                .map(|s| (s.backend.clone(), s.eligible(now)))
                .collect()
        };

        let mut result = Vec::new();
        let mut any_skipped = false;
        for (backend, cooldown_ok) in snapshot {
            if !cooldown_ok {
                any_skipped = true;
                continue;
            }
            match self.dns.resolve(&backend.host).await {
                Ok(ips) if !ips.is_empty() => {
                    let ip = ips[0];
                    result.push((backend, ip));
                }
                _ => {
                    tracing::warn!(backend = %backend.display(), "dns resolution failed, skipping this pass");
                    any_skipped = true;
                }
            }
        }

        let newly_unavailable = {
            let mut state = self.state.lock().await;
            if !result.is_empty() {
                state.all_unavailable = false;
                false
            } else if any_skipped && !state.all_unavailable {
                state.all_unavailable = true;
                true
            } else {
                false
            }
        };

        if newly_unavailable {
            let total = self.state.lock().await.backends.len();
            self.events.emit(Event::new(
                EventKind::AllBackendsUnavailable,
                &self.service_name,
                0,
                0,
                total,
            ));
        }

        result
    }

    fn find_mut<'a>(state: &'a mut PoolState, backend: &Backend) -> Option<&'a mut BackendState> {
        state.backends.iter_mut().find(|s| &s.backend == backend)
    }

    pub async fn on_connect_success(&self, backend: &Backend) {
        let mut state = self.state.lock().await;
        let was_unhealthy = Self::find_mut(&mut state, backend).map(|s| s.is_unhealthy()).unwrap_or(false);
        let (available, total) = {
            let now = Instant::now();
            let total = state.backends.len();
            let available = state.backends.iter().filter(|s| s.eligible(now)).count();
            (available, total)
        };
        if let Some(s) = Self::find_mut(&mut state, backend) {
            s.strikes = 0;
            s.unhealthy_until = None;
            s.succeeded += 1;
        }
        drop(state);

        if was_unhealthy {
            self.events.emit(
                Event::new(EventKind::BackendRecovered, &self.service_name, 0, available + 1, total)
                    .with_backend(backend.host.clone(), backend.port, None),
            );
        }
    }

    pub async fn on_connect_failure(&self, backend: &Backend) {
        let mut state = self.state.lock().await;
        let strikes = {
            let Some(s) = Self::find_mut(&mut state, backend) else {
                return;
            };
            s.strikes += 1;
            s.strikes
        };

        if strikes == 1 {
            self.dns.invalidate(&backend.host).await;
        }

        // `backend_failed` fires only at quarantine (the second strike), per
        // spec §4.1 — a lone first strike only invalidates DNS and retries,
        // it is not itself an event.
        let mut quarantine_event = None;
        if strikes >= 2 {
            if let Some(s) = Self::find_mut(&mut state, backend) {
                s.unhealthy_until = Some(Instant::now() + self.cooldown);
                s.strikes = 0;
            }
            if let Some(pos) = state.backends.iter().position(|s| &s.backend == backend) {
                let moved = state.backends.remove(pos);
                state.backends.push(moved);
            }
            tracing::warn!(
                service = %self.service_name,
                backend = %backend.display(),
                original_index = backend.original_index,
                "backend quarantined after two strikes"
            );

            let now = Instant::now();
            let total = state.backends.len();
            let available = state.backends.iter().filter(|s| s.eligible(now)).count();
            quarantine_event = Some(
                Event::new(EventKind::BackendFailed, &self.service_name, strikes, available, total)
                    .with_backend(backend.host.clone(), backend.port, None),
            );
        }
        drop(state);

        if let Some(event) = quarantine_event {
            self.events.emit(event);
        }
    }

    /// Record a dial attempt for ambient stats, independent of the eventual
    /// success/failure report.
    pub async fn note_attempt(&self, backend: &Backend) {
        self.dial_counter.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        if let Some(s) = Self::find_mut(&mut state, backend) {
            s.attempted += 1;
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let backends = state
            .backends
            .iter()
            .map(|s| BackendStatusEntry {
                host: s.backend.host.clone(),
                port: s.backend.port,
                healthy: s.eligible(now),
                strikes: s.strikes,
                connections_attempted: s.attempted,
                connections_succeeded: s.succeeded,
            })
            .collect();
        PoolStatus {
            backends,
            all_unavailable: state.all_unavailable,
        }
    }

    pub async fn start_health_check(self: &Arc<Self>) {
        let Some(hc) = self.health_check.clone() else {
            return;
        };
        if !hc.enabled {
            return;
        }
        let mut task = self.health_task.lock().await;
        if let Some(existing) = task.take() {
            existing.abort();
        }
        let this = Arc::clone(self);
        let interval = Duration::from_secs_f64(hc.interval);
        let timeout = Duration::from_secs_f64(hc.timeout);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.run_health_probe(timeout).await;
            }
        }));
    }

    pub async fn stop_health_check(&self) {
        let mut task = self.health_task.lock().await;
        if let Some(existing) = task.take() {
            existing.abort();
        }
    }

    async fn run_health_probe(self: &Arc<Self>, timeout: Duration) {
        let snapshot: Vec<Backend> = {
            let state = self.state.lock().await;
            state.backends.iter().map(|s| s.backend.clone()).collect()
        };

        for backend in snapshot {
            let this = Arc::clone(self);
            let timeout = timeout;
            tokio::spawn(async move {
                let ok = this.probe_once(&backend, timeout).await;
                if ok {
                    this.on_connect_success(&backend).await;
                } else {
                    this.on_connect_failure(&backend).await;
                }
            });
        }
    }

    async fn probe_once(&self, backend: &Backend, timeout: Duration) -> bool {
        let addrs = match self.dns.resolve(&backend.host).await {
            Ok(addrs) => addrs,
            Err(_) => return false,
        };
        for ip in addrs {
            let addr = SocketAddr::new(ip, backend.port);
            if tokio::time::timeout(timeout, TcpStream::connect(addr)).await.is_ok_and(|r| r.is_ok()) {
                return true;
            }
        }
        false
    }
}
