//! UDP relay path (C4): per-client session demultiplexing.
//!
//! Each client address gets its own dedicated upstream socket so backend
//! replies can be routed back without a shared-socket demux table keyed by
//! backend address. A semaphore caps concurrently-spawned datagram handler
//! tasks (default 1000, matching original_source's `_task_semaphore`) so a
//! flood of distinct client addresses can't explode the task count. A reaper
//! sweeps sessions idle longer than the idle timeout every 60 seconds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::pool::BackendPool;

const DEFAULT_MAX_SESSIONS: usize = 1000;
const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const DATAGRAM_BUFFER: usize = 65536;

#[derive(Default)]
pub struct UdpStats {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

struct Session {
    upstream: Arc<UdpSocket>,
    last_activity: Instant,
}

struct SessionTable {
    sessions: HashMap<SocketAddr, Session>,
}

/// Owns every task `run_udp_listener` spawns (the reaper and one per
/// session) so cancelling the listener's own task — `Service::stop` only
/// aborts that single `JoinHandle` — tears down its children too. Tokio task
/// cancellation drops the cancelled future's locals, so keeping this guard
/// alive as a plain local in `run_udp_listener` is enough: `Drop` runs at the
/// abort point and aborts every tracked child, closing their upstream
/// sockets per spec §4.4 ("on service shutdown: cancel reaper; close every
/// upstream socket").
struct ChildTasks {
    reaper: Option<JoinHandle<()>>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Drop for ChildTasks {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        if let Ok(sessions) = self.sessions.try_lock() {
            for handle in sessions.iter() {
                handle.abort();
            }
        }
    }
}

pub async fn run_udp_listener(
    name: String,
    socket: UdpSocket,
    pool: Arc<BackendPool>,
    idle_timeout: Duration,
    stats: Arc<UdpStats>,
) -> std::io::Result<()> {
    let addr = socket.local_addr()?;
    let socket = Arc::new(socket);
    let table = Arc::new(Mutex::new(SessionTable {
        sessions: HashMap::new(),
    }));
    let permits = Arc::new(Semaphore::new(DEFAULT_MAX_SESSIONS));

    tracing::info!(service = %name, %addr, "udp listener bound");

    let session_handles = Arc::new(Mutex::new(Vec::new()));
    let reaper = tokio::spawn(reap_stale_sessions(
        Arc::clone(&table),
        idle_timeout,
        Arc::clone(&session_handles),
    ));
    let _children = ChildTasks {
        reaper: Some(reaper),
        sessions: Arc::clone(&session_handles),
    };

    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    loop {
        let (n, client_addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(service = %name, error = %e, "udp recv failed");
                continue;
            }
        };
        let datagram = buf[..n].to_vec();
        stats.packets_in.fetch_add(1, Ordering::Relaxed);
        stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

        let existing = {
            let table = table.lock().await;
            table.sessions.contains_key(&client_addr)
        };

        if existing {
            forward_to_existing(&table, client_addr, &datagram).await;
            continue;
        }

        let permit = match Arc::clone(&permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(service = %name, %client_addr, "udp session rejected, at capacity");
                continue;
            }
        };

        let pool = Arc::clone(&pool);
        let table = Arc::clone(&table);
        let reply_socket = Arc::clone(&socket);
        let name = name.clone();
        let stats = Arc::clone(&stats);

        let handle = tokio::spawn(async move {
            let _permit = permit;
            establish_session_and_forward(name, client_addr, datagram, pool, table, reply_socket, idle_timeout, stats).await;
        });
        session_handles.lock().await.push(handle);
    }
}

/// Binds eagerly for the same reason as the TCP side's `bind_reuseport`: a
/// bad listen address must fail `Service::start()`, not just this task.
pub fn bind_reuseport(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Socket, Type};
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

async fn forward_to_existing(table: &Arc<Mutex<SessionTable>>, client_addr: SocketAddr, datagram: &[u8]) {
    let mut table = table.lock().await;
    if let Some(session) = table.sessions.get_mut(&client_addr) {
        if session.upstream.send(datagram).await.is_ok() {
            session.last_activity = Instant::now();
        }
    }
}

async fn establish_session_and_forward(
    service_name: String,
    client_addr: SocketAddr,
    first_datagram: Vec<u8>,
    pool: Arc<BackendPool>,
    table: Arc<Mutex<SessionTable>>,
    reply_socket: Arc<UdpSocket>,
    idle_timeout: Duration,
    stats: Arc<UdpStats>,
) {
    // Per spec §4.4: the first entry of `GetBackendsInOrder()` is selected
    // once at session creation; UDP has no two-strike feedback from the data
    // path itself, only `note_attempt` for ambient stats.
    let candidates = pool.get_backends_in_order().await;
    let Some((backend, ip)) = candidates.into_iter().next() else {
        tracing::warn!(service = %service_name, %client_addr, "no backend reachable for udp session");
        return;
    };
    pool.note_attempt(&backend).await;
    let upstream_addr = SocketAddr::new(ip, backend.port);

    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to bind upstream udp socket");
            return;
        }
    };
    // `connect` on a UDP socket only records a default peer address locally;
    // it never touches the network, so its result says nothing about backend
    // reachability. Per spec §4.4 the UDP data path never reports outcomes
    // through `OnConnectSuccess`/`OnConnectFailure` — that feedback loop is
    // exclusively TCP health probes (or absent for UDP-only services).
    if let Err(e) = upstream.connect(upstream_addr).await {
        tracing::warn!(error = %e, backend = %backend.display(), "udp connect failed");
        return;
    }

    let upstream = Arc::new(upstream);
    if upstream.send(&first_datagram).await.is_err() {
        return;
    }

    {
        let mut table = table.lock().await;
        table.sessions.insert(
            client_addr,
            Session {
                upstream: Arc::clone(&upstream),
                last_activity: Instant::now(),
            },
        );
    }

    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    loop {
        match tokio::time::timeout(idle_timeout, upstream.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                if reply_socket.send_to(&buf[..n], client_addr).await.is_ok() {
                    stats.packets_out.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                }
                let mut table = table.lock().await;
                if let Some(session) = table.sessions.get_mut(&client_addr) {
                    session.last_activity = Instant::now();
                } else {
                    break;
                }
            }
            Ok(Err(_)) => break,
            Err(_) => {
                let table = table.lock().await;
                match table.sessions.get(&client_addr) {
                    Some(session) if session.last_activity.elapsed() < idle_timeout => continue,
                    _ => break,
                }
            }
        }
    }
}

async fn reap_stale_sessions(
    table: Arc<Mutex<SessionTable>>,
    idle_timeout: Duration,
    session_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    loop {
        ticker.tick().await;
        let mut table = table.lock().await;
        let before = table.sessions.len();
        table
            .sessions
            .retain(|_, session| session.last_activity.elapsed() < idle_timeout);
        let reaped = before - table.sessions.len();
        if reaped > 0 {
            tracing::debug!(reaped, "reaped idle udp sessions");
        }
        drop(table);

        let mut handles = session_handles.lock().await;
        handles.retain(|h| !h.is_finished());
    }
}
