//! TCP relay path (C3).
//!
//! Accept loop bound with `SO_REUSEPORT` (so TCP and UDP can share a port
//! across services, and so the service manager can rebind cleanly across a
//! reload), gated by a [`Semaphore`] the way the teacher's `Listener::run`
//! gates connections against `max_connections`. Each accepted connection
//! dials backends in pool order with a per-attempt connect timeout, then
//! relays bidirectionally until either side closes or goes idle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::pool::BackendPool;
use crate::relay::{BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT};

/// Default cap on concurrent TCP connections per listener; an ambient
/// resource-safety measure the teacher's `Listener` carries as
/// `max_connections` (default 10,000).
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Default)]
pub struct TcpStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub connections_active: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// Binds eagerly so a misconfigured or already-in-use listen address fails
/// `Service::start()` synchronously rather than surfacing only as a log line
/// from a detached task.
pub fn bind_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

pub async fn run_tcp_listener(
    name: String,
    listener: TcpListener,
    pool: Arc<BackendPool>,
    idle_timeout: Duration,
    stats: Arc<TcpStats>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    let permits = Arc::new(Semaphore::new(DEFAULT_MAX_CONNECTIONS));
    tracing::info!(service = %name, %addr, "tcp listener bound");

    loop {
        let (client, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(service = %name, error = %e, "tcp accept failed");
                continue;
            }
        };

        let permit = match Arc::clone(&permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(service = %name, %peer_addr, "tcp connection rejected, at capacity");
                continue;
            }
        };

        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(&pool);
        let stats = Arc::clone(&stats);
        let name = name.clone();

        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(
            async move {
                let _permit = permit;
                if let Err(e) = handle_connection(client, &pool, idle_timeout, &stats).await {
                    tracing::debug!(error = %e, "tcp connection ended with error");
                }
                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("connection", service = %name, peer = %peer_addr)),
        );
    }
}

async fn handle_connection(
    mut client: TcpStream,
    pool: &Arc<BackendPool>,
    idle_timeout: Duration,
    stats: &Arc<TcpStats>,
) -> std::io::Result<()> {
    let backend_stream = dial_with_failover(pool, DEFAULT_CONNECT_TIMEOUT).await;

    let mut upstream = match backend_stream {
        Some(stream) => stream,
        None => {
            tracing::warn!("no backend reachable, dropping connection");
            return Ok(());
        }
    };

    let (in_bytes, out_bytes) = proxy_bidirectional(&mut client, &mut upstream, idle_timeout).await?;
    stats.bytes_in.fetch_add(in_bytes, Ordering::Relaxed);
    stats.bytes_out.fetch_add(out_bytes, Ordering::Relaxed);
    Ok(())
}

/// Try each eligible backend in pool order, reporting the outcome of every
/// attempt back to the pool so failover state stays accurate. DNS resolution
/// already happened inside `get_backends_in_order`; an unresolvable backend
/// never reaches this loop, so every attempt here is a real connect outcome.
async fn dial_with_failover(pool: &Arc<BackendPool>, connect_timeout: Duration) -> Option<TcpStream> {
    let candidates = pool.get_backends_in_order().await;
    for (backend, ip) in candidates {
        pool.note_attempt(&backend).await;
        let sock_addr = SocketAddr::new(ip, backend.port);
        match tokio::time::timeout(connect_timeout, TcpStream::connect(sock_addr)).await {
            Ok(Ok(stream)) => {
                pool.on_connect_success(&backend).await;
                return Some(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(backend = %backend.display(), error = %e, "connect failed");
                pool.on_connect_failure(&backend).await;
            }
            Err(_) => {
                tracing::debug!(backend = %backend.display(), "connect timed out");
                pool.on_connect_failure(&backend).await;
            }
        }
    }
    None
}

/// Copy bytes in both directions until one side closes or goes idle for
/// longer than `idle_timeout`. Returns `(bytes_from_a, bytes_from_b)`.
pub async fn proxy_bidirectional(
    a: &mut TcpStream,
    b: &mut TcpStream,
    idle_timeout: Duration,
) -> std::io::Result<(u64, u64)> {
    let (mut a_read, mut a_write) = a.split();
    let (mut b_read, mut b_write) = b.split();

    let a_to_b = async {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match tokio::time::timeout(idle_timeout, a_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            };
            b_write.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        let _ = b_write.shutdown().await;
        Ok::<u64, std::io::Error>(total)
    };

    let b_to_a = async {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match tokio::time::timeout(idle_timeout, b_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            };
            a_write.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        let _ = a_write.shutdown().await;
        Ok::<u64, std::io::Error>(total)
    };

    let (in_bytes, out_bytes) = tokio::join!(a_to_b, b_to_a);
    Ok((in_bytes?, out_bytes?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener as TokioTcpListener;

    #[tokio::test]
    async fn proxy_bidirectional_relays_both_directions() {
        let listener_a = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let listener_b = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let server_a = tokio::spawn(async move {
            let (mut sock, _) = listener_a.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sock.write_all(b"world").await.unwrap();
        });
        let server_b = tokio::spawn(async move {
            let (mut sock, _) = listener_b.accept().await.unwrap();
            sock.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"world");
        });

        let mut conn_a = TcpStream::connect(addr_a).await.unwrap();
        let mut conn_b = TcpStream::connect(addr_b).await.unwrap();

        let relay = tokio::spawn(async move {
            proxy_bidirectional(&mut conn_a, &mut conn_b, Duration::from_secs(2)).await
        });

        server_a.await.unwrap();
        server_b.await.unwrap();
        let (in_bytes, out_bytes) = relay.await.unwrap().unwrap();
        assert_eq!(in_bytes, 5);
        assert_eq!(out_bytes, 5);
    }
}
