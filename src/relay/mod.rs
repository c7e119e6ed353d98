//! Relay data paths (C3/C4): TCP accept-and-pipe and UDP session demux.
//!
//! ```text
//! listener (TCP accept / UDP recv)
//!        |
//!        v
//!   BackendPool::get_backends_in_order
//!        |
//!        v
//!   dial first reachable backend (connect timeout)
//!        |
//!        v
//!   bidirectional copy, idle timeout per read
//! ```
//!
//! Both paths report every dial attempt and its outcome back to the pool so
//! the two-strike policy in [`crate::pool`] stays accurate.

pub mod tcp;
pub mod udp;

pub use tcp::run_tcp_listener;
pub use udp::run_udp_listener;

use std::time::Duration;

/// Default timeout for establishing a connection to a backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default idle timeout for an established relay (no bytes either direction).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Buffer size for the TCP relay's copy loop.
pub const BUFFER_SIZE: usize = 65536;
