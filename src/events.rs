//! Lifecycle events (`backend_failed`, `all_backends_unavailable`,
//! `backend_recovered`) emitted by the backend pool.
//!
//! Emission is fire-and-forget: the pool sends onto an unbounded channel
//! without awaiting any consumer, so a slow or absent consumer can never
//! stall the connect path. The default consumer just logs; the out-of-scope
//! collaborator (subprocess event-hook execution) would sit on the receiving
//! end of the same channel in a fuller deployment.

use std::net::IpAddr;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BackendFailed,
    AllBackendsUnavailable,
    BackendRecovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventKind,
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_ip: Option<IpAddr>,
    pub failure_count: u32,
    pub available_count: usize,
    pub total_count: usize,
    pub timestamp: String,
}

impl Event {
    pub fn new(
        event_type: EventKind,
        service_name: impl Into<String>,
        failure_count: u32,
        available_count: usize,
        total_count: usize,
    ) -> Self {
        Self {
            event_type,
            service_name: service_name.into(),
            backend_host: None,
            backend_port: None,
            backend_ip: None,
            failure_count,
            available_count,
            total_count,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn with_backend(mut self, host: impl Into<String>, port: u16, ip: Option<IpAddr>) -> Self {
        self.backend_host = Some(host.into());
        self.backend_port = Some(port);
        self.backend_ip = ip;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Sending half handed to a `BackendPool`; cloneable so every pool can share
/// one manager-owned channel.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn emit(&self, event: Event) {
        // Fire-and-forget: a closed receiver (no consumer configured) is not
        // an error for the caller.
        let _ = self.tx.send(event);
    }
}

pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Default consumer: logs every event at `info` level. Spawned by the
/// service manager when no richer consumer (the out-of-scope event-hook
/// subprocess runner) is configured.
pub async fn log_consumer(mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(
            event_type = ?event.event_type,
            service = %event.service_name,
            backend = event.backend_host.as_deref().unwrap_or("-"),
            failure_count = event.failure_count,
            available_count = event.available_count,
            total_count = event.total_count,
            "{}",
            event.to_json()
        );
    }
}
