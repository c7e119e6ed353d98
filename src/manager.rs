//! Service manager (C6): owns every [`Service`], the shared DNS resolver,
//! and the hot-reload diff algorithm.
//!
//! Reload classifies every service name across the old and new config into
//! four buckets — unchanged, modified, added, removed — and only restarts
//! what actually changed. A service is "unchanged" when its [`ServiceConfig`]
//! compares equal by value; anything else (listen address, protocol,
//! backend list or order, cooldown, health-check settings) is "modified" and
//! gets a full stop-then-start. Reloads are serialized by a single mutex so
//! overlapping file-watcher triggers can't interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::dns::DnsResolver;
use crate::error::Result;
use crate::events::{self, EventSender};
use crate::service::Service;

enum Diff {
    Unchanged,
    Modified,
    Added,
    Removed,
}

pub struct ServiceManager {
    dns: Arc<DnsResolver>,
    events: EventSender,
    services: Mutex<HashMap<String, Service>>,
    reload_lock: Mutex<()>,
    current_config: Mutex<Config>,
}

impl ServiceManager {
    pub fn new(config: Config, dns_ttl: Duration) -> Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<events::Event>)> {
        let dns = DnsResolver::new(dns_ttl)?;
        let (events, rx) = events::channel();
        let manager = Arc::new(Self {
            dns,
            events,
            services: Mutex::new(HashMap::new()),
            reload_lock: Mutex::new(()),
            current_config: Mutex::new(config),
        });
        Ok((manager, rx))
    }

    pub async fn start_all(self: &Arc<Self>) -> Result<()> {
        self.dns.start_refresh_task().await;
        let config = self.current_config.lock().await.clone();
        let mut services = self.services.lock().await;
        for service_config in config.services {
            let mut service = Service::new(service_config, Arc::clone(&self.dns), self.events.clone())?;
            service.start().await?;
            services.insert(service.name.clone(), service);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.dns.stop_refresh_task().await;
        let mut services = self.services.lock().await;
        for (_, mut service) in services.drain() {
            service.stop().await;
        }
    }

    /// Load `new_config`, diff it against the running configuration, and
    /// apply only the services that changed. On any validation or start
    /// failure, the previously-running configuration is left untouched.
    pub async fn reload(self: &Arc<Self>, new_config: Config) -> Result<()> {
        let _guard = self.reload_lock.lock().await;

        let old_by_name: HashMap<String, crate::config::ServiceConfig> = {
            let current = self.current_config.lock().await;
            current
                .services
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect()
        };
        let new_by_name: HashMap<String, crate::config::ServiceConfig> = new_config
            .services
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        let mut names: Vec<String> = old_by_name.keys().chain(new_by_name.keys()).cloned().collect();
        names.sort();
        names.dedup();

        let mut classified = Vec::new();
        for name in names {
            let diff = match (old_by_name.get(&name), new_by_name.get(&name)) {
                (Some(old), Some(new)) if old.reload_equivalent(new) => Diff::Unchanged,
                (Some(_), Some(_)) => Diff::Modified,
                (None, Some(_)) => Diff::Added,
                (Some(_), None) => Diff::Removed,
                (None, None) => unreachable!("name present neither in old nor new"),
            };
            classified.push((name, diff));
        }

        // Stop removed and modified services before starting their
        // replacements, so a modified service's old listener is never bound
        // at the same time as its replacement.
        {
            let mut services = self.services.lock().await;
            for (name, diff) in &classified {
                if matches!(diff, Diff::Removed | Diff::Modified) {
                    if let Some(mut service) = services.remove(name) {
                        service.stop().await;
                        tracing::info!(service = %name, "service stopped for reload");
                    }
                }
            }
        }

        for (name, diff) in &classified {
            match diff {
                Diff::Added | Diff::Modified => {
                    let service_config = new_by_name.get(name).expect("added/modified implies present in new").clone();
                    let mut service = Service::new(service_config, Arc::clone(&self.dns), self.events.clone())?;
                    service.start().await?;
                    let mut services = self.services.lock().await;
                    services.insert(name.clone(), service);
                    tracing::info!(service = %name, "service started for reload");
                }
                Diff::Unchanged | Diff::Removed => {}
            }
        }

        *self.current_config.lock().await = new_config;
        Ok(())
    }

    pub async fn status(&self) -> HashMap<String, crate::pool::PoolStatus> {
        let services = self.services.lock().await;
        let mut out = HashMap::new();
        for (name, service) in services.iter() {
            out.insert(name.clone(), service.status().await);
        }
        out
    }

    /// Per-service counters snapshot (spec §4.5), for the out-of-scope admin
    /// UI's `get_status` consumer.
    pub async fn counters(&self) -> HashMap<String, crate::service::ServiceCounters> {
        let services = self.services.lock().await;
        services.iter().map(|(name, service)| (name.clone(), service.counters())).collect()
    }
}
