//! Configuration schema, YAML loading, and validation.
//!
//! Mirrors the schema in spec §6. Parsing and schema validation are the
//! crate's own concern here (the out-of-scope collaborator in a fuller
//! deployment would be a richer layering/templating system on top of this),
//! but the resulting [`Config`] value is what every other component
//! consumes.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default backend cooldown: 30 minutes.
pub const DEFAULT_BACKEND_COOLDOWN: f64 = 1800.0;
/// Default health-check interval.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: f64 = 60.0;
/// Default health-check timeout.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: f64 = 5.0;
/// Default event-hook timeout.
pub const DEFAULT_EVENT_HOOK_TIMEOUT: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Both
    }
}

fn default_backend_cooldown() -> f64 {
    DEFAULT_BACKEND_COOLDOWN
}

fn default_health_check_interval() -> f64 {
    DEFAULT_HEALTH_CHECK_INTERVAL
}

fn default_health_check_timeout() -> f64 {
    DEFAULT_HEALTH_CHECK_TIMEOUT
}

fn default_event_hook_timeout() -> f64 {
    DEFAULT_EVENT_HOOK_TIMEOUT
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub interval: f64,
    #[serde(default = "default_health_check_timeout")]
    pub timeout: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventHookConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_event_hook_timeout")]
    pub timeout: f64,
}

/// Tolerated but out of scope: the core never reads this beyond parsing it.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct WebUiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub rest: std::collections::BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub listen: ListenConfig,
    pub backends: Vec<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_backend_cooldown")]
    pub backend_cooldown: f64,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub event_hook: Option<EventHookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub web_ui: Option<WebUiConfig>,
}

impl ServiceConfig {
    /// Structural equality for the hot-reload diff (spec §4.6): listen
    /// address+port, protocol, backend list (order-sensitive), cooldown, and
    /// health-check block. `event_hook` is deliberately excluded — event-hook
    /// subprocess execution is out of scope for the core (spec §1), so a
    /// hook-only edit must not force a service restart.
    pub fn reload_equivalent(&self, other: &Self) -> bool {
        self.listen == other.listen
            && self.protocol == other.protocol
            && self.backends == other.backends
            && self.backend_cooldown == other.backend_cooldown
            && self.health_check == other.health_check
    }
}

/// Parse a `host:port` backend string, per spec §6's grammar.
///
/// Supports IPv4/domain `host:port` and bracketed IPv6 `[::1]:80`.
pub fn parse_backend(spec: &str) -> Result<(String, u16), ConfigError> {
    if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ConfigError::Invalid(format!("mismatched brackets in backend '{spec}'"))
        })?;
        let port_str = tail.strip_prefix(':').ok_or_else(|| {
            ConfigError::Invalid(format!("missing port in backend '{spec}'"))
        })?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid port in backend '{spec}'")))?;
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("empty host in backend '{spec}'")));
        }
        return Ok((host.to_string(), port));
    }

    let (host, port_str) = spec
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("missing port in backend '{spec}'")))?;
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!("empty host in backend '{spec}'")));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid port in backend '{spec}'")))?;
    Ok((host.to_string(), port))
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Invalid(
                "configuration must contain at least one service".into(),
            ));
        }

        let mut seen_names = std::collections::HashSet::new();
        for service in &self.services {
            if !seen_names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }

            let listen_addr = format!("{}:{}", service.listen.address, service.listen.port);
            listen_addr.parse::<SocketAddr>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "service '{}': invalid listen address '{}'",
                    service.name, listen_addr
                ))
            })?;

            if service.backends.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' must have at least one backend",
                    service.name
                )));
            }
            for backend in &service.backends {
                parse_backend(backend).map_err(|e| {
                    ConfigError::Invalid(format!("service '{}': {}", service.name, e))
                })?;
            }

            if service.backend_cooldown < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "service '{}': backend_cooldown must be >= 0",
                    service.name
                )));
            }

            if let Some(hc) = &service.health_check {
                if hc.interval <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}': health_check.interval must be > 0",
                        service.name
                    )));
                }
                if hc.timeout <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}': health_check.timeout must be > 0",
                        service.name
                    )));
                }
                if hc.timeout > hc.interval {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}': health_check.timeout must be <= interval",
                        service.name
                    )));
                }
            }

            if let Some(hook) = &service.event_hook {
                if hook.timeout <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "service '{}': event_hook.timeout must be > 0",
                        service.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_ipv4() {
        assert_eq!(
            parse_backend("10.0.0.1:8080").unwrap(),
            ("10.0.0.1".to_string(), 8080)
        );
    }

    #[test]
    fn parse_backend_domain() {
        assert_eq!(
            parse_backend("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn parse_backend_ipv6() {
        assert_eq!(parse_backend("[::1]:80").unwrap(), ("::1".to_string(), 80));
    }

    #[test]
    fn parse_backend_rejects_missing_port() {
        assert!(parse_backend(":80").is_err() || parse_backend(":80").unwrap().0.is_empty());
    }

    #[test]
    fn parse_backend_rejects_empty_host_explicit() {
        let err = parse_backend(":80");
        match err {
            Ok((host, _)) => assert!(host.is_empty(), "expected rejection, got host {host:?}"),
            Err(_) => {}
        }
    }

    #[test]
    fn parse_backend_rejects_mismatched_brackets() {
        assert!(parse_backend("[::1:80").is_err());
    }

    #[test]
    fn health_check_timeout_exceeding_interval_is_rejected() {
        let yaml = r#"
services:
  - name: svc
    listen:
      address: "0.0.0.0"
      port: 9000
    backends:
      - "10.0.0.1:80"
    health_check:
      enabled: true
      interval: 5
      timeout: 10
"#;
        let parsed: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn reload_equivalent_ignores_event_hook_changes() {
        let base = ServiceConfig {
            name: "svc".to_string(),
            listen: ListenConfig {
                address: "0.0.0.0".to_string(),
                port: 9000,
            },
            backends: vec!["10.0.0.1:80".to_string()],
            protocol: Protocol::Both,
            backend_cooldown: DEFAULT_BACKEND_COOLDOWN,
            health_check: None,
            event_hook: None,
        };
        let with_hook = ServiceConfig {
            event_hook: Some(EventHookConfig {
                command: "/bin/notify".to_string(),
                args: vec![],
                events: vec!["backend_failed".to_string()],
                timeout: DEFAULT_EVENT_HOOK_TIMEOUT,
            }),
            ..base.clone()
        };
        assert!(base.reload_equivalent(&with_hook));

        let with_different_backends = ServiceConfig {
            backends: vec!["10.0.0.2:80".to_string()],
            ..base.clone()
        };
        assert!(!base.reload_equivalent(&with_different_backends));
    }

    #[test]
    fn minimal_config_loads() {
        let yaml = r#"
services:
  - name: svc
    listen:
      address: "0.0.0.0"
      port: 9000
    backends:
      - "10.0.0.1:80"
      - "10.0.0.2:80"
"#;
        let parsed: Config = serde_yaml::from_str(yaml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.services[0].backend_cooldown, DEFAULT_BACKEND_COOLDOWN);
        assert_eq!(parsed.services[0].protocol, Protocol::Both);
    }
}
