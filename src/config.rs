//! Deployment configuration.
//!
//! Every value here is fixed for the lifetime of a process: the engine reads
//! a [`ProxyConfig`] once at startup and shares it behind an `Arc`. Both
//! domains of a link must agree on [`Limits`], because the wire envelope
//! layout is derived from them.
//!
//! Sources, later ones winning:
//! 1. compiled-in defaults (the `DEFAULT_*` constants)
//! 2. a JSON file ([`ProxyConfig::load_from`])
//! 3. `DOMAINLINK_*` environment variables ([`ProxyConfig::apply_env`])

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tracker::RetryPolicy;

pub const DEFAULT_DOMAIN: &str = "cpuapp";
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 128;
/// Buffer size for channel names, terminator included.
pub const DEFAULT_MAX_CHANNEL_NAME: usize = 32;
/// Buffer size for domain names, terminator included.
pub const DEFAULT_MAX_DOMAIN_NAME: usize = 16;
pub const DEFAULT_RX_BUFFER_COUNT: usize = 4;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_ACK_TIMEOUT_MAX_MS: u64 = 5_000;
pub const DEFAULT_MAX_TRANSMIT_ATTEMPTS: u8 = 5;
pub const DEFAULT_BIND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

const ENV_PREFIX: &str = "DOMAINLINK_";

/// Capacities of the fixed-size wire fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest payload carried by one envelope.
    pub max_payload_size: usize,
    /// Channel name buffer, including the NUL terminator.
    pub max_channel_name: usize,
    /// Domain name buffer, including the NUL terminator.
    pub max_domain_name: usize,
}

impl Limits {
    /// Longest channel name that fits beside its terminator.
    pub fn channel_name_max(&self) -> usize {
        self.max_channel_name.saturating_sub(1)
    }

    /// Longest domain name that fits beside its terminator.
    pub fn domain_name_max(&self) -> usize {
        self.max_domain_name.saturating_sub(1)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_channel_name: DEFAULT_MAX_CHANNEL_NAME,
            max_domain_name: DEFAULT_MAX_DOMAIN_NAME,
        }
    }
}

/// Acknowledgment timeout and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Timeout before the first retransmission (milliseconds).
    pub ack_timeout_ms: u64,
    /// Ceiling for the backed-off timeout (milliseconds).
    pub ack_timeout_max_ms: u64,
    /// Transmissions per message, the first one included.
    pub max_transmit_attempts: u8,
    /// Messages that may await acknowledgment at the same time.
    pub max_in_flight: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            ack_timeout_max_ms: DEFAULT_ACK_TIMEOUT_MAX_MS,
            max_transmit_attempts: DEFAULT_MAX_TRANSMIT_ATTEMPTS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.ack_timeout_ms),
            max: Duration::from_millis(self.ack_timeout_max_ms),
            max_attempts: self.max_transmit_attempts,
        }
    }
}

/// Full configuration of one domain's forwarding layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Identity of this domain, used as message provenance.
    pub domain: String,
    pub limits: Limits,
    pub retry: RetrySettings,
    /// Receive buffers in the streaming backend's ring.
    pub rx_buffer_count: usize,
    /// How long the packet backend waits for its peer endpoint.
    pub bind_timeout_ms: u64,
    /// How long inbound one-way messages may wait on a full observer.
    pub publish_timeout_ms: u64,
    /// Bound on the streaming transmit gate wait; `None` waits forever.
    pub send_timeout_ms: Option<u64>,
    /// Depth of the inbound, acknowledgment and retry queues.
    pub queue_depth: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            limits: Limits::default(),
            retry: RetrySettings::default(),
            rx_buffer_count: DEFAULT_RX_BUFFER_COUNT,
            bind_timeout_ms: DEFAULT_BIND_TIMEOUT_MS,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
            send_timeout_ms: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl ProxyConfig {
    /// Defaults with the given domain identity.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ProxyConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment (and a `.env` file).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `DOMAINLINK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        self.validate()
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(domain) = lookup(&format!("{ENV_PREFIX}DOMAIN")) {
            self.domain = domain;
        }
        override_parsed(&lookup, "MAX_PAYLOAD_SIZE", &mut self.limits.max_payload_size)?;
        override_parsed(&lookup, "MAX_CHANNEL_NAME", &mut self.limits.max_channel_name)?;
        override_parsed(&lookup, "MAX_DOMAIN_NAME", &mut self.limits.max_domain_name)?;
        override_parsed(&lookup, "ACK_TIMEOUT_MS", &mut self.retry.ack_timeout_ms)?;
        override_parsed(&lookup, "ACK_TIMEOUT_MAX_MS", &mut self.retry.ack_timeout_max_ms)?;
        override_parsed(
            &lookup,
            "MAX_TRANSMIT_ATTEMPTS",
            &mut self.retry.max_transmit_attempts,
        )?;
        override_parsed(&lookup, "MAX_IN_FLIGHT", &mut self.retry.max_in_flight)?;
        override_parsed(&lookup, "RX_BUFFER_COUNT", &mut self.rx_buffer_count)?;
        override_parsed(&lookup, "BIND_TIMEOUT_MS", &mut self.bind_timeout_ms)?;
        override_parsed(&lookup, "PUBLISH_TIMEOUT_MS", &mut self.publish_timeout_ms)?;
        override_parsed(&lookup, "QUEUE_DEPTH", &mut self.queue_depth)?;
        let key = format!("{ENV_PREFIX}SEND_TIMEOUT_MS");
        if let Some(raw) = lookup(&key) {
            self.send_timeout_ms = Some(parse_value(&key, &raw)?);
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.is_empty() {
            return Err(invalid("domain", "must not be empty"));
        }
        if self.domain.len() >= self.limits.max_domain_name {
            return Err(invalid(
                "domain",
                format!(
                    "{} bytes does not fit a {}-byte domain field",
                    self.domain.len(),
                    self.limits.max_domain_name
                ),
            ));
        }
        if self.limits.max_payload_size == 0 {
            return Err(invalid("limits.max_payload_size", "must be greater than 0"));
        }
        if self.limits.max_payload_size > u32::MAX as usize {
            return Err(invalid("limits.max_payload_size", "must fit a u32 size field"));
        }
        if self.limits.max_channel_name < 2 {
            return Err(invalid("limits.max_channel_name", "must be at least 2"));
        }
        if self.limits.max_domain_name < 2 {
            return Err(invalid("limits.max_domain_name", "must be at least 2"));
        }
        if self.rx_buffer_count < 2 {
            return Err(invalid("rx_buffer_count", "the receive ring needs at least 2 buffers"));
        }
        if self.retry.max_in_flight == 0 {
            return Err(invalid("retry.max_in_flight", "must be greater than 0"));
        }
        if self.retry.max_transmit_attempts == 0 {
            return Err(invalid("retry.max_transmit_attempts", "must be greater than 0"));
        }
        if self.retry.ack_timeout_ms == 0 {
            return Err(invalid("retry.ack_timeout_ms", "must be greater than 0"));
        }
        if self.retry.ack_timeout_ms > self.retry.ack_timeout_max_ms {
            return Err(invalid(
                "retry.ack_timeout_ms",
                "must not exceed retry.ack_timeout_max_ms",
            ));
        }
        if self.queue_depth == 0 {
            return Err(invalid("queue_depth", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    if let Some(raw) = lookup(&key) {
        *slot = parse_value(&key, &raw)?;
    }
    Ok(())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ProxyConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.domain, DEFAULT_DOMAIN);
        assert_eq!(config.send_timeout(), None);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = ProxyConfig::default();
        config
            .apply_overrides(lookup(&[
                ("DOMAINLINK_DOMAIN", "cpurad"),
                ("DOMAINLINK_MAX_PAYLOAD_SIZE", "64"),
                ("DOMAINLINK_MAX_TRANSMIT_ATTEMPTS", "3"),
                ("DOMAINLINK_SEND_TIMEOUT_MS", " 250 "),
            ]))
            .unwrap();

        assert_eq!(config.domain, "cpurad");
        assert_eq!(config.limits.max_payload_size, 64);
        assert_eq!(config.retry.max_transmit_attempts, 3);
        assert_eq!(config.send_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_bad_override_names_the_key() {
        let mut config = ProxyConfig::default();
        let err = config
            .apply_overrides(lookup(&[("DOMAINLINK_QUEUE_DEPTH", "lots")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "DOMAINLINK_QUEUE_DEPTH"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let mut config = ProxyConfig::default();
        config.retry.ack_timeout_ms = 10_000;
        config.retry.ack_timeout_max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_domain() {
        let mut config = ProxyConfig::for_domain("a-very-long-domain-name");
        config.limits.max_domain_name = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_single_rx_buffer() {
        let config = ProxyConfig {
            rx_buffer_count: 1,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("domainlink.json");
        std::fs::write(
            &path,
            r#"{ "domain": "cpurad", "retry": { "max_in_flight": 4 } }"#,
        )
        .unwrap();

        let config = ProxyConfig::load_from(&path).unwrap();
        assert_eq!(config.domain, "cpurad");
        assert_eq!(config.retry.max_in_flight, 4);
        assert_eq!(config.retry.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
        assert_eq!(config.limits, Limits::default());
    }

    #[test]
    fn test_load_from_corrupted_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("domainlink.json");
        std::fs::write(&path, "not valid json{{{").unwrap();
        assert!(matches!(
            ProxyConfig::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
