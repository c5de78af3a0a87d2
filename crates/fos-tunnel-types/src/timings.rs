//! Timing and runtime configuration, loadable from TOML.
//!
//! ```toml
//! [actor]
//! boot_recovery_period_ms = 10000
//!
//! [monitor]
//! ping_timeout_ms = 15000
//!
//! [obfuscation]
//! shadowsocks_password = "mullvad"
//! shadowsocks_cipher = "aes-256-gcm"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorTimings {
    /// Interval between automatic reconnects while blocked on a recoverable error
    #[serde(rename = "boot_recovery_period_ms", with = "duration_ms")]
    pub boot_recovery_period: Duration,
}

impl Default for ActorTimings {
    fn default() -> Self {
        Self {
            boot_recovery_period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelMonitorTimings {
    /// Interval between heartbeat pings on an idle tunnel
    #[serde(rename = "heartbeat_ping_interval_ms", with = "duration_ms")]
    pub heartbeat_ping_interval: Duration,
    #[serde(rename = "heartbeat_reply_timeout_ms", with = "duration_ms")]
    pub heartbeat_reply_timeout: Duration,
    /// Unanswered pings for this long mean the tunnel is dead
    #[serde(rename = "ping_timeout_ms", with = "duration_ms")]
    pub ping_timeout: Duration,
    /// Delay before sending another ping while waiting for a reply
    #[serde(rename = "ping_delay_ms", with = "duration_ms")]
    pub ping_delay: Duration,
    /// Traffic seen within this window suspends the heartbeat
    #[serde(rename = "traffic_flow_timeout_ms", with = "duration_ms")]
    pub traffic_flow_timeout: Duration,
    #[serde(rename = "traffic_timeout_ms", with = "duration_ms")]
    pub traffic_timeout: Duration,
    #[serde(rename = "inbound_traffic_timeout_ms", with = "duration_ms")]
    pub inbound_traffic_timeout: Duration,
    /// First establish timeout; grows with each retry up to `ping_timeout`
    #[serde(rename = "initial_establish_timeout_ms", with = "duration_ms")]
    pub initial_establish_timeout: Duration,
    pub establish_timeout_multiplier: u32,
    #[serde(rename = "connectivity_check_interval_ms", with = "duration_ms")]
    pub connectivity_check_interval: Duration,
}

impl Default for TunnelMonitorTimings {
    fn default() -> Self {
        Self {
            heartbeat_ping_interval: Duration::from_secs(10),
            heartbeat_reply_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(15),
            ping_delay: Duration::from_secs(3),
            traffic_flow_timeout: Duration::from_secs(5),
            traffic_timeout: Duration::from_secs(120),
            inbound_traffic_timeout: Duration::from_secs(5),
            initial_establish_timeout: Duration::from_secs(4),
            establish_timeout_multiplier: 2,
            connectivity_check_interval: Duration::from_secs(1),
        }
    }
}

impl TunnelMonitorTimings {
    /// Ping timeout while establishing a connection on the given retry.
    pub fn establish_timeout(&self, retry_attempt: u32) -> Duration {
        let multiplier = self
            .establish_timeout_multiplier
            .checked_pow(retry_attempt)
            .unwrap_or(u32::MAX);
        self.initial_establish_timeout
            .checked_mul(multiplier)
            .unwrap_or(self.ping_timeout)
            .min(self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationTimings {
    /// Upper bound for one ephemeral peer round trip
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for NegotiationTimings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    pub shadowsocks_password: String,
    /// AEAD cipher name, as understood by Shadowsocks servers
    pub shadowsocks_cipher: String,
    /// WireGuard port the Shadowsocks server forwards to on the relay
    pub shadowsocks_target_port: u16,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            shadowsocks_password: "mullvad".to_string(),
            shadowsocks_cipher: "aes-256-gcm".to_string(),
            shadowsocks_target_port: 51820,
        }
    }
}

/// Runtime configuration of the tunnel process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub actor: ActorTimings,
    pub monitor: TunnelMonitorTimings,
    pub negotiation: NegotiationTimings,
    pub obfuscation: ObfuscationConfig,
}

impl TunnelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = TunnelConfig::from_toml_str("").unwrap();
        assert_eq!(config, TunnelConfig::default());
        assert_eq!(config.monitor.ping_timeout, Duration::from_secs(15));
        assert_eq!(config.actor.boot_recovery_period, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_sections_override_fields() {
        let config = TunnelConfig::from_toml_str(
            r#"
            [monitor]
            ping_timeout_ms = 5000
            establish_timeout_multiplier = 3

            [obfuscation]
            shadowsocks_target_port = 443
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.ping_timeout, Duration::from_secs(5));
        assert_eq!(config.monitor.establish_timeout_multiplier, 3);
        assert_eq!(config.monitor.ping_delay, Duration::from_secs(3));
        assert_eq!(config.obfuscation.shadowsocks_target_port, 443);
        assert_eq!(config.obfuscation.shadowsocks_password, "mullvad");
        assert_eq!(config.obfuscation.shadowsocks_cipher, "aes-256-gcm");
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let result = TunnelConfig::from_toml_str("[monitor]\nping_timeout_ms = \"soon\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_establish_timeout_backoff_is_capped() {
        let timings = TunnelMonitorTimings::default();
        assert_eq!(timings.establish_timeout(0), Duration::from_secs(4));
        assert_eq!(timings.establish_timeout(1), Duration::from_secs(8));
        assert_eq!(timings.establish_timeout(2), Duration::from_secs(15));
        assert_eq!(timings.establish_timeout(40), Duration::from_secs(15));
    }
}
