//! User settings consumed by the tunnel.
//!
//! The tunnel never writes these; it reads a fresh copy through a settings
//! reader whenever it (re)connects.

use crate::keys::PrivateKey;
use crate::net::IpAddressRange;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConstraints {
    /// Exit location, e.g. `se` or `se-got`
    #[serde(default)]
    pub location: Option<String>,
    /// Entry location when multi-hop is on
    #[serde(default)]
    pub entry_location: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantumResistance {
    On,
    #[default]
    Off,
    /// Left to the client; currently the same as `Off`
    Automatic,
}

impl QuantumResistance {
    pub fn is_enabled(self) -> bool {
        matches!(self, QuantumResistance::On)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultihopState {
    On,
    #[default]
    Off,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaitaSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Device key registered with the relays
    pub private_key: PrivateKey,
    pub interface_addresses: Vec<IpAddressRange>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub relay_constraints: RelayConstraints,
    #[serde(default)]
    pub quantum_resistance: QuantumResistance,
    #[serde(default)]
    pub daita: DaitaSettings,
    #[serde(default)]
    pub multihop: MultihopState,
}

impl Settings {
    pub fn new(private_key: PrivateKey, interface_addresses: Vec<IpAddressRange>) -> Self {
        Self {
            private_key,
            interface_addresses,
            dns_servers: Vec::new(),
            relay_constraints: RelayConstraints::default(),
            quantum_resistance: QuantumResistance::default(),
            daita: DaitaSettings::default(),
            multihop: MultihopState::default(),
        }
    }

    pub fn is_multihop(&self) -> bool {
        self.multihop == MultihopState::On
    }

    /// True when the device key alone is not enough to bring the tunnel up.
    pub fn requires_ephemeral_peer(&self) -> bool {
        self.quantum_resistance.is_enabled() || self.daita.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_minimal_json() {
        let key = PrivateKey::generate();
        let json = format!(
            r#"{{"private_key":"{}","interface_addresses":["10.64.0.2/32"]}}"#,
            key.to_base64()
        );
        let settings: Settings = serde_json::from_str(&json).unwrap();

        assert_eq!(settings.private_key, key);
        assert_eq!(settings.quantum_resistance, QuantumResistance::Off);
        assert!(!settings.is_multihop());
        assert!(!settings.requires_ephemeral_peer());
    }

    #[test]
    fn test_ephemeral_peer_required_for_pq_or_daita() {
        let mut settings = Settings::new(PrivateKey::generate(), Vec::new());
        settings.quantum_resistance = QuantumResistance::Automatic;
        assert!(!settings.requires_ephemeral_peer());

        settings.daita.enabled = true;
        assert!(settings.requires_ephemeral_peer());

        settings.daita.enabled = false;
        settings.quantum_resistance = QuantumResistance::On;
        assert!(settings.requires_ephemeral_peer());
    }
}
