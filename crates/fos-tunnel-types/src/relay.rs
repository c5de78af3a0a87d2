//! Relays chosen by the relay selector and the endpoints the tunnel dials.

use crate::keys::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Wire-level disguise applied to WireGuard traffic towards a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ObfuscationMethod {
    #[default]
    Off,
    UdpOverTcp,
    Shadowsocks,
    Quic {
        hostname: String,
        token: String,
    },
    Lwo,
}

impl ObfuscationMethod {
    pub fn is_off(&self) -> bool {
        matches!(self, ObfuscationMethod::Off)
    }

    /// Transport protocol seen by the network between host and relay.
    pub fn transport_layer(&self) -> TransportLayer {
        match self {
            ObfuscationMethod::UdpOverTcp => TransportLayer::Tcp,
            _ => TransportLayer::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportLayer {
    #[default]
    Udp,
    Tcp,
}

/// A relay endpoint ready to be placed into a WireGuard peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedEndpoint {
    pub socket_address: SocketAddr,
    /// Gateway inside the tunnel; target of liveness pings
    pub ipv4_gateway: Ipv4Addr,
    pub ipv6_gateway: Ipv6Addr,
    pub public_key: PublicKey,
    #[serde(default)]
    pub obfuscation: ObfuscationMethod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub city_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedRelay {
    pub endpoint: SelectedEndpoint,
    pub hostname: String,
    pub location: Location,
    /// Failed attempts that preceded this selection
    #[serde(default)]
    pub retry_attempts: u32,
}

impl fmt::Display for SelectedRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.endpoint.socket_address)
    }
}

/// Exit relay plus an optional entry relay for multi-hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedRelays {
    #[serde(default)]
    pub entry: Option<SelectedRelay>,
    pub exit: SelectedRelay,
    #[serde(default)]
    pub retry_attempt: u32,
}

impl SelectedRelays {
    /// The relay the host actually sends packets to.
    pub fn ingress(&self) -> &SelectedRelay {
        self.entry.as_ref().unwrap_or(&self.exit)
    }

    pub fn is_multihop(&self) -> bool {
        self.entry.is_some()
    }
}

impl fmt::Display for SelectedRelays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "{} via {}", self.exit, entry),
            None => write!(f, "{}", self.exit),
        }
    }
}

/// Which relays to use on the next connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "relays", rename_all = "snake_case")]
pub enum NextRelays {
    /// Keep the relays of the current connection
    Current,
    /// Ask the relay selector for a new candidate
    #[default]
    Random,
    PreSelected(SelectedRelays),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    fn relay(hostname: &str) -> SelectedRelay {
        SelectedRelay {
            endpoint: SelectedEndpoint {
                socket_address: "192.0.2.10:51820".parse().unwrap(),
                ipv4_gateway: Ipv4Addr::new(10, 64, 0, 1),
                ipv6_gateway: "fc00:bbbb:bbbb:bb01::1".parse().unwrap(),
                public_key: PrivateKey::generate().public_key(),
                obfuscation: ObfuscationMethod::Off,
            },
            hostname: hostname.to_string(),
            location: Location::default(),
            retry_attempts: 0,
        }
    }

    #[test]
    fn test_ingress_is_entry_when_multihop() {
        let single = SelectedRelays {
            entry: None,
            exit: relay("se-got-wg-001"),
            retry_attempt: 0,
        };
        assert_eq!(single.ingress().hostname, "se-got-wg-001");
        assert!(!single.is_multihop());

        let multi = SelectedRelays {
            entry: Some(relay("de-fra-wg-002")),
            ..single
        };
        assert_eq!(multi.ingress().hostname, "de-fra-wg-002");
        assert!(multi.is_multihop());
    }

    #[test]
    fn test_obfuscation_method_json_shape() {
        let quic: ObfuscationMethod =
            serde_json::from_str(r#"{"method":"quic","hostname":"relay.example","token":"t"}"#)
                .unwrap();
        assert_eq!(
            quic,
            ObfuscationMethod::Quic {
                hostname: "relay.example".into(),
                token: "t".into()
            }
        );
        assert_eq!(
            ObfuscationMethod::UdpOverTcp.transport_layer(),
            TransportLayer::Tcp
        );
    }

    #[test]
    fn test_next_relays_json_shape() {
        let next: NextRelays = serde_json::from_str(r#"{"kind":"current"}"#).unwrap();
        assert_eq!(next, NextRelays::Current);
    }
}
