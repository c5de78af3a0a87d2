//! Tunnel Adapter Configuration
//!
//! The complete description of what the WireGuard device should look like:
//! interface addresses, DNS, and one or two hops. A configuration without an
//! exit hop is a *blocked* configuration that captures traffic and sends it
//! nowhere.

use crate::keys::{PreSharedKey, PrivateKey, PublicKey};
use crate::net::IpAddressRange;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Persistent keepalive used for every peer (seconds)
const DEFAULT_KEEPALIVE: u16 = 25;

/// DAITA machine parameters handed out by a relay for one tunnel leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaitaParameters {
    /// Serialized maybenot machines
    pub client_machines: Vec<String>,
    pub max_padding_frac: f64,
    pub max_blocking_frac: f64,
}

/// WireGuard peer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub endpoint: SocketAddr,
    /// Traffic routed through this peer
    pub allowed_ips: Vec<IpAddressRange>,
    /// Persistent keepalive interval (seconds)
    pub keepalive: Option<u16>,
    /// Set after a post-quantum negotiation
    pub preshared_key: Option<PreSharedKey>,
}

impl PeerConfig {
    /// A peer routing all traffic.
    pub fn new(public_key: PublicKey, endpoint: SocketAddr) -> Self {
        Self {
            public_key,
            endpoint,
            allowed_ips: IpAddressRange::all_routes(),
            keepalive: Some(DEFAULT_KEEPALIVE),
            preshared_key: None,
        }
    }

    pub fn with_allowed_ips(mut self, allowed_ips: Vec<IpAddressRange>) -> Self {
        self.allowed_ips = allowed_ips;
        self
    }

    pub fn with_preshared_key(mut self, preshared_key: Option<PreSharedKey>) -> Self {
        self.preshared_key = preshared_key;
        self
    }
}

/// One WireGuard hop: the key we present and the peer we talk to.
#[derive(Debug, Clone, PartialEq)]
pub struct HopConfiguration {
    pub private_key: PrivateKey,
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelAdapterConfiguration {
    pub interface_addresses: Vec<IpAddressRange>,
    pub dns_servers: Vec<IpAddr>,
    /// Present only for multi-hop
    pub entry: Option<HopConfiguration>,
    /// Absent for a blocked configuration
    pub exit: Option<HopConfiguration>,
    /// Applies to the first hop (entry when multi-hop)
    pub daita: Option<DaitaParameters>,
    /// Address liveness pings are sent to
    pub pingable_gateway: Option<Ipv4Addr>,
}

impl TunnelAdapterConfiguration {
    pub fn single_hop(
        interface_addresses: Vec<IpAddressRange>,
        dns_servers: Vec<IpAddr>,
        exit: HopConfiguration,
        pingable_gateway: Ipv4Addr,
    ) -> Self {
        Self {
            interface_addresses,
            dns_servers,
            entry: None,
            exit: Some(exit),
            daita: None,
            pingable_gateway: Some(pingable_gateway),
        }
    }

    pub fn multihop(
        interface_addresses: Vec<IpAddressRange>,
        dns_servers: Vec<IpAddr>,
        entry: HopConfiguration,
        exit: HopConfiguration,
        pingable_gateway: Ipv4Addr,
    ) -> Self {
        Self {
            entry: Some(entry),
            ..Self::single_hop(interface_addresses, dns_servers, exit, pingable_gateway)
        }
    }

    /// Interface up, no peers: nothing leaves the device.
    pub fn blocked(interface_addresses: Vec<IpAddressRange>) -> Self {
        Self {
            interface_addresses,
            dns_servers: Vec::new(),
            entry: None,
            exit: None,
            daita: None,
            pingable_gateway: None,
        }
    }

    pub fn with_daita(mut self, daita: Option<DaitaParameters>) -> Self {
        self.daita = daita;
        self
    }

    pub fn is_blocked(&self) -> bool {
        self.exit.is_none()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface_addresses.is_empty() {
            return Err(ConfigError::NoInterfaceAddresses);
        }
        if self.entry.is_some() && self.exit.is_none() {
            return Err(ConfigError::InvalidPeer);
        }
        let hops = self.entry.iter().chain(self.exit.iter());
        for hop in hops {
            if hop.peer.allowed_ips.is_empty() {
                return Err(ConfigError::NoAllowedIps(hop.peer.public_key.to_base64()));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Interface has no addresses")]
    NoInterfaceAddresses,

    #[error("Peer {0} has no allowed IPs")]
    NoAllowedIps(String),

    #[error("Invalid peer configuration")]
    InvalidPeer,

    #[error("Failed to read config file: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
