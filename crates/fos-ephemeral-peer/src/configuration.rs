//! Configurations produced while an exchange is in progress.

use async_trait::async_trait;
use fos_tunnel_types::{
    DaitaParameters, IpAddressRange, PreSharedKey, PrivateKey, SelectedRelay,
};
use std::net::IpAddr;

/// WireGuard settings for one leg of the tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralPeerConfiguration {
    pub private_key: PrivateKey,
    pub preshared_key: Option<PreSharedKey>,
    pub allowed_ips: Vec<IpAddressRange>,
    pub daita: Option<DaitaParameters>,
}

impl EphemeralPeerConfiguration {
    /// Device key with routes to the relay gateway only, enough to reach the
    /// config service.
    pub fn initial(device_key: &PrivateKey, relay: &SelectedRelay) -> Self {
        Self {
            private_key: device_key.clone(),
            preshared_key: None,
            allowed_ips: vec![IpAddressRange::host(IpAddr::V4(
                relay.endpoint.ipv4_gateway,
            ))],
            daita: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralPeerRelayConfiguration {
    pub relay: SelectedRelay,
    pub configuration: EphemeralPeerConfiguration,
}

/// A configuration the tunnel must apply before the exchange continues.
#[derive(Debug, Clone, PartialEq)]
pub enum EphemeralPeerNegotiationState {
    Single(EphemeralPeerRelayConfiguration),
    Multi {
        entry: EphemeralPeerRelayConfiguration,
        exit: EphemeralPeerRelayConfiguration,
    },
}

impl EphemeralPeerNegotiationState {
    /// Whether any leg carries DAITA parameters
    pub fn has_daita(&self) -> bool {
        match self {
            Self::Single(exit) => exit.configuration.daita.is_some(),
            Self::Multi { entry, exit } => {
                entry.configuration.daita.is_some() || exit.configuration.daita.is_some()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Negotiated,
    Failed,
}

/// Receives the configurations of a running exchange.
#[async_trait]
pub trait EphemeralPeerExchangeHandler: Send + Sync {
    /// Apply `state` to the tunnel. Returns once it is live.
    async fn update_configuration(&self, state: EphemeralPeerNegotiationState);

    /// Called exactly once unless the exchange is cancelled by its owner.
    async fn finish(&self, outcome: ExchangeOutcome);
}
