//! Round trips to a relay's config service.

use async_trait::async_trait;
use fos_tunnel_types::{DaitaParameters, PreSharedKey, PrivateKey, PublicKey, SelectedRelay};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Config service port on the relay gateway
pub const CONFIG_SERVICE_PORT: u16 = 1337;

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationRequest {
    pub relay_hostname: String,
    /// Config service address, reachable through the tunnel
    pub service_address: SocketAddr,
    /// Key currently registered for this device on the relay
    pub parent_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    pub enable_post_quantum: bool,
    pub enable_daita: bool,
}

impl NegotiationRequest {
    pub fn new(
        relay: &SelectedRelay,
        parent_public_key: PublicKey,
        ephemeral_public_key: PublicKey,
        enable_post_quantum: bool,
        enable_daita: bool,
    ) -> Self {
        Self {
            relay_hostname: relay.hostname.clone(),
            service_address: SocketAddr::new(
                IpAddr::V4(relay.endpoint.ipv4_gateway),
                CONFIG_SERVICE_PORT,
            ),
            parent_public_key,
            ephemeral_public_key,
            enable_post_quantum,
            enable_daita,
        }
    }
}

/// What the relay agreed to.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatedPeer {
    PostQuantum {
        preshared_key: PreSharedKey,
        daita: Option<DaitaParameters>,
    },
    Ephemeral {
        daita: Option<DaitaParameters>,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NegotiationError {
    #[error("Negotiation timed out")]
    Timeout,

    #[error("Negotiation cancelled")]
    Cancelled,

    #[error("Config service unreachable: {0}")]
    Transport(String),

    #[error("Relay rejected the request: {0}")]
    Rejected(String),
}

/// Client for the relay config service.
#[async_trait]
pub trait EphemeralPeerNegotiator: Send + Sync {
    async fn negotiate(&self, request: &NegotiationRequest)
    -> Result<NegotiatedPeer, NegotiationError>;
}

/// One callback per negotiation result.
#[async_trait]
pub trait EphemeralPeerReceiver: Send + Sync {
    async fn receive_post_quantum_key(
        &self,
        preshared_key: PreSharedKey,
        ephemeral_key: PrivateKey,
        daita: Option<DaitaParameters>,
    );

    async fn receive_ephemeral_peer_private_key(
        &self,
        ephemeral_key: PrivateKey,
        daita: Option<DaitaParameters>,
    );

    async fn exchange_failed(&self, error: NegotiationError);
}

/// Run one negotiation bounded by `timeout` and `token`.
pub(crate) async fn negotiate(
    negotiator: &dyn EphemeralPeerNegotiator,
    request: &NegotiationRequest,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<NegotiatedPeer, NegotiationError> {
    debug!(
        "Negotiating ephemeral peer with {} (pq: {}, daita: {})",
        request.relay_hostname, request.enable_post_quantum, request.enable_daita
    );
    tokio::select! {
        _ = token.cancelled() => Err(NegotiationError::Cancelled),
        result = tokio::time::timeout(timeout, negotiator.negotiate(request)) => {
            result.map_err(|_| NegotiationError::Timeout)?
        }
    }
}

/// Hand a negotiation result to `receiver`.
///
/// Returns `true` when a key was delivered. Cancellation is not reported.
pub(crate) async fn deliver(
    result: Result<NegotiatedPeer, NegotiationError>,
    ephemeral_key: PrivateKey,
    receiver: &dyn EphemeralPeerReceiver,
) -> bool {
    match result {
        Ok(NegotiatedPeer::PostQuantum {
            preshared_key,
            daita,
        }) => {
            receiver
                .receive_post_quantum_key(preshared_key, ephemeral_key, daita)
                .await;
            true
        }
        Ok(NegotiatedPeer::Ephemeral { daita }) => {
            receiver
                .receive_ephemeral_peer_private_key(ephemeral_key, daita)
                .await;
            true
        }
        Err(NegotiationError::Cancelled) => {
            debug!("Ephemeral peer negotiation cancelled");
            false
        }
        Err(e) => {
            warn!("Ephemeral peer negotiation failed: {}", e);
            receiver.exchange_failed(e).await;
            false
        }
    }
}
