//! fOS Config Client - ephemeral peer registration with a relay's config service
//!
//! ```text
//!  client ──TCP gateway:1337 (inside the tunnel, MSS clamped)──▶ RegisterPeerV1
//!         { parent key, ephemeral key, McEliece + Kyber public keys?, daita? }
//!         ◀── { ciphertexts? }
//!  PSK = decap(McEliece) ⊕ decap(Kyber1024)
//! ```

mod kem;
mod proto;

use async_trait::async_trait;
use fos_ephemeral_peer::{
    EphemeralPeerNegotiator, NegotiatedPeer, NegotiationError, NegotiationRequest,
};
use fos_tunnel_types::DaitaParameters;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tonic::Code;
use tonic::codegen::http::Uri;
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;
use tracing::{debug, warn};

use proto::{DaitaRequestV1, EphemeralPeerClient, EphemeralPeerRequestV1, PostQuantumRequestV1};

pub use kem::{KYBER_ALGORITHM, MCELIECE_ALGORITHM};

/// Link MTU assumed for the config exchange, low enough to never fragment
const CONFIG_CLIENT_MTU: u16 = 576;
const IPV4_HEADER_SIZE: u16 = 20;
const IPV6_HEADER_SIZE: u16 = 40;
const MAX_TCP_HEADER_SIZE: u16 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigClientError {
    #[error("Failed to connect to config service: {0}")]
    Connect(#[source] tonic::transport::Error),

    #[error("RPC failed: {0}")]
    Rpc(#[source] tonic::Status),

    #[error("Found no ciphertexts in response")]
    MissingCiphertexts,

    #[error("Expected 2 ciphertexts in the response, got {0}")]
    InvalidCiphertextCount(usize),

    #[error("Expected a {expected} byte ciphertext for {algorithm}, got {actual} bytes")]
    InvalidCiphertextLength {
        algorithm: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to generate {0} keys")]
    KeyGeneration(&'static str),

    #[error("Failed to decapsulate {0} ciphertext")]
    Decapsulate(&'static str),
}

impl From<ConfigClientError> for NegotiationError {
    fn from(error: ConfigClientError) -> Self {
        match error {
            ConfigClientError::Connect(e) => NegotiationError::Transport(e.to_string()),
            ConfigClientError::Rpc(status)
                if matches!(
                    status.code(),
                    Code::Unavailable | Code::Cancelled | Code::Unknown
                ) =>
            {
                NegotiationError::Transport(status.to_string())
            }
            other => NegotiationError::Rejected(other.to_string()),
        }
    }
}

/// Negotiates ephemeral peers over gRPC.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigServiceClient;

impl ConfigServiceClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EphemeralPeerNegotiator for ConfigServiceClient {
    async fn negotiate(
        &self,
        request: &NegotiationRequest,
    ) -> Result<NegotiatedPeer, NegotiationError> {
        register_peer(request).await.map_err(|e| {
            warn!(
                "Ephemeral peer negotiation with {} failed: {}",
                request.relay_hostname, e
            );
            NegotiationError::from(e)
        })
    }
}

async fn register_peer(request: &NegotiationRequest) -> Result<NegotiatedPeer, ConfigClientError> {
    let (post_quantum, kem_secrets) = if request.enable_post_quantum {
        let (kem_pubkeys, secrets) = kem::generate_keys().await?;
        (Some(PostQuantumRequestV1 { kem_pubkeys }), Some(secrets))
    } else {
        (None, None)
    };

    let mut client = EphemeralPeerClient::new(connect(request.service_address).await?);
    let response = client
        .register_peer_v1(peer_request(request, post_quantum))
        .await
        .map_err(ConfigClientError::Rpc)?;
    debug!("Registered ephemeral peer with {}", request.relay_hostname);

    let daita = request.enable_daita.then(daita_parameters);
    match kem_secrets {
        Some(secrets) => {
            let ciphertexts = response
                .post_quantum
                .ok_or(ConfigClientError::MissingCiphertexts)?
                .ciphertexts;
            let preshared_key = kem::decapsulate(&secrets, &ciphertexts)?;
            Ok(NegotiatedPeer::PostQuantum {
                preshared_key,
                daita,
            })
        }
        None => Ok(NegotiatedPeer::Ephemeral { daita }),
    }
}

fn peer_request(
    request: &NegotiationRequest,
    post_quantum: Option<PostQuantumRequestV1>,
) -> EphemeralPeerRequestV1 {
    EphemeralPeerRequestV1 {
        wg_parent_pubkey: request.parent_public_key.as_bytes().to_vec(),
        wg_ephemeral_peer_pubkey: request.ephemeral_public_key.as_bytes().to_vec(),
        post_quantum,
        daita: Some(DaitaRequestV1 {
            activate_daita: request.enable_daita,
        }),
    }
}

/// V1 only activates DAITA on the relay. Machines are supplied by the adapter.
fn daita_parameters() -> DaitaParameters {
    DaitaParameters {
        client_machines: Vec::new(),
        max_padding_frac: 0.0,
        max_blocking_frac: 0.0,
    }
}

async fn connect(service_address: SocketAddr) -> Result<Channel, ConfigClientError> {
    // The URI is ignored; the connector always dials `service_address`.
    Endpoint::from_static("tcp://0.0.0.0:0")
        .connect_with_connector(service_fn(move |_: Uri| async move {
            let socket = if service_address.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            clamp_segment_size(&socket, service_address);
            let stream = socket.connect(service_address).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }))
        .await
        .map_err(ConfigClientError::Connect)
}

fn clamp_segment_size(socket: &TcpSocket, destination: SocketAddr) {
    let mss = u32::from(max_segment_size(destination));
    debug!("Config client socket MSS: {}", mss);
    if let Err(e) = socket2::SockRef::from(socket).set_mss(mss) {
        warn!("Failed to set MSS on config client socket: {}", e);
    }
}

fn max_segment_size(destination: SocketAddr) -> u16 {
    let ip_header = if destination.is_ipv4() {
        IPV4_HEADER_SIZE
    } else {
        IPV6_HEADER_SIZE
    };
    CONFIG_CLIENT_MTU
        .saturating_sub(ip_header)
        .saturating_sub(MAX_TCP_HEADER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_tunnel_types::PublicKey;

    fn request(enable_post_quantum: bool, enable_daita: bool) -> NegotiationRequest {
        NegotiationRequest {
            relay_hostname: "se-got-wg-001".to_string(),
            service_address: "10.64.0.1:1337".parse().unwrap(),
            parent_public_key: PublicKey::from_bytes([1; 32]),
            ephemeral_public_key: PublicKey::from_bytes([2; 32]),
            enable_post_quantum,
            enable_daita,
        }
    }

    #[test]
    fn test_max_segment_size() {
        assert_eq!(max_segment_size("10.64.0.1:1337".parse().unwrap()), 496);
        assert_eq!(max_segment_size("[fc00:bbbb::1]:1337".parse().unwrap()), 476);
    }

    #[test]
    fn test_peer_request_carries_both_keys() {
        let message = peer_request(&request(false, true), None);
        assert_eq!(message.wg_parent_pubkey, vec![1; 32]);
        assert_eq!(message.wg_ephemeral_peer_pubkey, vec![2; 32]);
        assert!(message.post_quantum.is_none());
        assert_eq!(
            message.daita,
            Some(DaitaRequestV1 {
                activate_daita: true
            })
        );
    }

    #[test]
    fn test_daita_is_always_stated() {
        let message = peer_request(&request(false, false), None);
        assert_eq!(
            message.daita,
            Some(DaitaRequestV1 {
                activate_daita: false
            })
        );
    }

    #[test]
    fn test_error_mapping() {
        let unreachable = ConfigClientError::Rpc(tonic::Status::unavailable("no route"));
        assert!(matches!(
            NegotiationError::from(unreachable),
            NegotiationError::Transport(_)
        ));

        let denied = ConfigClientError::Rpc(tonic::Status::permission_denied("unknown key"));
        assert!(matches!(
            NegotiationError::from(denied),
            NegotiationError::Rejected(_)
        ));

        assert!(matches!(
            NegotiationError::from(ConfigClientError::InvalidCiphertextCount(1)),
            NegotiationError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_transport_error() {
        // Freed right away, so nothing listens on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let mut request = request(false, false);
        request.service_address = address;
        let result = ConfigServiceClient::new().negotiate(&request).await;
        assert!(matches!(result, Err(NegotiationError::Transport(_))));
    }
}
