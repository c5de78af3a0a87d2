use crate::error::ObfuscationError;
use crate::factory::{BuiltinObfuscatorFactory, ObfuscatorFactory, ObfuscatorSettings};
use async_trait::async_trait;
use fos_tunnel_types::{ObfuscationConfig, PublicKey, SelectedEndpoint, TransportLayer};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

/// Rewrites relay endpoints so WireGuard talks to a local proxy instead.
#[async_trait]
pub trait ProtocolObfuscation: Send + Sync {
    /// Start a proxy for `endpoint` and return the endpoint WireGuard should
    /// use. Any previously running proxy is stopped first.
    async fn obfuscate(
        &self,
        endpoint: &SelectedEndpoint,
        client_public_key: &PublicKey,
    ) -> Result<SelectedEndpoint, ObfuscationError>;

    fn stop(&self);

    /// Transport seen on the wire for the last obfuscated endpoint
    fn transport_layer(&self) -> Option<TransportLayer>;

    /// Relay port for the last obfuscated endpoint
    fn remote_port(&self) -> Option<u16>;
}

struct RunningProxy {
    local_endpoint: SocketAddr,
    _guard: DropGuard,
}

#[derive(Default)]
struct ObfuscatorState {
    running: Option<RunningProxy>,
    transport_layer: Option<TransportLayer>,
    remote_port: Option<u16>,
}

pub struct ProtocolObfuscator {
    factory: Arc<dyn ObfuscatorFactory>,
    state: Mutex<ObfuscatorState>,
}

impl ProtocolObfuscator {
    pub fn new(factory: Arc<dyn ObfuscatorFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(ObfuscatorState::default()),
        }
    }

    pub fn with_config(config: ObfuscationConfig) -> Self {
        Self::new(Arc::new(BuiltinObfuscatorFactory::new(config)))
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// Loopback address of the running proxy
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .running
            .as_ref()
            .map(|proxy| proxy.local_endpoint)
    }
}

#[async_trait]
impl ProtocolObfuscation for ProtocolObfuscator {
    async fn obfuscate(
        &self,
        endpoint: &SelectedEndpoint,
        client_public_key: &PublicKey,
    ) -> Result<SelectedEndpoint, ObfuscationError> {
        self.stop();
        {
            let mut state = self.state.lock();
            state.transport_layer = Some(endpoint.obfuscation.transport_layer());
            state.remote_port = Some(endpoint.socket_address.port());
        }

        if endpoint.obfuscation.is_off() {
            return Ok(endpoint.clone());
        }

        let settings = ObfuscatorSettings {
            method: endpoint.obfuscation.clone(),
            server_addr: endpoint.socket_address,
            client_public_key: *client_public_key,
            server_public_key: endpoint.public_key,
        };
        let obfuscator = self.factory.create(&settings).await?;
        let local_port = obfuscator.endpoint().port();
        let local_endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        info!(
            "Obfuscating {} via {:?} on {}",
            endpoint.socket_address, endpoint.obfuscation, local_endpoint
        );

        let token = CancellationToken::new();
        let child = token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                result = obfuscator.run() => {
                    if let Err(e) = result {
                        warn!("Obfuscation proxy stopped: {}", e);
                    }
                }
            }
        });

        self.state.lock().running = Some(RunningProxy {
            local_endpoint,
            _guard: token.drop_guard(),
        });

        Ok(SelectedEndpoint {
            socket_address: local_endpoint,
            ..endpoint.clone()
        })
    }

    fn stop(&self) {
        if self.state.lock().running.take().is_some() {
            info!("Stopped obfuscation proxy");
        }
    }

    fn transport_layer(&self) -> Option<TransportLayer> {
        self.state.lock().transport_layer
    }

    fn remote_port(&self) -> Option<u16> {
        self.state.lock().remote_port
    }
}
