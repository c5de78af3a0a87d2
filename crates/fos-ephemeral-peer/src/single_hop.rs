use crate::configuration::{
    EphemeralPeerConfiguration, EphemeralPeerExchangeHandler, EphemeralPeerNegotiationState,
    EphemeralPeerRelayConfiguration, ExchangeOutcome,
};
use crate::negotiator::{
    EphemeralPeerNegotiator, EphemeralPeerReceiver, NegotiationError, NegotiationRequest, deliver,
    negotiate,
};
use async_trait::async_trait;
use fos_tunnel_types::{DaitaParameters, IpAddressRange, PreSharedKey, PrivateKey, SelectedRelay};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Negotiates an ephemeral peer directly with the exit relay.
pub struct SingleHopEphemeralPeerExchanger {
    exit: SelectedRelay,
    device_key: PrivateKey,
    enable_post_quantum: bool,
    enable_daita: bool,
    negotiator: Arc<dyn EphemeralPeerNegotiator>,
    handler: Arc<dyn EphemeralPeerExchangeHandler>,
    timeout: Duration,
    token: CancellationToken,
}

impl SingleHopEphemeralPeerExchanger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exit: SelectedRelay,
        device_key: PrivateKey,
        enable_post_quantum: bool,
        enable_daita: bool,
        negotiator: Arc<dyn EphemeralPeerNegotiator>,
        handler: Arc<dyn EphemeralPeerExchangeHandler>,
        timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            exit,
            device_key,
            enable_post_quantum,
            enable_daita,
            negotiator,
            handler,
            timeout,
            token,
        }
    }

    pub async fn start(&self) {
        let initial = EphemeralPeerConfiguration::initial(&self.device_key, &self.exit);
        self.apply(initial).await;
        if self.token.is_cancelled() {
            return;
        }

        let ephemeral_key = PrivateKey::generate();
        let request = NegotiationRequest::new(
            &self.exit,
            self.device_key.public_key(),
            ephemeral_key.public_key(),
            self.enable_post_quantum,
            self.enable_daita,
        );
        let result = negotiate(&*self.negotiator, &request, self.timeout, &self.token).await;
        deliver(result, ephemeral_key, self).await;
    }

    async fn apply(&self, configuration: EphemeralPeerConfiguration) {
        self.handler
            .update_configuration(EphemeralPeerNegotiationState::Single(
                EphemeralPeerRelayConfiguration {
                    relay: self.exit.clone(),
                    configuration,
                },
            ))
            .await;
    }

    async fn complete(
        &self,
        ephemeral_key: PrivateKey,
        preshared_key: Option<PreSharedKey>,
        daita: Option<DaitaParameters>,
    ) {
        if self.token.is_cancelled() {
            return;
        }
        info!("Negotiated ephemeral peer with {}", self.exit.hostname);
        self.apply(EphemeralPeerConfiguration {
            private_key: ephemeral_key,
            preshared_key,
            allowed_ips: IpAddressRange::all_routes(),
            daita: daita.filter(|_| self.enable_daita),
        })
        .await;
        self.handler.finish(ExchangeOutcome::Negotiated).await;
    }
}

#[async_trait]
impl EphemeralPeerReceiver for SingleHopEphemeralPeerExchanger {
    async fn receive_post_quantum_key(
        &self,
        preshared_key: PreSharedKey,
        ephemeral_key: PrivateKey,
        daita: Option<DaitaParameters>,
    ) {
        self.complete(ephemeral_key, Some(preshared_key), daita).await;
    }

    async fn receive_ephemeral_peer_private_key(
        &self,
        ephemeral_key: PrivateKey,
        daita: Option<DaitaParameters>,
    ) {
        self.complete(ephemeral_key, None, daita).await;
    }

    async fn exchange_failed(&self, _error: NegotiationError) {
        self.handler.finish(ExchangeOutcome::Failed).await;
    }
}
