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
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Entry,
    Exit,
}

struct ExchangeState {
    leg: Leg,
    entry: EphemeralPeerConfiguration,
    exit: EphemeralPeerConfiguration,
}

/// Negotiates with the entry relay, then with the exit relay through the
/// entry tunnel.
pub struct MultiHopEphemeralPeerExchanger {
    entry: SelectedRelay,
    exit: SelectedRelay,
    device_key: PrivateKey,
    enable_post_quantum: bool,
    enable_daita: bool,
    negotiator: Arc<dyn EphemeralPeerNegotiator>,
    handler: Arc<dyn EphemeralPeerExchangeHandler>,
    timeout: Duration,
    token: CancellationToken,
    state: Mutex<ExchangeState>,
}

impl MultiHopEphemeralPeerExchanger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry: SelectedRelay,
        exit: SelectedRelay,
        device_key: PrivateKey,
        enable_post_quantum: bool,
        enable_daita: bool,
        negotiator: Arc<dyn EphemeralPeerNegotiator>,
        handler: Arc<dyn EphemeralPeerExchangeHandler>,
        timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        let state = ExchangeState {
            leg: Leg::Entry,
            entry: EphemeralPeerConfiguration::initial(&device_key, &entry),
            exit: EphemeralPeerConfiguration::initial(&device_key, &exit),
        };
        Self {
            entry,
            exit,
            device_key,
            enable_post_quantum,
            enable_daita,
            negotiator,
            handler,
            timeout,
            token,
            state: Mutex::new(state),
        }
    }

    pub async fn start(&self) {
        self.apply().await;

        // DAITA is only ever requested from the entry relay.
        if !self.negotiate_leg(&self.entry, self.enable_daita).await {
            return;
        }
        self.state.lock().leg = Leg::Exit;
        self.negotiate_leg(&self.exit, false).await;
    }

    async fn negotiate_leg(&self, relay: &SelectedRelay, enable_daita: bool) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let ephemeral_key = PrivateKey::generate();
        let request = NegotiationRequest::new(
            relay,
            self.device_key.public_key(),
            ephemeral_key.public_key(),
            self.enable_post_quantum,
            enable_daita,
        );
        let result = negotiate(&*self.negotiator, &request, self.timeout, &self.token).await;
        deliver(result, ephemeral_key, self).await
    }

    async fn apply(&self) {
        let state = {
            let state = self.state.lock();
            EphemeralPeerNegotiationState::Multi {
                entry: EphemeralPeerRelayConfiguration {
                    relay: self.entry.clone(),
                    configuration: state.entry.clone(),
                },
                exit: EphemeralPeerRelayConfiguration {
                    relay: self.exit.clone(),
                    configuration: state.exit.clone(),
                },
            }
        };
        self.handler.update_configuration(state).await;
    }

    async fn complete_leg(
        &self,
        ephemeral_key: PrivateKey,
        preshared_key: Option<PreSharedKey>,
        daita: Option<DaitaParameters>,
    ) {
        if self.token.is_cancelled() {
            return;
        }
        let leg = {
            let mut state = self.state.lock();
            match state.leg {
                Leg::Entry => {
                    state.entry = EphemeralPeerConfiguration {
                        private_key: ephemeral_key,
                        preshared_key,
                        allowed_ips: vec![IpAddressRange::host(
                            self.exit.endpoint.socket_address.ip(),
                        )],
                        daita: daita.filter(|_| self.enable_daita),
                    };
                }
                Leg::Exit => {
                    state.exit = EphemeralPeerConfiguration {
                        private_key: ephemeral_key,
                        preshared_key,
                        allowed_ips: IpAddressRange::all_routes(),
                        daita: None,
                    };
                }
            }
            state.leg
        };

        info!("Negotiated ephemeral peer for {:?} leg", leg);
        self.apply().await;
        if leg == Leg::Exit {
            self.handler.finish(ExchangeOutcome::Negotiated).await;
        }
    }
}

#[async_trait]
impl EphemeralPeerReceiver for MultiHopEphemeralPeerExchanger {
    async fn receive_post_quantum_key(
        &self,
        preshared_key: PreSharedKey,
        ephemeral_key: PrivateKey,
        daita: Option<DaitaParameters>,
    ) {
        self.complete_leg(ephemeral_key, Some(preshared_key), daita)
            .await;
    }

    async fn receive_ephemeral_peer_private_key(
        &self,
        ephemeral_key: PrivateKey,
        daita: Option<DaitaParameters>,
    ) {
        self.complete_leg(ephemeral_key, None, daita).await;
    }

    async fn exchange_failed(&self, _error: NegotiationError) {
        self.handler.finish(ExchangeOutcome::Failed).await;
    }
}
