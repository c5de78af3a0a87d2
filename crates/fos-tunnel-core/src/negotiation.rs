use crate::command::Command;
use crate::event_channel::EventChannel;
use async_trait::async_trait;
use fos_ephemeral_peer::{
    EphemeralPeerExchangeHandler, EphemeralPeerNegotiationState, ExchangeOutcome,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Routes exchange callbacks back into the actor as commands, tagged with the
/// negotiation id so stale callbacks can be told apart.
pub(crate) struct NegotiationHandler {
    pub id: u64,
    pub channel: Arc<EventChannel>,
}

#[async_trait]
impl EphemeralPeerExchangeHandler for NegotiationHandler {
    async fn update_configuration(&self, state: EphemeralPeerNegotiationState) {
        let (ack, applied) = oneshot::channel();
        self.channel
            .send(Command::EphemeralPeerNegotiationStateChanged {
                id: self.id,
                state,
                ack,
            });
        if applied.await.is_err() {
            debug!("Negotiation {} configuration was not applied", self.id);
        }
    }

    async fn finish(&self, outcome: ExchangeOutcome) {
        self.channel.send(Command::NotifyEphemeralPeerNegotiated {
            id: self.id,
            outcome,
        });
    }
}
