use crate::configuration::EphemeralPeerExchangeHandler;
use crate::multi_hop::MultiHopEphemeralPeerExchanger;
use crate::negotiator::EphemeralPeerNegotiator;
use crate::single_hop::SingleHopEphemeralPeerExchanger;
use fos_tunnel_types::{NegotiationTimings, PrivateKey, SelectedRelays};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Inputs of one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeParameters {
    pub relays: SelectedRelays,
    pub device_key: PrivateKey,
    pub enable_post_quantum: bool,
    pub enable_daita: bool,
}

struct RunningExchange {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for RunningExchange {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Runs at most one exchange at a time, picking the single-hop or multi-hop
/// flow from the selected relays.
pub struct EphemeralPeerExchangingPipeline {
    negotiator: Arc<dyn EphemeralPeerNegotiator>,
    timings: NegotiationTimings,
    running: Mutex<Option<RunningExchange>>,
}

impl EphemeralPeerExchangingPipeline {
    pub fn new(negotiator: Arc<dyn EphemeralPeerNegotiator>, timings: NegotiationTimings) -> Self {
        Self {
            negotiator,
            timings,
            running: Mutex::new(None),
        }
    }

    /// Start a new exchange, cancelling any exchange in progress.
    pub fn start_negotiation(
        &self,
        parameters: ExchangeParameters,
        handler: Arc<dyn EphemeralPeerExchangeHandler>,
    ) {
        self.cancel();

        let token = CancellationToken::new();
        let negotiator = self.negotiator.clone();
        let timeout = self.timings.timeout;
        let ExchangeParameters {
            relays,
            device_key,
            enable_post_quantum,
            enable_daita,
        } = parameters;

        let task = match relays.entry {
            Some(entry) => {
                info!(
                    "Starting multi-hop ephemeral peer exchange via {} to {}",
                    entry, relays.exit
                );
                let exchanger = MultiHopEphemeralPeerExchanger::new(
                    entry,
                    relays.exit,
                    device_key,
                    enable_post_quantum,
                    enable_daita,
                    negotiator,
                    handler,
                    timeout,
                    token.clone(),
                );
                tokio::spawn(async move { exchanger.start().await })
            }
            None => {
                info!("Starting ephemeral peer exchange with {}", relays.exit);
                let exchanger = SingleHopEphemeralPeerExchanger::new(
                    relays.exit,
                    device_key,
                    enable_post_quantum,
                    enable_daita,
                    negotiator,
                    handler,
                    timeout,
                    token.clone(),
                );
                tokio::spawn(async move { exchanger.start().await })
            }
        };

        *self.running.lock() = Some(RunningExchange { token, task });
    }

    /// Abort the running exchange without reporting an outcome.
    pub fn cancel(&self) {
        if self.running.lock().take().is_some() {
            debug!("Cancelled ephemeral peer exchange");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }
}
