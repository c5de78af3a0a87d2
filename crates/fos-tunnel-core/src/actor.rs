//! Packet Tunnel Actor
//!
//! Owns the tunnel state machine. Every public call becomes a [`Command`] on
//! the [`EventChannel`]; a consumer task moves commands into the
//! [`TaskQueue`], which runs them one at a time.
//!
//! ```text
//!  start/stop/reconnect ──▶ EventChannel ──▶ TaskQueue ──▶ execute(command)
//!  monitor events ─────────────▲                               │
//!  path changes ───────────────┤                               ├─▶ TunnelAdapter
//!  exchange callbacks ─────────┘                               ├─▶ LivenessMonitor
//!                                                              ├─▶ ProtocolObfuscation
//!                                                              └─▶ watch<ObservedState>
//! ```
//!
//! State lives behind a `parking_lot::Mutex` that is never held across an
//! await; every transition is published to a `watch` channel.

use crate::collaborators::{
    DefaultPathObserver, NetworkPathHandler, RelaySelector, SettingsReader, TunnelAdapter,
};
use crate::command::{Command, ReconnectReason, StartOptions};
use crate::configuration::{direct_configuration, exchange_configuration};
use crate::error::{ActorError, TunnelAdapterError};
use crate::error_mapper::BlockedStateErrorMapper;
use crate::event_channel::EventChannel;
use crate::negotiation::NegotiationHandler;
use crate::state::{
    BlockedReason, BlockedState, ConnectionData, NegotiationData, ObservedState, RecoveryTask,
    State, TargetState,
};
use crate::task_queue::TaskQueue;
use fos_ephemeral_peer::{
    EphemeralPeerExchangingPipeline, EphemeralPeerNegotiationState, EphemeralPeerNegotiator,
    ExchangeOutcome, ExchangeParameters,
};
use fos_obfuscation::ProtocolObfuscation;
use fos_tunnel_monitor::{LivenessMonitor, TunnelMonitorEvent, TunnelMonitorEventHandler};
use fos_tunnel_types::{
    ActorTimings, NegotiationTimings, NetworkPath, NetworkReachability, NextRelays,
    SelectedRelays, Settings, TunnelAdapterConfiguration,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the actor talks to.
pub struct ActorDependencies {
    pub tunnel_adapter: Arc<dyn TunnelAdapter>,
    pub tunnel_monitor: Arc<dyn LivenessMonitor>,
    pub default_path_observer: Arc<dyn DefaultPathObserver>,
    pub blocked_state_error_mapper: Arc<dyn BlockedStateErrorMapper>,
    pub relay_selector: Arc<dyn RelaySelector>,
    pub settings_reader: Arc<dyn SettingsReader>,
    pub protocol_obfuscator: Arc<dyn ProtocolObfuscation>,
    pub ephemeral_peer_negotiator: Arc<dyn EphemeralPeerNegotiator>,
}

/// Handle to a running tunnel actor.
///
/// Dropping the handle finishes the command channel; commands already
/// queued still run.
pub struct PacketTunnelActor {
    inner: Arc<ActorInner>,
}

struct ActorInner {
    deps: ActorDependencies,
    timings: ActorTimings,
    channel: Arc<EventChannel>,
    task_queue: TaskQueue,
    pipeline: EphemeralPeerExchangingPipeline,
    state: Mutex<State>,
    observed: watch::Sender<ObservedState>,
    /// Set by `stop()`; errors reported afterwards are discarded
    stop_requested: AtomicBool,
    /// Set once a start has subscribed to the path observer and monitor
    started: AtomicBool,
    negotiation_id: AtomicU64,
    path_handler: NetworkPathHandler,
    monitor_handler: TunnelMonitorEventHandler,
}

impl PacketTunnelActor {
    /// Create the actor and spawn its command consumer. Must be called from
    /// within a tokio runtime.
    pub fn new(
        dependencies: ActorDependencies,
        timings: ActorTimings,
        negotiation_timings: NegotiationTimings,
    ) -> Self {
        let channel = Arc::new(EventChannel::new());

        let path_handler: NetworkPathHandler = {
            let channel = channel.clone();
            Arc::new(move |path| channel.send(Command::NetworkPathChanged(path)))
        };
        let monitor_handler: TunnelMonitorEventHandler = {
            let channel = channel.clone();
            Arc::new(move |event| channel.send(Command::MonitorEvent(event)))
        };

        let pipeline = EphemeralPeerExchangingPipeline::new(
            dependencies.ephemeral_peer_negotiator.clone(),
            negotiation_timings,
        );
        let (observed, _) = watch::channel(ObservedState::Initial);

        let inner = Arc::new(ActorInner {
            deps: dependencies,
            timings,
            channel: channel.clone(),
            task_queue: TaskQueue::new(),
            pipeline,
            state: Mutex::new(State::Initial),
            observed,
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            negotiation_id: AtomicU64::new(0),
            path_handler,
            monitor_handler,
        });

        tokio::spawn(consume_commands(Arc::downgrade(&inner), channel));

        Self { inner }
    }

    pub fn start(&self, options: StartOptions) {
        self.send(Command::Start(options));
    }

    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.send(Command::Stop);
    }

    pub fn reconnect(&self, next_relays: NextRelays, reason: ReconnectReason) {
        self.send(Command::Reconnect {
            next_relays,
            reason,
        });
    }

    /// Re-read the device key and reconnect if it changed.
    pub fn switch_key(&self) {
        self.send(Command::SwitchKey);
    }

    pub fn set_error_state(&self, reason: BlockedReason) {
        self.send(Command::SetErrorState(reason));
    }

    pub fn on_sleep(&self) {
        self.inner.deps.tunnel_monitor.on_sleep();
    }

    pub fn on_wake(&self) {
        self.inner.deps.tunnel_monitor.on_wake();
    }

    pub fn send(&self, command: Command) {
        self.inner.channel.send(command);
    }

    pub fn observed_state(&self) -> ObservedState {
        self.inner.observed.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ObservedState> {
        self.inner.observed.subscribe()
    }

    /// Resolve once the tunnel is connected, or once it is going down.
    pub async fn wait_until_connected(&self) -> ObservedState {
        let mut receiver = self.subscribe();
        let result = receiver
            .wait_for(|state| {
                matches!(
                    state,
                    ObservedState::Connected(_)
                        | ObservedState::Disconnecting(_)
                        | ObservedState::Disconnected
                )
            })
            .await
            .map(|state| state.clone());
        result.unwrap_or_else(|_| self.observed_state())
    }

    pub async fn wait_until_disconnected(&self) {
        let mut receiver = self.subscribe();
        let _ = receiver
            .wait_for(|state| matches!(state, ObservedState::Disconnected))
            .await;
    }
}

impl Drop for PacketTunnelActor {
    fn drop(&mut self) {
        self.inner.channel.finish();
    }
}

async fn consume_commands(actor: Weak<ActorInner>, channel: Arc<EventChannel>) {
    while let Some(command) = channel.next().await {
        let Some(actor) = actor.upgrade() else {
            break;
        };
        actor.enqueue(command);
    }
    debug!("Command channel finished");
}

impl ActorInner {
    fn enqueue(self: &Arc<Self>, command: Command) {
        debug!("Queueing command: {}", command.name());
        let kind = command.task_kind();
        let actor = self.clone();
        // Cancellation drops the future, so the token is not consulted here.
        drop(
            self.task_queue
                .add(kind, move |_token| async move { actor.execute(command).await }),
        );
    }

    async fn execute(&self, command: Command) {
        match command {
            Command::Start(options) => self.start(options).await,
            Command::Reconnect {
                next_relays,
                reason,
            } => self.reconnect(next_relays, reason).await,
            Command::SwitchKey => self.switch_key().await,
            Command::Stop => self.stop().await,
            Command::SetErrorState(reason) => self.enter_error_state(reason).await,
            Command::MonitorEvent(event) => self.handle_monitor_event(event),
            Command::NetworkPathChanged(path) => self.handle_network_path(path),
            Command::EphemeralPeerNegotiationStateChanged { id, state, ack } => {
                self.apply_exchange_configuration(id, state, ack).await
            }
            Command::NotifyEphemeralPeerNegotiated { id, outcome } => {
                self.finish_negotiation(id, outcome)
            }
        }
    }

    // ------------------------------------------------------------------
    // Start / reconnect
    // ------------------------------------------------------------------

    async fn start(&self, options: StartOptions) {
        let is_initial = matches!(*self.state.lock(), State::Initial);
        if !is_initial {
            debug!("Ignoring start, tunnel already started");
            return;
        }

        info!("Starting tunnel");
        self.started.store(true, Ordering::SeqCst);
        self.start_path_observer(false);
        self.deps
            .tunnel_monitor
            .set_event_handler(Some(self.monitor_handler.clone()));

        let next_relays = options
            .selected_relays
            .map(NextRelays::PreSelected)
            .unwrap_or_default();
        if let Err(e) = self.try_start(next_relays, ReconnectReason::UserInitiated).await {
            self.handle_start_error(e).await;
        }
    }

    async fn reconnect(&self, next_relays: NextRelays, reason: ReconnectReason) {
        let can_reconnect = {
            let state = self.state.lock();
            state.is_connection_family() || matches!(*state, State::Error(_))
        };
        if !can_reconnect {
            debug!("Ignoring reconnect in {} state", self.state.lock().name());
            return;
        }

        info!("Reconnecting ({:?})", reason);
        self.deps.tunnel_monitor.stop();
        self.pipeline.cancel();

        if let Err(e) = self.try_start(next_relays, reason).await {
            self.handle_start_error(e).await;
        }
    }

    async fn handle_start_error(&self, error: ActorError) {
        error!("Failed to start tunnel: {}", error);
        let reason = self.deps.blocked_state_error_mapper.map(&error);
        self.enter_error_state(reason).await;
    }

    async fn try_start(
        &self,
        next_relays: NextRelays,
        reason: ReconnectReason,
    ) -> Result<(), ActorError> {
        let settings = self.deps.settings_reader.read().await?;

        let Some(mut connection) = self.make_connection_data(&next_relays, &settings, reason)?
        else {
            return Ok(());
        };
        let target = self.state.lock().target_state_for_reconnect();
        let Some(target) = target else {
            return Ok(());
        };

        let ingress = connection.selected_relays.ingress().endpoint.clone();
        let obfuscator = &self.deps.protocol_obfuscator;
        connection.connected_endpoint = obfuscator
            .obfuscate(&ingress, &settings.private_key.public_key())
            .await?;
        connection.transport_layer = obfuscator
            .transport_layer()
            .unwrap_or_else(|| ingress.obfuscation.transport_layer());
        connection.remote_port = obfuscator
            .remote_port()
            .unwrap_or(ingress.socket_address.port());

        info!(
            "Connecting to {} (attempt {})",
            connection.selected_relays, connection.connection_attempt_count
        );
        match target {
            TargetState::Connecting => self.set_state(State::Connecting(connection.clone())),
            TargetState::Reconnecting => self.set_state(State::Reconnecting(connection.clone())),
        }

        if settings.requires_ephemeral_peer() {
            self.start_negotiation(connection, &settings);
            return Ok(());
        }

        self.configure_adapter(direct_configuration(&connection), false)
            .await?;
        self.deps.tunnel_monitor.start(
            connection.selected_relays.exit.endpoint.ipv4_gateway,
            connection.connection_attempt_count,
        );
        Ok(())
    }

    /// Connection data for the next attempt, or `None` when the actor is
    /// shutting down.
    fn make_connection_data(
        &self,
        next_relays: &NextRelays,
        settings: &Settings,
        reason: ReconnectReason,
    ) -> Result<Option<ConnectionData>, ActorError> {
        let (attempt, current_relays, network_reachability) = {
            let state = self.state.lock();
            match &*state {
                State::Disconnecting(_) | State::Disconnected => return Ok(None),
                State::Error(blocked) => (0, None, blocked.network_reachability),
                State::Initial => (0, None, self.current_reachability()),
                other => match other.connection() {
                    Some(connection) => {
                        let attempt = match reason {
                            ReconnectReason::ConnectionLoss => {
                                connection.connection_attempt_count.saturating_add(1)
                            }
                            ReconnectReason::UserInitiated => connection.connection_attempt_count,
                        };
                        (
                            attempt,
                            Some(connection.selected_relays.clone()),
                            connection.network_reachability,
                        )
                    }
                    None => (0, None, self.current_reachability()),
                },
            }
        };

        let selected_relays = self.select_relays(next_relays, current_relays, settings, attempt)?;
        let ingress = selected_relays.ingress().endpoint.clone();

        Ok(Some(ConnectionData {
            selected_relays,
            relay_constraints: settings.relay_constraints.clone(),
            current_key: settings.private_key.clone(),
            interface_addresses: settings.interface_addresses.clone(),
            dns_servers: settings.dns_servers.clone(),
            network_reachability,
            connection_attempt_count: attempt,
            transport_layer: ingress.obfuscation.transport_layer(),
            remote_port: ingress.socket_address.port(),
            connected_endpoint: ingress,
            is_post_quantum: settings.quantum_resistance.is_enabled(),
            is_daita_enabled: settings.daita.enabled,
        }))
    }

    fn select_relays(
        &self,
        next_relays: &NextRelays,
        current_relays: Option<SelectedRelays>,
        settings: &Settings,
        attempt: u32,
    ) -> Result<SelectedRelays, ActorError> {
        match (next_relays, current_relays) {
            (NextRelays::PreSelected(relays), _) => Ok(relays.clone()),
            (NextRelays::Current, Some(current)) => Ok(current),
            _ => Ok(self.deps.relay_selector.select_relays(
                &settings.relay_constraints,
                attempt,
                settings.is_multihop(),
            )?),
        }
    }

    // ------------------------------------------------------------------
    // Ephemeral peer exchange
    // ------------------------------------------------------------------

    fn start_negotiation(&self, connection: ConnectionData, settings: &Settings) {
        let id = self.negotiation_id.fetch_add(1, Ordering::SeqCst) + 1;
        let parameters = ExchangeParameters {
            relays: connection.selected_relays.clone(),
            device_key: connection.current_key.clone(),
            enable_post_quantum: settings.quantum_resistance.is_enabled(),
            enable_daita: settings.daita.enabled,
        };

        info!(
            "Negotiating ephemeral peer {} (pq: {}, daita: {})",
            id, parameters.enable_post_quantum, parameters.enable_daita
        );
        self.set_state(State::NegotiatingEphemeralPeer(
            connection,
            NegotiationData {
                id,
                adapter_started: false,
            },
        ));
        self.pipeline.start_negotiation(
            parameters,
            Arc::new(NegotiationHandler {
                id,
                channel: self.channel.clone(),
            }),
        );
    }

    async fn apply_exchange_configuration(
        &self,
        id: u64,
        exchange_state: EphemeralPeerNegotiationState,
        ack: oneshot::Sender<()>,
    ) {
        let pending = match &*self.state.lock() {
            State::NegotiatingEphemeralPeer(connection, negotiation) if negotiation.id == id => {
                Some((connection.clone(), negotiation.adapter_started))
            }
            _ => None,
        };
        let Some((connection, adapter_started)) = pending else {
            debug!("Ignoring configuration from stale negotiation {}", id);
            return;
        };

        let configuration = exchange_configuration(&connection, &exchange_state);
        match self.configure_adapter(configuration, adapter_started).await {
            Ok(()) => {
                if let State::NegotiatingEphemeralPeer(_, negotiation) = &mut *self.state.lock() {
                    negotiation.adapter_started = true;
                }
                let _ = ack.send(());
            }
            Err(e) => {
                self.pipeline.cancel();
                self.handle_start_error(e.into()).await;
            }
        }
    }

    fn finish_negotiation(&self, id: u64, outcome: ExchangeOutcome) {
        let connection = match &*self.state.lock() {
            State::NegotiatingEphemeralPeer(connection, negotiation) if negotiation.id == id => {
                Some(connection.clone())
            }
            _ => None,
        };
        let Some(connection) = connection else {
            debug!("Ignoring outcome of stale negotiation {}", id);
            return;
        };

        match outcome {
            ExchangeOutcome::Negotiated => {
                info!("Ephemeral peer negotiated");
                self.deps.tunnel_monitor.start(
                    connection.selected_relays.exit.endpoint.ipv4_gateway,
                    connection.connection_attempt_count,
                );
            }
            ExchangeOutcome::Failed => {
                warn!("Ephemeral peer negotiation failed, retrying");
                self.channel.send(Command::Reconnect {
                    next_relays: NextRelays::Current,
                    reason: ReconnectReason::ConnectionLoss,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Monitor, path and key events
    // ------------------------------------------------------------------

    fn handle_monitor_event(&self, event: TunnelMonitorEvent) {
        match event {
            TunnelMonitorEvent::ConnectionEstablished => {
                let connection = match &*self.state.lock() {
                    State::Connecting(connection)
                    | State::Reconnecting(connection)
                    | State::NegotiatingEphemeralPeer(connection, _) => Some(connection.clone()),
                    _ => None,
                };
                if let Some(mut connection) = connection {
                    info!("Connection established to {}", connection.selected_relays);
                    connection.connection_attempt_count = 0;
                    self.set_state(State::Connected(connection));
                }
            }
            TunnelMonitorEvent::ConnectionLost => {
                let in_connection = self.state.lock().is_connection_family();
                if in_connection {
                    warn!("Connection lost, selecting a new relay");
                    self.channel.send(Command::Reconnect {
                        next_relays: NextRelays::Random,
                        reason: ReconnectReason::ConnectionLoss,
                    });
                }
            }
        }
    }

    fn handle_network_path(&self, path: NetworkPath) {
        let reachability = path.reachability();
        {
            let mut state = self.state.lock();
            match &mut *state {
                State::Error(blocked) => blocked.network_reachability = reachability,
                other => {
                    if let Some(connection) = other.connection_mut() {
                        connection.network_reachability = reachability;
                    }
                }
            }
        }
        debug!("Network path changed: {:?}", path.status);
        self.publish();
        self.deps.tunnel_monitor.handle_network_path_update(&path);
    }

    async fn switch_key(&self) {
        let settings = match self.deps.settings_reader.read().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to read settings for key switch: {}", e);
                return;
            }
        };

        let next_relays = {
            let state = self.state.lock();
            match &*state {
                State::Error(_) => Some(NextRelays::Random),
                other if other.is_connection_family() => other
                    .connection()
                    .filter(|connection| connection.current_key != settings.private_key)
                    .map(|_| NextRelays::Current),
                _ => None,
            }
        };

        if let Some(next_relays) = next_relays {
            info!("Device key changed, reconnecting");
            self.channel.send(Command::Reconnect {
                next_relays,
                reason: ReconnectReason::UserInitiated,
            });
        }
    }

    // ------------------------------------------------------------------
    // Stop / error
    // ------------------------------------------------------------------

    async fn stop(&self) {
        let connection = {
            let state = self.state.lock();
            match &*state {
                // A start cancelled before leaving `initial` has already
                // subscribed to the observers and needs the full teardown.
                State::Initial if !self.started.load(Ordering::SeqCst) => {
                    info!("Stop requested before start");
                    self.stop_requested.store(false, Ordering::SeqCst);
                    return;
                }
                State::Disconnecting(_) | State::Disconnected => return,
                other => other.connection().cloned(),
            }
        };

        info!("Stopping tunnel");
        if let Some(connection) = connection {
            self.set_state(State::Disconnecting(connection));
        }
        self.deps.tunnel_monitor.stop();
        self.deps.tunnel_monitor.set_event_handler(None);
        self.pipeline.cancel();
        self.deps.default_path_observer.stop();
        self.deps.protocol_obfuscator.stop();

        if let Err(e) = self.deps.tunnel_adapter.stop().await {
            error!("Failed to stop tunnel adapter: {}", e);
        }
        self.set_state(State::Disconnected);
        info!("Tunnel stopped");
    }

    async fn enter_error_state(&self, reason: BlockedReason) {
        if self.stop_requested.load(Ordering::SeqCst) {
            debug!("Stop requested, discarding error {:?}", reason);
            return;
        }

        let blocked = {
            let mut state = self.state.lock();
            if let State::Error(blocked) = &mut *state {
                blocked.reason = reason;
                None
            } else if let Some(prior_state) = state.prior_state() {
                let connection = state.connection();
                Some(BlockedState {
                    reason,
                    prior_state,
                    relay_constraints: connection.map(|c| c.relay_constraints.clone()),
                    network_reachability: connection
                        .map(|c| c.network_reachability)
                        .unwrap_or_else(|| self.current_reachability()),
                    interface_addresses: connection
                        .map(|c| c.interface_addresses.clone())
                        .unwrap_or_default(),
                    recovery_task: None,
                })
            } else {
                debug!("Ignoring error {:?} in {} state", reason, state.name());
                return;
            }
        };

        let Some(mut blocked) = blocked else {
            info!("Error reason changed to {:?}", reason);
            self.publish();
            return;
        };

        warn!("Entering error state: {:?}", reason);
        self.deps.tunnel_monitor.stop();
        self.pipeline.cancel();

        if reason.is_recoverable() {
            blocked.recovery_task = Some(self.spawn_recovery_task());
        }
        let configuration = TunnelAdapterConfiguration::blocked(blocked.interface_addresses.clone());
        self.set_state(State::Error(blocked));

        if let Err(e) = self.configure_adapter(configuration, false).await {
            error!("Failed to block traffic: {}", e);
        }
    }

    /// Periodic reconnects while blocked; aborted when the error state is left.
    fn spawn_recovery_task(&self) -> RecoveryTask {
        let channel = self.channel.clone();
        let period = self.timings.boot_recovery_period;
        RecoveryTask(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                debug!("Attempting recovery from error state");
                channel.send(Command::Reconnect {
                    next_relays: NextRelays::Random,
                    reason: ReconnectReason::UserInitiated,
                });
            }
        }))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Apply `configuration` with the path observer paused, so the
    /// adapter's own route changes are not reported back to us.
    async fn configure_adapter(
        &self,
        configuration: TunnelAdapterConfiguration,
        reconfigure: bool,
    ) -> Result<(), TunnelAdapterError> {
        if !configuration.is_blocked() {
            configuration.validate()?;
        }

        let _paused = PausedPathObserver::new(self);
        if reconfigure {
            self.deps.tunnel_adapter.reconfigure(configuration).await
        } else {
            self.deps.tunnel_adapter.start(configuration).await
        }
    }

    fn start_path_observer(&self, notify_current_path: bool) {
        let observer = &self.deps.default_path_observer;
        observer.start(self.path_handler.clone());
        if notify_current_path {
            if let Some(path) = observer.current_path() {
                self.channel.send(Command::NetworkPathChanged(path));
            }
        }
    }

    fn current_reachability(&self) -> NetworkReachability {
        self.deps
            .default_path_observer
            .current_path()
            .map(|path| path.reachability())
            .unwrap_or_default()
    }

    fn set_state(&self, next: State) {
        let observed = next.observed();
        let next_name = next.name();
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous.name() != next_name {
            info!("Tunnel state: {} -> {}", previous.name(), next_name);
        }
        // Leaving the error state aborts its recovery task here.
        drop(previous);
        self.publish_observed(observed);
    }

    fn publish(&self) {
        let observed = self.state.lock().observed();
        self.publish_observed(observed);
    }

    fn publish_observed(&self, observed: ObservedState) {
        self.observed.send_if_modified(|current| {
            if *current == observed {
                false
            } else {
                *current = observed;
                true
            }
        });
    }
}

/// Stops the path observer for its lifetime and restarts it on drop, also
/// when the surrounding task is cancelled mid-configuration.
struct PausedPathObserver<'a> {
    actor: &'a ActorInner,
}

impl<'a> PausedPathObserver<'a> {
    fn new(actor: &'a ActorInner) -> Self {
        actor.deps.default_path_observer.stop();
        Self { actor }
    }
}

impl Drop for PausedPathObserver<'_> {
    fn drop(&mut self) {
        self.actor.start_path_observer(true);
    }
}
