//! In-memory collaborators for actor tests.

use crate::actor::{ActorDependencies, PacketTunnelActor};
use crate::collaborators::{
    DefaultPathObserver, NetworkPathHandler, RelaySelector, SettingsReader, TunnelAdapter,
};
use crate::error::{ReadSettingsError, RelaySelectorError, TunnelAdapterError};
use crate::error_mapper::DefaultBlockedStateErrorMapper;
use async_trait::async_trait;
use fos_ephemeral_peer::{
    EphemeralPeerNegotiator, NegotiatedPeer, NegotiationError, NegotiationRequest,
};
use fos_obfuscation::{ObfuscationError, ProtocolObfuscation};
use fos_tunnel_monitor::{LivenessMonitor, TunnelMonitorEvent, TunnelMonitorEventHandler};
use fos_tunnel_types::{
    ActorTimings, Location, NegotiationTimings, NetworkPath, ObfuscationMethod, PathStatus,
    PrivateKey, PublicKey, RelayConstraints, SelectedEndpoint, SelectedRelay, SelectedRelays,
    Settings, TransportLayer, TunnelAdapterConfiguration,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub(crate) struct MockSettingsReader {
    settings: Mutex<Settings>,
    failure: Mutex<Option<ReadSettingsError>>,
    delay: Mutex<Option<Duration>>,
}

impl MockSettingsReader {
    /// Make every read take `delay` before answering.
    pub fn delay_reads(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_with(&self, error: ReadSettingsError) {
        *self.failure.lock() = Some(error);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.lock());
    }

    pub fn current(&self) -> Settings {
        self.settings.lock().clone()
    }
}

#[async_trait]
impl SettingsReader for MockSettingsReader {
    async fn read(&self) -> Result<Settings, ReadSettingsError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(self.current()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AdapterCall {
    Start(TunnelAdapterConfiguration),
    Reconfigure(TunnelAdapterConfiguration),
    Stop,
}

/// Adapter and monitor calls in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Adapter(AdapterCall),
    Monitor(MonitorCall),
}

pub(crate) type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Default)]
pub(crate) struct MockTunnelAdapter {
    calls: Mutex<Vec<AdapterCall>>,
    log: CallLog,
    fail_connections: AtomicBool,
}

impl MockTunnelAdapter {
    /// Fail every configuration that has peers.
    pub fn fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn started_configurations(&self) -> Vec<TunnelAdapterConfiguration> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                AdapterCall::Start(configuration) => Some(configuration.clone()),
                _ => None,
            })
            .collect()
    }

    fn should_fail(&self, configuration: &TunnelAdapterConfiguration) -> bool {
        self.fail_connections.load(Ordering::SeqCst) && !configuration.is_blocked()
    }

    fn record(&self, call: AdapterCall) {
        self.log.lock().push(Call::Adapter(call.clone()));
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TunnelAdapter for MockTunnelAdapter {
    async fn start(
        &self,
        configuration: TunnelAdapterConfiguration,
    ) -> Result<(), TunnelAdapterError> {
        let fail = self.should_fail(&configuration);
        self.record(AdapterCall::Start(configuration));
        if fail {
            return Err(TunnelAdapterError::Start("device busy".to_string()));
        }
        Ok(())
    }

    async fn reconfigure(
        &self,
        configuration: TunnelAdapterConfiguration,
    ) -> Result<(), TunnelAdapterError> {
        let fail = self.should_fail(&configuration);
        self.record(AdapterCall::Reconfigure(configuration));
        if fail {
            return Err(TunnelAdapterError::Reconfigure("device busy".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelAdapterError> {
        self.record(AdapterCall::Stop);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MonitorCall {
    Start(Ipv4Addr, u32),
    Stop,
    PathUpdate(PathStatus),
    Sleep,
    Wake,
}

/// Records calls; optionally reports the connection as up on every start.
#[derive(Default)]
pub(crate) struct MockLivenessMonitor {
    calls: Mutex<Vec<MonitorCall>>,
    log: CallLog,
    handler: Mutex<Option<TunnelMonitorEventHandler>>,
    auto_establish: AtomicBool,
}

impl MockLivenessMonitor {
    pub fn set_auto_establish(&self, enabled: bool) {
        self.auto_establish.store(enabled, Ordering::SeqCst);
    }

    pub fn emit(&self, event: TunnelMonitorEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn calls(&self) -> Vec<MonitorCall> {
        self.calls.lock().clone()
    }

    pub fn has_event_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    fn record(&self, call: MonitorCall) {
        self.log.lock().push(Call::Monitor(call.clone()));
        self.calls.lock().push(call);
    }
}

impl LivenessMonitor for MockLivenessMonitor {
    fn set_event_handler(&self, handler: Option<TunnelMonitorEventHandler>) {
        *self.handler.lock() = handler;
    }

    fn start(&self, ping_address: Ipv4Addr, retry_attempt: u32) {
        self.record(MonitorCall::Start(ping_address, retry_attempt));
        if self.auto_establish.load(Ordering::SeqCst) {
            self.emit(TunnelMonitorEvent::ConnectionEstablished);
        }
    }

    fn stop(&self) {
        self.record(MonitorCall::Stop);
    }

    fn on_wake(&self) {
        self.record(MonitorCall::Wake);
    }

    fn on_sleep(&self) {
        self.record(MonitorCall::Sleep);
    }

    fn handle_network_path_update(&self, path: &NetworkPath) {
        self.record(MonitorCall::PathUpdate(path.status));
    }
}

pub(crate) struct MockPathObserver {
    path: Mutex<NetworkPath>,
    handler: Mutex<Option<NetworkPathHandler>>,
}

impl MockPathObserver {
    pub fn is_started(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Change the default path, notifying the handler if observing.
    pub fn emit(&self, path: NetworkPath) {
        *self.path.lock() = path.clone();
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(path);
        }
    }
}

impl DefaultPathObserver for MockPathObserver {
    fn current_path(&self) -> Option<NetworkPath> {
        Some(self.path.lock().clone())
    }

    fn start(&self, handler: NetworkPathHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn stop(&self) {
        *self.handler.lock() = None;
    }
}

pub(crate) struct MockRelaySelector {
    relays: SelectedRelays,
    attempts: Mutex<Vec<u32>>,
}

impl MockRelaySelector {
    pub fn relays(&self) -> SelectedRelays {
        self.relays.clone()
    }

    /// Attempt counts the selector was asked with, in order.
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

impl RelaySelector for MockRelaySelector {
    fn select_relays(
        &self,
        _constraints: &RelayConstraints,
        connection_attempt_count: u32,
        multihop: bool,
    ) -> Result<SelectedRelays, RelaySelectorError> {
        self.attempts.lock().push(connection_attempt_count);
        if multihop && !self.relays.is_multihop() {
            return Err(RelaySelectorError::NoRelaysSatisfyingConstraints);
        }
        Ok(self.relays.clone())
    }
}

/// Passes endpoints through untouched.
#[derive(Default)]
pub(crate) struct MockObfuscation {
    stopped: AtomicBool,
}

impl MockObfuscation {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolObfuscation for MockObfuscation {
    async fn obfuscate(
        &self,
        endpoint: &SelectedEndpoint,
        _client_public_key: &PublicKey,
    ) -> Result<SelectedEndpoint, ObfuscationError> {
        self.stopped.store(false, Ordering::SeqCst);
        Ok(endpoint.clone())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn transport_layer(&self) -> Option<TransportLayer> {
        None
    }

    fn remote_port(&self) -> Option<u16> {
        None
    }
}

/// Replies with queued results; hangs once the queue is empty.
#[derive(Default)]
pub(crate) struct MockNegotiator {
    replies: Mutex<VecDeque<Result<NegotiatedPeer, NegotiationError>>>,
    requests: Mutex<Vec<NegotiationRequest>>,
}

impl MockNegotiator {
    pub fn push(&self, reply: Result<NegotiatedPeer, NegotiationError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<NegotiationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl EphemeralPeerNegotiator for MockNegotiator {
    async fn negotiate(
        &self,
        request: &NegotiationRequest,
    ) -> Result<NegotiatedPeer, NegotiationError> {
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }
}

fn relay(hostname: &str, last_octet: u8) -> SelectedRelay {
    SelectedRelay {
        endpoint: SelectedEndpoint {
            socket_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(185, 213, 154, last_octet)),
                51820,
            ),
            ipv4_gateway: Ipv4Addr::new(10, 64, 0, 1),
            ipv6_gateway: Ipv6Addr::LOCALHOST,
            public_key: PrivateKey::generate().public_key(),
            obfuscation: ObfuscationMethod::Off,
        },
        hostname: hostname.to_string(),
        location: Location::default(),
        retry_attempts: 0,
    }
}

/// One set of mocks wired into an actor.
pub(crate) struct Harness {
    pub log: CallLog,
    pub settings: Arc<MockSettingsReader>,
    pub adapter: Arc<MockTunnelAdapter>,
    pub monitor: Arc<MockLivenessMonitor>,
    pub path_observer: Arc<MockPathObserver>,
    pub relay_selector: Arc<MockRelaySelector>,
    pub obfuscator: Arc<MockObfuscation>,
    pub negotiator: Arc<MockNegotiator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_relays(SelectedRelays {
            entry: None,
            exit: relay("se-got-wg-001", 2),
            retry_attempt: 0,
        })
    }

    pub fn multihop() -> Self {
        Self::with_relays(SelectedRelays {
            entry: Some(relay("de-fra-wg-005", 1)),
            exit: relay("se-got-wg-001", 2),
            retry_attempt: 0,
        })
    }

    fn with_relays(relays: SelectedRelays) -> Self {
        let settings = Settings::new(
            PrivateKey::generate(),
            vec!["10.64.0.2/32".parse().unwrap()],
        );
        let log = CallLog::default();
        Self {
            log: log.clone(),
            settings: Arc::new(MockSettingsReader {
                settings: Mutex::new(settings),
                failure: Mutex::new(None),
                delay: Mutex::new(None),
            }),
            adapter: Arc::new(MockTunnelAdapter {
                log: log.clone(),
                ..Default::default()
            }),
            monitor: Arc::new(MockLivenessMonitor {
                log,
                ..Default::default()
            }),
            path_observer: Arc::new(MockPathObserver {
                path: Mutex::new(NetworkPath::new(PathStatus::Satisfied)),
                handler: Mutex::new(None),
            }),
            relay_selector: Arc::new(MockRelaySelector {
                relays,
                attempts: Mutex::new(Vec::new()),
            }),
            obfuscator: Arc::default(),
            negotiator: Arc::default(),
        }
    }

    /// Adapter and monitor calls, interleaved.
    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().clone()
    }

    pub fn device_key(&self) -> PrivateKey {
        self.settings.current().private_key
    }

    pub fn actor(&self) -> PacketTunnelActor {
        PacketTunnelActor::new(
            ActorDependencies {
                tunnel_adapter: self.adapter.clone(),
                tunnel_monitor: self.monitor.clone(),
                default_path_observer: self.path_observer.clone(),
                blocked_state_error_mapper: Arc::new(DefaultBlockedStateErrorMapper),
                relay_selector: self.relay_selector.clone(),
                settings_reader: self.settings.clone(),
                protocol_obfuscator: self.obfuscator.clone(),
                ephemeral_peer_negotiator: self.negotiator.clone(),
            },
            ActorTimings::default(),
            NegotiationTimings::default(),
        )
    }
}
