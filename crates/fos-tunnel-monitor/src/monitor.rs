//! Tunnel Monitor
//!
//! Drives [`TunnelMonitorState`] from a periodic timer and from pinger
//! replies, and reports `ConnectionEstablished` / `ConnectionLost`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let monitor = TunnelMonitor::new(IcmpPinger::new(), device, timings);
//! monitor.set_event_handler(Some(Arc::new(|event| println!("{event:?}"))));
//! monitor.start(gateway, 0);
//! ```

use crate::pinger::{Pinger, PingerReply, ReplyHandler};
use crate::state::{ConnectionEvaluation, TunnelMonitorConnectionState, TunnelMonitorState};
use async_trait::async_trait;
use fos_tunnel_types::{NetworkPath, NetworkReachability, TunnelMonitorTimings, TunnelStats};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Verdicts reported to the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMonitorEvent {
    /// First ping reply while connecting
    ConnectionEstablished,
    /// A ping timed out, while connecting or after traffic stalled
    ConnectionLost,
}

pub type TunnelMonitorEventHandler = Arc<dyn Fn(TunnelMonitorEvent) + Send + Sync>;

/// Read-only view of the tunnel device.
#[async_trait]
pub trait TunnelDeviceInfo: Send + Sync {
    /// Name of the tunnel interface, used to bind the ping socket
    fn interface_name(&self) -> Option<String>;

    async fn stats(&self) -> io::Result<TunnelStats>;
}

/// The liveness monitor as seen by the tunnel actor.
pub trait LivenessMonitor: Send + Sync {
    fn set_event_handler(&self, handler: Option<TunnelMonitorEventHandler>);

    /// Start pinging `ping_address`. `retry_attempt` scales the establish timeout.
    fn start(&self, ping_address: Ipv4Addr, retry_attempt: u32);

    /// Stop pinging, close the socket and reset every counter.
    fn stop(&self);

    fn on_wake(&self);

    fn on_sleep(&self);

    fn handle_network_path_update(&self, path: &NetworkPath);
}

struct MonitorInner {
    state: TunnelMonitorState,
    ping_address: Option<Ipv4Addr>,
    pinger: Box<dyn Pinger>,
    is_network_reachable: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced, so stale ticks are dropped
    generation: u64,
    event_handler: Option<TunnelMonitorEventHandler>,
}

struct MonitorShared {
    inner: Mutex<MonitorInner>,
    device: Arc<dyn TunnelDeviceInfo>,
}

/// Timer-driven tunnel liveness monitor.
pub struct TunnelMonitor {
    shared: Arc<MonitorShared>,
}

impl TunnelMonitor {
    pub fn new<P>(pinger: P, device: Arc<dyn TunnelDeviceInfo>, timings: TunnelMonitorTimings) -> Self
    where
        P: Pinger + 'static,
    {
        let inner = MonitorInner {
            state: TunnelMonitorState::new(timings, Instant::now()),
            ping_address: None,
            pinger: Box::new(pinger),
            is_network_reachable: true,
            timer: None,
            generation: 0,
            event_handler: None,
        };
        Self {
            shared: Arc::new(MonitorShared {
                inner: Mutex::new(inner),
                device,
            }),
        }
    }

    pub fn connection_state(&self) -> TunnelMonitorConnectionState {
        self.shared.inner.lock().state.connection_state
    }

    /// Snapshot of the evaluator state.
    pub fn state(&self) -> TunnelMonitorState {
        self.shared.inner.lock().state.clone()
    }
}

impl LivenessMonitor for TunnelMonitor {
    fn set_event_handler(&self, handler: Option<TunnelMonitorEventHandler>) {
        self.shared.inner.lock().event_handler = handler;
    }

    fn start(&self, ping_address: Ipv4Addr, retry_attempt: u32) {
        let mut inner = self.shared.inner.lock();
        inner.ping_address = Some(ping_address);
        inner.state.retry_attempt = retry_attempt;

        if inner.is_network_reachable {
            info!("Start monitoring {} (attempt {})", ping_address, retry_attempt);
            self.shared.start_connectivity_check(&mut inner);
        } else {
            debug!("Network unreachable, delaying monitor start");
            inner.state.connection_state = TunnelMonitorConnectionState::PendingStart;
        }
    }

    fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state.connection_state != TunnelMonitorConnectionState::Stopped {
            debug!("Stop monitoring");
        }
        MonitorShared::stop_connectivity_check(&mut inner);
        inner.state.reset(Instant::now());
        inner.state.connection_state = TunnelMonitorConnectionState::Stopped;
        inner.ping_address = None;
    }

    fn on_wake(&self) {
        let mut inner = self.shared.inner.lock();
        if matches!(
            inner.state.connection_state,
            TunnelMonitorConnectionState::Connecting | TunnelMonitorConnectionState::Connected
        ) {
            debug!("Wake: resuming connectivity checks");
            self.shared.spawn_timer(&mut inner);
        }
    }

    fn on_sleep(&self) {
        let mut inner = self.shared.inner.lock();
        debug!("Sleep: pausing connectivity checks");
        MonitorShared::cancel_timer(&mut inner);
    }

    fn handle_network_path_update(&self, path: &NetworkPath) {
        let reachable = path.reachability() == NetworkReachability::Reachable;
        let mut inner = self.shared.inner.lock();
        inner.is_network_reachable = reachable;

        match inner.state.connection_state {
            TunnelMonitorConnectionState::PendingStart
            | TunnelMonitorConnectionState::WaitingConnectivity
                if reachable && inner.ping_address.is_some() =>
            {
                info!("Network reachable, resuming monitor");
                self.shared.start_connectivity_check(&mut inner);
            }
            TunnelMonitorConnectionState::Connecting | TunnelMonitorConnectionState::Connected
                if !reachable =>
            {
                info!("Network unreachable, pausing monitor");
                MonitorShared::stop_connectivity_check(&mut inner);
                inner.state.connection_state = TunnelMonitorConnectionState::WaitingConnectivity;
            }
            _ => {}
        }
    }
}

impl Drop for TunnelMonitor {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        MonitorShared::stop_connectivity_check(&mut inner);
    }
}

impl MonitorShared {
    fn start_connectivity_check(self: &Arc<Self>, inner: &mut MonitorInner) {
        Self::stop_connectivity_check(inner);

        let retry_attempt = inner.state.retry_attempt;
        let now = Instant::now();
        inner.state.reset(now);
        inner.state.retry_attempt = retry_attempt;
        inner.state.connection_state = TunnelMonitorConnectionState::Connecting;

        let weak = Arc::downgrade(self);
        let on_reply: ReplyHandler = Arc::new(move |reply| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_reply(reply);
            }
        });
        let interface = self.device.interface_name();
        if let Err(e) = inner.pinger.open_socket(interface.as_deref(), on_reply) {
            // Sends will fail and the establish timeout reports the loss.
            error!("Failed to open pinger socket: {}", e);
        }

        self.spawn_timer(inner);
    }

    fn stop_connectivity_check(inner: &mut MonitorInner) {
        Self::cancel_timer(inner);
        inner.pinger.close_socket();
    }

    fn cancel_timer(inner: &mut MonitorInner) {
        inner.generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    fn spawn_timer(self: &Arc<Self>, inner: &mut MonitorInner) {
        Self::cancel_timer(inner);

        let generation = inner.generation;
        let period = inner.state.timings.connectivity_check_interval;
        let weak = Arc::downgrade(self);

        inner.timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = Weak::upgrade(&weak) else {
                    break;
                };
                if !shared.check_connectivity(generation).await {
                    break;
                }
            }
        }));
    }

    /// One timer tick. Returns false once the tick belongs to a stale timer.
    async fn check_connectivity(self: &Arc<Self>, generation: u64) -> bool {
        let stats = self.device.stats().await;

        let (event, handler) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return false;
            }
            let now = Instant::now();
            match stats {
                Ok(stats) => inner.state.update_net_stats(stats, now),
                Err(e) => warn!("Failed to read tunnel stats: {}", e),
            }
            let event = Self::evaluate(&mut inner, now);
            (event, inner.event_handler.clone())
        };

        Self::emit(event, handler);
        true
    }

    fn handle_reply(&self, reply: PingerReply) {
        let (sender, sequence_number) = match reply {
            PingerReply::Response {
                sender,
                sequence_number,
            } => (sender, sequence_number),
            PingerReply::Failure(e) => {
                debug!("Pinger error: {}", e);
                return;
            }
        };

        let (event, handler) = {
            let mut inner = self.inner.lock();
            if inner.ping_address.map(IpAddr::V4) != Some(sender) {
                trace!("Ignoring reply from {}", sender);
                return;
            }

            let now = Instant::now();
            let Some(sent_at) = inner.state.set_ping_reply_received(sequence_number, now) else {
                trace!("Ignoring reply with unknown sequence #{}", sequence_number);
                return;
            };
            trace!(
                "Echo reply #{} in {:?}",
                sequence_number,
                now.saturating_duration_since(sent_at)
            );

            let mut event = None;
            if inner.state.connection_state == TunnelMonitorConnectionState::Connecting {
                info!("Connection established");
                inner.state.connection_state = TunnelMonitorConnectionState::Connected;
                event = Some(TunnelMonitorEvent::ConnectionEstablished);
            }
            if let Some(lost) = Self::evaluate(&mut inner, now) {
                event = Some(lost);
            }
            (event, inner.event_handler.clone())
        };

        Self::emit(event, handler);
    }

    /// Act on the current verdict. Returns an event when the connection is lost.
    fn evaluate(inner: &mut MonitorInner, now: Instant) -> Option<TunnelMonitorEvent> {
        let ping_timeout = inner.state.ping_timeout();
        let evaluation = inner.state.evaluate_connection(now, ping_timeout);
        if evaluation != ConnectionEvaluation::Ok {
            trace!("Evaluation: {:?}", evaluation);
        }

        match evaluation {
            ConnectionEvaluation::Ok => None,
            ConnectionEvaluation::SendInitialPing
            | ConnectionEvaluation::SendNextPing
            | ConnectionEvaluation::RetryHeartbeatPing => {
                Self::send_ping(inner, now);
                None
            }
            ConnectionEvaluation::SendHeartbeatPing => {
                inner.state.is_heartbeat_suspended = false;
                Self::send_ping(inner, now);
                None
            }
            ConnectionEvaluation::SuspendHeartbeat => {
                debug!("Traffic is flowing, suspending heartbeat");
                inner.state.is_heartbeat_suspended = true;
                None
            }
            ConnectionEvaluation::TrafficTimeout | ConnectionEvaluation::InboundTrafficTimeout => {
                warn!("{:?}, pinging the tunnel", evaluation);
                inner.state.is_heartbeat_suspended = false;
                inner.state.timeout_reference = now;
                Self::send_ping(inner, now);
                None
            }
            ConnectionEvaluation::PingTimeout => {
                warn!("Ping timeout after {:?}, connection lost", ping_timeout);
                Self::stop_connectivity_check(inner);
                inner.state.connection_state = TunnelMonitorConnectionState::Recovering;
                Some(TunnelMonitorEvent::ConnectionLost)
            }
        }
    }

    fn send_ping(inner: &mut MonitorInner, now: Instant) {
        let Some(ping_address) = inner.ping_address else {
            return;
        };
        match inner.pinger.send(ping_address) {
            Ok(result) => inner.state.update_ping_stats(result, now),
            Err(e) => {
                debug!("Failed to send ping: {}", e);
                inner.state.record_failed_send(now);
            }
        }
    }

    fn emit(event: Option<TunnelMonitorEvent>, handler: Option<TunnelMonitorEventHandler>) {
        if let (Some(event), Some(handler)) = (event, handler) {
            handler(event);
        }
    }
}
