//! Commands consumed by the tunnel actor.

use crate::state::BlockedReason;
use crate::task_queue::TaskKind;
use fos_ephemeral_peer::{EphemeralPeerNegotiationState, ExchangeOutcome};
use fos_tunnel_monitor::TunnelMonitorEvent;
use fos_tunnel_types::{NetworkPath, NextRelays, SelectedRelays};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectReason {
    /// Requested by the host or a recovery attempt; keeps the attempt count
    UserInitiated,
    /// Liveness pings failed; bumps the attempt count
    ConnectionLoss,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Relays picked by the host before the tunnel started
    pub selected_relays: Option<SelectedRelays>,
}

#[derive(Debug)]
pub enum Command {
    Start(StartOptions),
    Reconnect {
        next_relays: NextRelays,
        reason: ReconnectReason,
    },
    SwitchKey,
    Stop,
    SetErrorState(BlockedReason),
    MonitorEvent(TunnelMonitorEvent),
    NetworkPathChanged(NetworkPath),
    EphemeralPeerNegotiationStateChanged {
        id: u64,
        state: EphemeralPeerNegotiationState,
        /// Dropped or fired once the configuration is applied
        ack: oneshot::Sender<()>,
    },
    NotifyEphemeralPeerNegotiated {
        id: u64,
        outcome: ExchangeOutcome,
    },
}

impl Command {
    pub fn task_kind(&self) -> TaskKind {
        match self {
            Command::Start(_) => TaskKind::Start,
            Command::Reconnect { .. } => TaskKind::Reconnect,
            Command::Stop => TaskKind::Stop,
            _ => TaskKind::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "start",
            Command::Reconnect { .. } => "reconnect",
            Command::SwitchKey => "switch_key",
            Command::Stop => "stop",
            Command::SetErrorState(_) => "set_error_state",
            Command::MonitorEvent(_) => "monitor_event",
            Command::NetworkPathChanged(_) => "network_path_changed",
            Command::EphemeralPeerNegotiationStateChanged { .. } => {
                "ephemeral_peer_negotiation_state_changed"
            }
            Command::NotifyEphemeralPeerNegotiated { .. } => "notify_ephemeral_peer_negotiated",
        }
    }
}
