//! Actor state and the snapshot published to observers.
//!
//! ```text
//!  initial ─▶ connecting ─▶ negotiating ─▶ connected ◀─▶ reconnecting
//!                 │                            │
//!                 └────────▶ error ◀───────────┘
//!  any ─▶ disconnecting ─▶ disconnected
//! ```

use fos_tunnel_types::{
    IpAddressRange, NetworkReachability, PrivateKey, RelayConstraints, SelectedEndpoint,
    SelectedRelays, TransportLayer,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tokio::task::JoinHandle;

/// Why the tunnel is blocking traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    /// Settings are not readable until the device is unlocked
    DeviceLocked,
    /// The tunnel device could not be configured
    TunnelAdapter,
    /// Settings are missing or corrupt
    ReadSettings,
    /// No relay matches the location and obfuscation constraints
    NoRelaysSatisfyingConstraints,
    /// Account number not recognised
    InvalidAccount,
    /// Device key was removed from the account
    DeviceRevoked,
    /// Account has no time left
    AccountExpired,
    /// Any other failure
    Unknown,
}

impl BlockedReason {
    /// Whether the actor should keep retrying in the background.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            BlockedReason::InvalidAccount
                | BlockedReason::DeviceRevoked
                | BlockedReason::AccountExpired
        )
    }
}

/// Everything known about the current connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectionData {
    pub selected_relays: SelectedRelays,
    pub relay_constraints: RelayConstraints,
    /// Device key used for this attempt
    pub current_key: PrivateKey,
    pub interface_addresses: Vec<IpAddressRange>,
    pub dns_servers: Vec<IpAddr>,
    pub network_reachability: NetworkReachability,
    pub connection_attempt_count: u32,
    /// First-hop endpoint after obfuscation
    pub connected_endpoint: SelectedEndpoint,
    pub transport_layer: TransportLayer,
    pub remote_port: u16,
    pub is_post_quantum: bool,
    pub is_daita_enabled: bool,
}

impl ConnectionData {
    pub fn observed(&self) -> ObservedConnectionState {
        ObservedConnectionState {
            selected_relays: self.selected_relays.clone(),
            relay_constraints: self.relay_constraints.clone(),
            network_reachability: self.network_reachability,
            connection_attempt_count: self.connection_attempt_count,
            transport_layer: self.transport_layer,
            remote_port: self.remote_port,
            is_post_quantum: self.is_post_quantum,
            is_daita_enabled: self.is_daita_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NegotiationData {
    pub id: u64,
    /// Set once the first exchange configuration reached the adapter
    pub adapter_started: bool,
}

/// State before entering `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PriorState {
    Initial,
    Connecting,
    Connected,
    Reconnecting,
    NegotiatingEphemeralPeer,
}

/// Aborts the background recovery loop when dropped.
#[derive(Debug)]
pub(crate) struct RecoveryTask(pub JoinHandle<()>);

impl Drop for RecoveryTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
pub(crate) struct BlockedState {
    pub reason: BlockedReason,
    pub prior_state: PriorState,
    pub relay_constraints: Option<RelayConstraints>,
    pub network_reachability: NetworkReachability,
    pub interface_addresses: Vec<IpAddressRange>,
    pub recovery_task: Option<RecoveryTask>,
}

#[derive(Debug)]
pub(crate) enum State {
    Initial,
    Connecting(ConnectionData),
    Connected(ConnectionData),
    Reconnecting(ConnectionData),
    NegotiatingEphemeralPeer(ConnectionData, NegotiationData),
    Disconnecting(ConnectionData),
    Disconnected,
    Error(BlockedState),
}

/// Where a (re)connect should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetState {
    Connecting,
    Reconnecting,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Initial => "initial",
            State::Connecting(_) => "connecting",
            State::Connected(_) => "connected",
            State::Reconnecting(_) => "reconnecting",
            State::NegotiatingEphemeralPeer(..) => "negotiating ephemeral peer",
            State::Disconnecting(_) => "disconnecting",
            State::Disconnected => "disconnected",
            State::Error(_) => "error",
        }
    }

    /// Connection data of any state that has it.
    pub fn connection(&self) -> Option<&ConnectionData> {
        match self {
            State::Connecting(connection)
            | State::Connected(connection)
            | State::Reconnecting(connection)
            | State::NegotiatingEphemeralPeer(connection, _)
            | State::Disconnecting(connection) => Some(connection),
            _ => None,
        }
    }

    pub fn connection_mut(&mut self) -> Option<&mut ConnectionData> {
        match self {
            State::Connecting(connection)
            | State::Connected(connection)
            | State::Reconnecting(connection)
            | State::NegotiatingEphemeralPeer(connection, _)
            | State::Disconnecting(connection) => Some(connection),
            _ => None,
        }
    }

    /// The states a connection attempt can be replaced from.
    pub fn is_connection_family(&self) -> bool {
        matches!(
            self,
            State::Connecting(_)
                | State::Connected(_)
                | State::Reconnecting(_)
                | State::NegotiatingEphemeralPeer(..)
        )
    }

    pub fn target_state_for_reconnect(&self) -> Option<TargetState> {
        match self {
            State::Initial | State::Connecting(_) => Some(TargetState::Connecting),
            State::Connected(_)
            | State::Reconnecting(_)
            | State::NegotiatingEphemeralPeer(..) => Some(TargetState::Reconnecting),
            State::Error(blocked) => match blocked.prior_state {
                PriorState::Initial | PriorState::Connecting => Some(TargetState::Connecting),
                PriorState::Connected
                | PriorState::Reconnecting
                | PriorState::NegotiatingEphemeralPeer => Some(TargetState::Reconnecting),
            },
            State::Disconnecting(_) | State::Disconnected => None,
        }
    }

    pub fn prior_state(&self) -> Option<PriorState> {
        match self {
            State::Initial => Some(PriorState::Initial),
            State::Connecting(_) => Some(PriorState::Connecting),
            State::Connected(_) => Some(PriorState::Connected),
            State::Reconnecting(_) => Some(PriorState::Reconnecting),
            State::NegotiatingEphemeralPeer(..) => Some(PriorState::NegotiatingEphemeralPeer),
            State::Disconnecting(_) | State::Disconnected | State::Error(_) => None,
        }
    }

    pub fn observed(&self) -> ObservedState {
        match self {
            State::Initial => ObservedState::Initial,
            State::Connecting(connection) => ObservedState::Connecting(connection.observed()),
            State::Connected(connection) => ObservedState::Connected(connection.observed()),
            State::Reconnecting(connection) => ObservedState::Reconnecting(connection.observed()),
            State::NegotiatingEphemeralPeer(connection, _) => {
                ObservedState::NegotiatingEphemeralPeer {
                    connection: connection.observed(),
                    exchange: PeerExchangeInfo {
                        is_multihop: connection.selected_relays.is_multihop(),
                        is_post_quantum: connection.is_post_quantum,
                        is_daita_enabled: connection.is_daita_enabled,
                    },
                }
            }
            State::Disconnecting(connection) => {
                ObservedState::Disconnecting(connection.observed())
            }
            State::Disconnected => ObservedState::Disconnected,
            State::Error(blocked) => ObservedState::Error(ObservedBlockedState {
                reason: blocked.reason,
                relay_constraints: blocked.relay_constraints.clone(),
                network_reachability: blocked.network_reachability,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedConnectionState {
    pub selected_relays: SelectedRelays,
    pub relay_constraints: RelayConstraints,
    pub network_reachability: NetworkReachability,
    pub connection_attempt_count: u32,
    pub transport_layer: TransportLayer,
    pub remote_port: u16,
    pub is_post_quantum: bool,
    pub is_daita_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerExchangeInfo {
    pub is_multihop: bool,
    pub is_post_quantum: bool,
    pub is_daita_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedBlockedState {
    pub reason: BlockedReason,
    pub relay_constraints: Option<RelayConstraints>,
    pub network_reachability: NetworkReachability,
}

/// Snapshot of the actor state handed to observers and the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ObservedState {
    Initial,
    Connecting(ObservedConnectionState),
    Connected(ObservedConnectionState),
    Reconnecting(ObservedConnectionState),
    NegotiatingEphemeralPeer {
        connection: ObservedConnectionState,
        exchange: PeerExchangeInfo,
    },
    Disconnecting(ObservedConnectionState),
    Disconnected,
    Error(ObservedBlockedState),
}

impl ObservedState {
    pub fn connection_state(&self) -> Option<&ObservedConnectionState> {
        match self {
            ObservedState::Connecting(connection)
            | ObservedState::Connected(connection)
            | ObservedState::Reconnecting(connection)
            | ObservedState::Disconnecting(connection) => Some(connection),
            ObservedState::NegotiatingEphemeralPeer { connection, .. } => Some(connection),
            ObservedState::Initial | ObservedState::Disconnected | ObservedState::Error(_) => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ObservedState::Connected(_))
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        match self {
            ObservedState::Error(blocked) => Some(blocked.reason),
            _ => None,
        }
    }
}
