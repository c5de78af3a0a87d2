//! fOS Tunnel Core - packet tunnel control plane
//!
//! Owns the lifecycle of a tunnel connection: start, reconnect, key
//! renegotiation and stop, while a liveness monitor verifies the tunnel is
//! passing traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PacketTunnelActor                        │
//! │                                                               │
//! │  host ──▶ EventChannel ──▶ TaskQueue ──▶ state machine ──┐    │
//! │              ▲   ▲                                       │    │
//! │              │   └── monitor / path / exchange events    │    │
//! │              │                                           ▼    │
//! │              │        watch<ObservedState> ◀──── publish      │
//! └──────────────│────────────────────────────────────────────────┘
//!                │
//!   TunnelAdapter · LivenessMonitor · ProtocolObfuscation ·
//!   EphemeralPeerExchangingPipeline · SettingsReader · RelaySelector
//! ```
//!
//! # Task priority
//!
//! | incoming    | cancels                          |
//! |-------------|----------------------------------|
//! | `stop`      | everything running or queued     |
//! | `reconnect` | running and queued `reconnect`   |
//! | `start`     | nothing                          |
//! | other       | nothing                          |
//!
//! The channel applies the same rules to its backlog: a `stop` drops every
//! pending command and a `reconnect` drops pending reconnects.

mod actor;
mod app_message;
mod collaborators;
mod command;
mod configuration;
mod error;
mod error_mapper;
mod event_channel;
mod negotiation;
mod state;
mod task_queue;

#[cfg(test)]
mod mocks;

pub use actor::{ActorDependencies, PacketTunnelActor};
pub use app_message::{
    ApiRequestProxy, AppMessageError, AppMessageHandler, TunnelProviderMessage,
    TunnelProviderReply,
};
pub use collaborators::{
    DefaultPathObserver, NetworkPathHandler, RelaySelector, SettingsReader, TunnelAdapter,
};
pub use command::{Command, ReconnectReason, StartOptions};
pub use error::{ActorError, ReadSettingsError, RelaySelectorError, TunnelAdapterError};
pub use error_mapper::{BlockedStateErrorMapper, DefaultBlockedStateErrorMapper};
pub use event_channel::EventChannel;
pub use state::{
    BlockedReason, ObservedBlockedState, ObservedConnectionState, ObservedState,
    PeerExchangeInfo,
};
pub use task_queue::{CancellationError, TaskHandle, TaskKind, TaskQueue};
