//! fOS Tunnel Monitor
//!
//! Detects whether a WireGuard tunnel is actually passing traffic.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!  start ───▶│        TunnelMonitor         │───▶ ConnectionEstablished
//!  stop  ───▶│  timer ─▶ TunnelMonitorState │───▶ ConnectionLost
//!  path  ───▶│     ▲          │ verdict     │
//!            └─────│──────────│─────────────┘
//!                  │ reply    ▼ send
//!            ┌──────────────────────────────┐
//!            │   Pinger (ICMP over tunnel)  │
//!            └──────────────────────────────┘
//! ```
//!
//! [`TunnelMonitorState`] is a pure evaluator: every decision is a function of
//! its fields and the `now` passed in, so it can be tested without time
//! passing. [`TunnelMonitor`] owns the timer, the pinger, and the device
//! statistics source, and turns verdicts into actions and events.

mod icmp;
mod monitor;
mod pinger;
mod state;

pub use icmp::IcmpPinger;
pub use monitor::{
    LivenessMonitor, TunnelDeviceInfo, TunnelMonitor, TunnelMonitorEvent,
    TunnelMonitorEventHandler,
};
pub use pinger::{
    MalformedResponseReason, Pinger, PingerError, PingerReply, PingerSendResult, ReplyHandler,
};
pub use state::{ConnectionEvaluation, PingStats, TunnelMonitorConnectionState, TunnelMonitorState};
