//! fOS Ephemeral Peer - post-quantum and DAITA key exchange with relays
//!
//! # Single hop
//!
//! ```text
//!  #1 exit: device key, gateway only ──▶ negotiate(exit) ──▶ #2 exit: ephemeral key + PSK + DAITA, all routes
//! ```
//!
//! # Multi hop
//!
//! ```text
//!  #1 entry+exit: device key, gateway only
//!  ──▶ negotiate(entry) ──▶ #2 entry: ephemeral key + PSK + DAITA, routes to exit endpoint
//!  ──▶ negotiate(exit)  ──▶ #3 exit: ephemeral key + PSK, all routes
//! ```
//!
//! Every reconfiguration is handed to an [`EphemeralPeerExchangeHandler`] and
//! awaited, so negotiation with the next hop only starts once the previous
//! configuration is live.

mod configuration;
mod multi_hop;
mod negotiator;
mod pipeline;
mod single_hop;

pub use configuration::{
    EphemeralPeerConfiguration, EphemeralPeerExchangeHandler, EphemeralPeerNegotiationState,
    EphemeralPeerRelayConfiguration, ExchangeOutcome,
};
pub use multi_hop::MultiHopEphemeralPeerExchanger;
pub use negotiator::{
    CONFIG_SERVICE_PORT, EphemeralPeerNegotiator, EphemeralPeerReceiver, NegotiatedPeer,
    NegotiationError, NegotiationRequest,
};
pub use pipeline::{EphemeralPeerExchangingPipeline, ExchangeParameters};
pub use single_hop::SingleHopEphemeralPeerExchanger;
