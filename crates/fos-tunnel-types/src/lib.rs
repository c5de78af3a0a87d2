//! fOS Tunnel Types
//!
//! Plain data shared by every layer of the packet tunnel: WireGuard keys,
//! relays and their endpoints, user settings, the configuration handed to the
//! tunnel adapter, and timing configuration.
//!
//! Nothing in here performs I/O apart from [`TunnelConfig::load`].

mod config;
mod keys;
mod net;
mod relay;
mod settings;
mod timings;

pub use config::{
    ConfigError, DaitaParameters, HopConfiguration, PeerConfig, TunnelAdapterConfiguration,
};
pub use keys::{KeyError, KeyPair, PreSharedKey, PrivateKey, PublicKey};
pub use net::{IpAddressRange, NetworkPath, NetworkReachability, PathStatus, TunnelStats};
pub use relay::{
    Location, NextRelays, ObfuscationMethod, SelectedEndpoint, SelectedRelay, SelectedRelays,
    TransportLayer,
};
pub use settings::{
    DaitaSettings, MultihopState, QuantumResistance, RelayConstraints, Settings,
};
pub use timings::{
    ActorTimings, NegotiationTimings, ObfuscationConfig, TunnelConfig, TunnelMonitorTimings,
};
