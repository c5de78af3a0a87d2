//! Interfaces to the platform around the actor.

use crate::error::{ReadSettingsError, RelaySelectorError, TunnelAdapterError};
use async_trait::async_trait;
use fos_tunnel_types::{
    NetworkPath, RelayConstraints, SelectedRelays, Settings, TunnelAdapterConfiguration,
};
use std::sync::Arc;

#[async_trait]
pub trait SettingsReader: Send + Sync {
    async fn read(&self) -> Result<Settings, ReadSettingsError>;
}

/// The WireGuard device.
#[async_trait]
pub trait TunnelAdapter: Send + Sync {
    /// Bring the tunnel up with `configuration`, replacing any running one.
    async fn start(&self, configuration: TunnelAdapterConfiguration)
    -> Result<(), TunnelAdapterError>;

    /// Update peers of a running tunnel.
    async fn reconfigure(
        &self,
        configuration: TunnelAdapterConfiguration,
    ) -> Result<(), TunnelAdapterError>;

    async fn stop(&self) -> Result<(), TunnelAdapterError>;
}

pub type NetworkPathHandler = Arc<dyn Fn(NetworkPath) + Send + Sync>;

/// Source of default route changes.
pub trait DefaultPathObserver: Send + Sync {
    fn current_path(&self) -> Option<NetworkPath>;

    fn start(&self, handler: NetworkPathHandler);

    fn stop(&self);
}

pub trait RelaySelector: Send + Sync {
    fn select_relays(
        &self,
        constraints: &RelayConstraints,
        connection_attempt_count: u32,
        multihop: bool,
    ) -> Result<SelectedRelays, RelaySelectorError>;
}
