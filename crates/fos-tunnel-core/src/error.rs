use fos_obfuscation::ObfuscationError;
use fos_tunnel_types::ConfigError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadSettingsError {
    /// Storage is not readable until the device is unlocked
    #[error("Device is locked")]
    DeviceLocked,

    #[error("Settings not found: {0}")]
    NotFound(String),

    #[error("Invalid settings: {0}")]
    Parse(String),

    #[error("Account is invalid")]
    InvalidAccount,

    #[error("Device has been revoked")]
    DeviceRevoked,

    #[error("Account has expired")]
    AccountExpired,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelAdapterError {
    #[error("Invalid adapter configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("Failed to start tunnel: {0}")]
    Start(String),

    #[error("Failed to reconfigure tunnel: {0}")]
    Reconfigure(String),

    #[error("Failed to stop tunnel: {0}")]
    Stop(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelaySelectorError {
    #[error("No relays satisfy the constraints")]
    NoRelaysSatisfyingConstraints,

    #[error("Relay list unavailable: {0}")]
    Unavailable(String),
}

/// Failures while bringing the tunnel up.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    ReadSettings(#[from] ReadSettingsError),

    #[error(transparent)]
    RelaySelector(#[from] RelaySelectorError),

    #[error(transparent)]
    TunnelAdapter(#[from] TunnelAdapterError),

    #[error(transparent)]
    Obfuscation(#[from] ObfuscationError),
}
