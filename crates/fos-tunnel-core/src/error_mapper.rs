use crate::error::{ActorError, ReadSettingsError, RelaySelectorError};
use crate::state::BlockedReason;

/// Classifies failures into the reason shown while the tunnel is blocked.
pub trait BlockedStateErrorMapper: Send + Sync {
    fn map(&self, error: &ActorError) -> BlockedReason;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBlockedStateErrorMapper;

impl BlockedStateErrorMapper for DefaultBlockedStateErrorMapper {
    fn map(&self, error: &ActorError) -> BlockedReason {
        match error {
            ActorError::ReadSettings(e) => match e {
                ReadSettingsError::DeviceLocked => BlockedReason::DeviceLocked,
                ReadSettingsError::InvalidAccount => BlockedReason::InvalidAccount,
                ReadSettingsError::DeviceRevoked => BlockedReason::DeviceRevoked,
                ReadSettingsError::AccountExpired => BlockedReason::AccountExpired,
                ReadSettingsError::NotFound(_) | ReadSettingsError::Parse(_) => {
                    BlockedReason::ReadSettings
                }
            },
            ActorError::RelaySelector(RelaySelectorError::NoRelaysSatisfyingConstraints) => {
                BlockedReason::NoRelaysSatisfyingConstraints
            }
            ActorError::RelaySelector(RelaySelectorError::Unavailable(_)) => BlockedReason::Unknown,
            ActorError::TunnelAdapter(_) => BlockedReason::TunnelAdapter,
            ActorError::Obfuscation(_) => BlockedReason::Unknown,
        }
    }
}
