//! Settings read from a JSON file on every (re)connect.
//!
//! ```json
//! {
//!   "private_key": "...",
//!   "interface_addresses": ["10.64.0.2/32"],
//!   "quantum_resistance": "on",
//!   "account": "active"
//! }
//! ```

use async_trait::async_trait;
use fos_tunnel_core::{ReadSettingsError, SettingsReader};
use fos_tunnel_types::Settings;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AccountStatus {
    #[default]
    Active,
    Expired,
    Revoked,
    Invalid,
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(flatten)]
    settings: Settings,
    #[serde(default)]
    account: AccountStatus,
}

fn parse_settings(content: &str) -> Result<Settings, ReadSettingsError> {
    let file: SettingsFile =
        serde_json::from_str(content).map_err(|e| ReadSettingsError::Parse(e.to_string()))?;
    match file.account {
        AccountStatus::Active => Ok(file.settings),
        AccountStatus::Expired => Err(ReadSettingsError::AccountExpired),
        AccountStatus::Revoked => Err(ReadSettingsError::DeviceRevoked),
        AccountStatus::Invalid => Err(ReadSettingsError::InvalidAccount),
    }
}

pub struct FileSettingsReader {
    path: PathBuf,
}

impl FileSettingsReader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SettingsReader for FileSettingsReader {
    async fn read(&self) -> Result<Settings, ReadSettingsError> {
        debug!("Reading settings from {}", self.path.display());
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                // Storage not readable yet
                io::ErrorKind::PermissionDenied => ReadSettingsError::DeviceLocked,
                _ => ReadSettingsError::NotFound(format!("{}: {}", self.path.display(), e)),
            })?;
        parse_settings(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_tunnel_types::{PrivateKey, QuantumResistance};

    fn json(extra: &str) -> String {
        format!(
            r#"{{"private_key":"{}","interface_addresses":["10.64.0.2/32"]{}}}"#,
            PrivateKey::generate().to_base64(),
            extra
        )
    }

    #[test]
    fn test_parse_active_settings() {
        let settings = parse_settings(&json(r#","quantum_resistance":"on""#)).unwrap();
        assert_eq!(settings.quantum_resistance, QuantumResistance::On);
        assert_eq!(settings.interface_addresses.len(), 1);
    }

    #[test]
    fn test_account_status_maps_to_errors() {
        assert!(matches!(
            parse_settings(&json(r#","account":"expired""#)),
            Err(ReadSettingsError::AccountExpired)
        ));
        assert!(matches!(
            parse_settings(&json(r#","account":"revoked""#)),
            Err(ReadSettingsError::DeviceRevoked)
        ));
        assert!(matches!(
            parse_settings(&json(r#","account":"invalid""#)),
            Err(ReadSettingsError::InvalidAccount)
        ));
    }

    #[test]
    fn test_malformed_settings() {
        assert!(matches!(
            parse_settings("{\"private_key\":"),
            Err(ReadSettingsError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let reader = FileSettingsReader::new(PathBuf::from("/nonexistent/fos-tunnel/settings.json"));
        assert!(matches!(
            reader.read().await,
            Err(ReadSettingsError::NotFound(_))
        ));
    }
}
