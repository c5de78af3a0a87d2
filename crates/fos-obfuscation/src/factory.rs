//! Construction of local proxies from a relay's obfuscation method.

use crate::error::ObfuscationError;
use crate::lwo::Lwo;
use crate::shadowsocks::{Shadowsocks, parse_cipher};
use crate::udp_over_tcp::UdpOverTcp;
use crate::Obfuscator;
use async_trait::async_trait;
use fos_tunnel_types::{ObfuscationConfig, ObfuscationMethod, PublicKey};
use std::net::SocketAddr;

/// Everything a proxy needs to reach one relay.
#[derive(Debug, Clone)]
pub struct ObfuscatorSettings {
    pub method: ObfuscationMethod,
    pub server_addr: SocketAddr,
    pub client_public_key: PublicKey,
    pub server_public_key: PublicKey,
}

#[async_trait]
pub trait ObfuscatorFactory: Send + Sync {
    async fn create(
        &self,
        settings: &ObfuscatorSettings,
    ) -> Result<Box<dyn Obfuscator>, ObfuscationError>;
}

/// Builds the proxies shipped in this crate.
#[derive(Debug, Clone, Default)]
pub struct BuiltinObfuscatorFactory {
    config: ObfuscationConfig,
}

impl BuiltinObfuscatorFactory {
    pub fn new(config: ObfuscationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ObfuscatorFactory for BuiltinObfuscatorFactory {
    async fn create(
        &self,
        settings: &ObfuscatorSettings,
    ) -> Result<Box<dyn Obfuscator>, ObfuscationError> {
        match &settings.method {
            ObfuscationMethod::UdpOverTcp => {
                Ok(Box::new(UdpOverTcp::new(settings.server_addr).await?))
            }
            ObfuscationMethod::Lwo => Ok(Box::new(
                Lwo::new(
                    settings.server_addr,
                    settings.client_public_key,
                    settings.server_public_key,
                )
                .await?,
            )),
            ObfuscationMethod::Shadowsocks => {
                let target = SocketAddr::new(
                    settings.server_addr.ip(),
                    self.config.shadowsocks_target_port,
                );
                let cipher = parse_cipher(&self.config.shadowsocks_cipher)?;
                Ok(Box::new(
                    Shadowsocks::new(
                        settings.server_addr,
                        target,
                        &self.config.shadowsocks_password,
                        cipher,
                    )
                    .await?,
                ))
            }
            ObfuscationMethod::Quic { .. } => Err(ObfuscationError::Unsupported("quic")),
            ObfuscationMethod::Off => Err(ObfuscationError::Unsupported("off")),
        }
    }
}
