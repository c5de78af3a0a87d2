//! Shadowsocks UDP relay.
//!
//! ```text
//!  WireGuard ──▶ 127.0.0.1:N ──▶ ProxySocket ══ AEAD(salt, target, datagram) ══▶ relay:port
//!                                                                                  │
//!                                                        relay forwards to target ◀┘
//! ```
//!
//! Packets are sealed by the `shadowsocks` crate. Relays run `aes-256-gcm`
//! with the well-known password, both configurable in `ObfuscationConfig`.

use crate::Obfuscator;
use crate::error::ObfuscationError;
use crate::forward::{ForwardingTasks, MAX_UDP_SIZE, accept_client, bind_local_socket};
use async_trait::async_trait;
use shadowsocks::config::{ServerConfig, ServerType};
use shadowsocks::context::Context;
use shadowsocks::crypto::CipherKind;
use shadowsocks::relay::socks5::Address;
use shadowsocks::relay::udprelay::ProxySocket;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// AEAD tag length of every supported cipher
const TAG_SIZE: usize = 16;
/// SOCKS address of an IPv4 target
const IPV4_ADDRESS_SIZE: usize = 1 + 4 + 2;

/// Parse a Shadowsocks cipher name such as `aes-256-gcm`.
pub fn parse_cipher(name: &str) -> Result<CipherKind, ObfuscationError> {
    let cipher: CipherKind = name
        .parse()
        .map_err(|_| ObfuscationError::UnknownCipher(name.to_string()))?;
    if !cipher.is_aead() {
        return Err(ObfuscationError::UnknownCipher(name.to_string()));
    }
    Ok(cipher)
}

pub struct Shadowsocks {
    server_config: ServerConfig,
    target_addr: SocketAddr,
    client_socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
}

impl Shadowsocks {
    /// `target_addr` is the WireGuard listener the server forwards to.
    pub async fn new(
        server_addr: SocketAddr,
        target_addr: SocketAddr,
        password: &str,
        cipher: CipherKind,
    ) -> Result<Self, ObfuscationError> {
        let (client_socket, local_endpoint) = bind_local_socket().await?;
        Ok(Self {
            server_config: ServerConfig::new(server_addr, password, cipher),
            target_addr,
            client_socket,
            local_endpoint,
        })
    }
}

#[async_trait]
impl Obfuscator for Shadowsocks {
    fn endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    async fn run(self: Box<Self>) -> Result<(), ObfuscationError> {
        let context = Context::new_shared(ServerType::Local);
        let remote_socket = ProxySocket::connect(context, &self.server_config)
            .await
            .map_err(|e| ObfuscationError::Shadowsocks(e.to_string()))?;
        let remote_socket = Arc::new(remote_socket);
        debug!(
            "Shadowsocks forwarding to {} (target {}, {})",
            self.server_config.addr(),
            self.target_addr,
            self.server_config.method()
        );

        accept_client(&self.client_socket).await?;

        let egress = {
            let client = self.client_socket.clone();
            let remote = remote_socket.clone();
            let target = Address::SocketAddress(self.target_addr);
            async move {
                let mut buffer = vec![0u8; MAX_UDP_SIZE];
                loop {
                    let Ok(len) = client.recv(&mut buffer).await else {
                        return;
                    };
                    if let Err(e) = remote.send(&target, &buffer[..len]).await {
                        debug!("Shadowsocks send failed: {}", e);
                        return;
                    }
                }
            }
        };

        let ingress = {
            let client = self.client_socket.clone();
            async move {
                let mut buffer = vec![0u8; MAX_UDP_SIZE];
                loop {
                    let len = match remote_socket.recv(&mut buffer).await {
                        Ok((len, _source, _)) => len,
                        Err(e) => {
                            trace!("Dropping Shadowsocks packet: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = client.send(&buffer[..len]).await {
                        debug!("Shadowsocks local send failed: {}", e);
                        return;
                    }
                }
            }
        };

        let mut tasks = ForwardingTasks::new(tokio::spawn(egress), tokio::spawn(ingress));
        tasks.wait().await;
        Ok(())
    }

    fn packet_overhead(&self) -> u16 {
        // Salt length equals key length for the AEAD ciphers.
        let overhead = self.server_config.method().key_len() + TAG_SIZE + IPV4_ADDRESS_SIZE;
        u16::try_from(overhead).unwrap_or(u16::MAX)
    }
}
