use std::io;
use std::net::SocketAddr;

/// Obfuscation errors
#[derive(Debug, thiserror::Error)]
pub enum ObfuscationError {
    #[error("Failed to bind local socket: {0}")]
    BindLocal(#[source] io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    ConnectRemote {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to retrieve the local client address: {0}")]
    ClientAddress(#[source] io::Error),

    #[error("Unknown Shadowsocks cipher: {0}")]
    UnknownCipher(String),

    #[error("Shadowsocks relay failed: {0}")]
    Shadowsocks(String),

    #[error("Obfuscation method {0} is not supported")]
    Unsupported(&'static str),
}
