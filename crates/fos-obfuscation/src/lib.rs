//! fOS Obfuscation - local proxies that disguise WireGuard traffic
//!
//! # Architecture
//!
//! ```text
//!  WireGuard ──UDP──▶ 127.0.0.1:<port> ──(disguised)──▶ relay
//!            ◀──UDP── local proxy task ◀──(disguised)──
//! ```
//!
//! [`ProtocolObfuscator::obfuscate`] turns a relay endpoint into a loopback
//! endpoint served by one of the proxies below, and owns the proxy task until
//! the next call to `obfuscate` or `stop`.
//!
//! | method | transport | wire format |
//! |---|---|---|
//! | `udp_over_tcp` | TCP | u16 length-prefixed datagrams |
//! | `lwo` | UDP | WireGuard header XOR-masked with a public key |
//! | `shadowsocks` | UDP | Shadowsocks AEAD datagrams (`aes-256-gcm` by default) |

mod error;
mod factory;
mod forward;
mod lwo;
mod obfuscator;
mod shadowsocks;
mod udp_over_tcp;

pub use error::ObfuscationError;
pub use factory::{BuiltinObfuscatorFactory, ObfuscatorFactory, ObfuscatorSettings};
pub use lwo::Lwo;
pub use obfuscator::{ProtocolObfuscation, ProtocolObfuscator};
pub use shadowsocks::{Shadowsocks, parse_cipher};
pub use udp_over_tcp::UdpOverTcp;

use async_trait::async_trait;
use std::net::SocketAddr;

/// A running local proxy.
#[async_trait]
pub trait Obfuscator: Send {
    /// Loopback address WireGuard should send to
    fn endpoint(&self) -> SocketAddr;

    /// Forward traffic until an error occurs or the future is dropped.
    async fn run(self: Box<Self>) -> Result<(), ObfuscationError>;

    /// Extra bytes added per packet, for MTU calculations
    fn packet_overhead(&self) -> u16;
}
