//! Lightweight WireGuard Obfuscation
//!
//! Only the WireGuard header is touched: it is XOR-masked with the receiving
//! side's public key, and the first reserved byte is replaced with a random
//! value that has its high bit set. Payloads pass through unchanged.

use crate::Obfuscator;
use crate::error::ObfuscationError;
use crate::forward::{ForwardingTasks, MAX_UDP_SIZE, accept_client, bind_local_socket};
use async_trait::async_trait;
use fos_tunnel_types::PublicKey;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

// WireGuard message types and the header length masked for each
const HANDSHAKE_INIT: u8 = 1;
const HANDSHAKE_RESP: u8 = 2;
const COOKIE_REPLY: u8 = 3;
const DATA: u8 = 4;

const HANDSHAKE_INIT_SIZE: usize = 148;
const HANDSHAKE_RESP_SIZE: usize = 92;
const COOKIE_REPLY_SIZE: usize = 64;
const DATA_HEADER_SIZE: usize = 32;

/// Marks a header as obfuscated
const OBFUSCATION_BIT: u8 = 0b1000_0000;

pub struct Lwo {
    server_addr: SocketAddr,
    /// Key masking headers we receive
    rx_key: PublicKey,
    /// Key masking headers we send
    tx_key: PublicKey,
    client_socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
}

impl Lwo {
    pub async fn new(
        server_addr: SocketAddr,
        client_public_key: PublicKey,
        server_public_key: PublicKey,
    ) -> Result<Self, ObfuscationError> {
        let (client_socket, local_endpoint) = bind_local_socket().await?;
        Ok(Self {
            server_addr,
            rx_key: client_public_key,
            tx_key: server_public_key,
            client_socket,
            local_endpoint,
        })
    }
}

#[async_trait]
impl Obfuscator for Lwo {
    fn endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    async fn run(self: Box<Self>) -> Result<(), ObfuscationError> {
        let bind_addr: SocketAddr = if self.server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let connect_error = |source| ObfuscationError::ConnectRemote {
            addr: self.server_addr,
            source,
        };
        let remote_socket = UdpSocket::bind(bind_addr).await.map_err(connect_error)?;
        remote_socket
            .connect(self.server_addr)
            .await
            .map_err(connect_error)?;
        let remote_socket = Arc::new(remote_socket);
        debug!("LWO forwarding to {}", self.server_addr);

        accept_client(&self.client_socket).await?;

        let tx_key = self.tx_key;
        let rx_key = self.rx_key;
        let mut rng = StdRng::from_entropy();

        let mut tasks = ForwardingTasks::new(
            tokio::spawn(relay(
                self.client_socket.clone(),
                remote_socket.clone(),
                move |packet| obfuscate(&mut rng, packet, tx_key.as_bytes()),
            )),
            tokio::spawn(relay(
                remote_socket,
                self.client_socket.clone(),
                move |packet| deobfuscate(packet, rx_key.as_bytes()),
            )),
        );
        tasks.wait().await;
        Ok(())
    }

    fn packet_overhead(&self) -> u16 {
        0
    }
}

async fn relay(
    read_socket: Arc<UdpSocket>,
    write_socket: Arc<UdpSocket>,
    mut transform: impl FnMut(&mut [u8]) + Send,
) {
    let mut buffer = vec![0u8; MAX_UDP_SIZE];
    loop {
        let len = match read_socket.recv(&mut buffer).await {
            Ok(len) => len,
            Err(e) => {
                debug!("LWO receive failed: {}", e);
                return;
            }
        };
        transform(&mut buffer[..len]);
        if let Err(e) = write_socket.send(&buffer[..len]).await {
            debug!("LWO send failed: {}", e);
            return;
        }
    }
}

pub(crate) fn obfuscate(rng: &mut impl RngCore, packet: &mut [u8], key: &[u8; 32]) {
    let Some(header) = header_mut(packet, 0) else {
        return;
    };
    xor_bytes(header, key);
    header[1] = (rng.next_u32() as u8) | OBFUSCATION_BIT;
}

pub(crate) fn deobfuscate(packet: &mut [u8], key: &[u8; 32]) {
    let Some(header) = header_mut(packet, key[0]) else {
        return;
    };
    if header[1] & OBFUSCATION_BIT == 0 {
        warn!("Dropping header transform for non-obfuscated packet");
        return;
    }
    xor_bytes(header, key);
    header[1] = 0;
}

/// The header to mask, identified by the (possibly masked) message type.
fn header_mut(packet: &mut [u8], key_byte: u8) -> Option<&mut [u8]> {
    let &message_type = packet.first()?;
    match message_type ^ key_byte {
        HANDSHAKE_INIT => packet.get_mut(..HANDSHAKE_INIT_SIZE),
        HANDSHAKE_RESP => packet.get_mut(..HANDSHAKE_RESP_SIZE),
        COOKIE_REPLY => packet.get_mut(..COOKIE_REPLY_SIZE),
        DATA => packet.get_mut(..DATA_HEADER_SIZE),
        _ => None,
    }
}

fn xor_bytes(data: &mut [u8], key: &[u8; 32]) {
    for (byte, k) in data.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet() -> Vec<u8> {
        let mut packet = vec![0u8; DATA_HEADER_SIZE + 100];
        packet[0] = DATA;
        rand::thread_rng().fill_bytes(&mut packet[DATA_HEADER_SIZE..]);
        packet
    }

    #[test]
    fn test_only_header_is_masked() {
        let key = [0xefu8; 32];
        let original = data_packet();
        let mut packet = original.clone();

        obfuscate(&mut StdRng::seed_from_u64(7), &mut packet, &key);

        assert_ne!(packet[..DATA_HEADER_SIZE], original[..DATA_HEADER_SIZE]);
        assert_eq!(packet[DATA_HEADER_SIZE..], original[DATA_HEADER_SIZE..]);
        assert_ne!(packet[1] & OBFUSCATION_BIT, 0);

        deobfuscate(&mut packet, &key);
        assert_eq!(packet, original);
    }

    #[test]
    fn test_unknown_message_type_is_untouched() {
        let key = [0x11u8; 32];
        let mut packet = vec![9u8; 40];
        obfuscate(&mut StdRng::seed_from_u64(1), &mut packet, &key);
        assert_eq!(packet, vec![9u8; 40]);
    }

    #[test]
    fn test_truncated_handshake_is_untouched() {
        let key = [0x22u8; 32];
        let mut packet = vec![0u8; 10];
        packet[0] = HANDSHAKE_INIT;
        let original = packet.clone();
        obfuscate(&mut StdRng::seed_from_u64(1), &mut packet, &key);
        assert_eq!(packet, original);
    }
}
