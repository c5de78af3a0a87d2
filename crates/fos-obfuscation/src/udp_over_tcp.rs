//! UDP over TCP
//!
//! Each datagram from WireGuard is written to a TCP stream behind a
//! big-endian `u16` length prefix; frames read from the stream are unpacked
//! and sent back as datagrams.

use crate::Obfuscator;
use crate::error::ObfuscationError;
use crate::forward::{ForwardingTasks, MAX_UDP_SIZE, accept_client, bind_local_socket};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const LENGTH_PREFIX_SIZE: usize = 2;

/// TCP header minus UDP header plus the length prefix
const PACKET_OVERHEAD: u16 = 20 - 8 + LENGTH_PREFIX_SIZE as u16;

pub struct UdpOverTcp {
    server_addr: SocketAddr,
    client_socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
}

impl UdpOverTcp {
    pub async fn new(server_addr: SocketAddr) -> Result<Self, ObfuscationError> {
        let (client_socket, local_endpoint) = bind_local_socket().await?;
        Ok(Self {
            server_addr,
            client_socket,
            local_endpoint,
        })
    }
}

#[async_trait]
impl Obfuscator for UdpOverTcp {
    fn endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    async fn run(self: Box<Self>) -> Result<(), ObfuscationError> {
        let stream = TcpStream::connect(self.server_addr)
            .await
            .map_err(|source| ObfuscationError::ConnectRemote {
                addr: self.server_addr,
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        debug!("Connected to {} over TCP", self.server_addr);

        accept_client(&self.client_socket).await?;

        let (reader, writer) = stream.into_split();
        let mut tasks = ForwardingTasks::new(
            tokio::spawn(udp_to_tcp(self.client_socket.clone(), writer)),
            tokio::spawn(tcp_to_udp(reader, self.client_socket.clone())),
        );
        tasks.wait().await;
        Ok(())
    }

    fn packet_overhead(&self) -> u16 {
        PACKET_OVERHEAD
    }
}

async fn udp_to_tcp(socket: Arc<UdpSocket>, mut writer: OwnedWriteHalf) {
    let mut buffer = vec![0u8; LENGTH_PREFIX_SIZE + MAX_UDP_SIZE];
    loop {
        let len = match socket.recv(&mut buffer[LENGTH_PREFIX_SIZE..]).await {
            Ok(len) => len,
            Err(e) => {
                debug!("UDP receive failed: {}", e);
                return;
            }
        };
        // The buffer bounds the datagram to u16::MAX bytes.
        buffer[..LENGTH_PREFIX_SIZE].copy_from_slice(&(len as u16).to_be_bytes());
        if let Err(e) = writer.write_all(&buffer[..LENGTH_PREFIX_SIZE + len]).await {
            debug!("TCP write failed: {}", e);
            return;
        }
    }
}

async fn tcp_to_udp(mut reader: OwnedReadHalf, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; MAX_UDP_SIZE];
    loop {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        if let Err(e) = reader.read_exact(&mut prefix).await {
            debug!("TCP stream closed: {}", e);
            return;
        }
        let len = usize::from(u16::from_be_bytes(prefix));
        if let Err(e) = reader.read_exact(&mut buffer[..len]).await {
            debug!("TCP stream closed mid-frame: {}", e);
            return;
        }
        if let Err(e) = socket.send(&buffer[..len]).await {
            debug!("UDP send failed: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_datagrams_are_length_prefixed() {
        let relay = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let obfuscator = Box::new(UdpOverTcp::new(relay.local_addr().unwrap()).await.unwrap());
        let local = obfuscator.endpoint();
        let proxy = tokio::spawn(obfuscator.run());

        let wireguard = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        wireguard.connect(local).await.unwrap();
        wireguard.send(b"handshake").await.unwrap();

        let (mut stream, _) = relay.accept().await.unwrap();
        let mut frame = [0u8; 11];
        stream.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..2], &9u16.to_be_bytes());
        assert_eq!(&frame[2..], b"handshake");

        stream.write_all(&[0, 5, b'r', b'e', b'p', b'l', b'y']).await.unwrap();
        let mut reply = [0u8; 16];
        let len = wireguard.recv(&mut reply).await.unwrap();
        assert_eq!(&reply[..len], b"reply");

        proxy.abort();
    }
}
