//! Plumbing shared by the local proxies.

use crate::error::ObfuscationError;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Largest datagram the proxies forward
pub(crate) const MAX_UDP_SIZE: usize = u16::MAX as usize;

/// Bind the loopback socket WireGuard will talk to.
pub(crate) async fn bind_local_socket() -> Result<(Arc<UdpSocket>, SocketAddr), ObfuscationError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(ObfuscationError::BindLocal)?;
    let local_endpoint = socket.local_addr().map_err(ObfuscationError::BindLocal)?;
    Ok((Arc::new(socket), local_endpoint))
}

/// Wait for WireGuard's first datagram and lock the local socket to its sender.
pub(crate) async fn accept_client(socket: &UdpSocket) -> Result<SocketAddr, ObfuscationError> {
    let client_addr = socket
        .peek_sender()
        .await
        .map_err(ObfuscationError::ClientAddress)?;
    socket
        .connect(client_addr)
        .await
        .map_err(ObfuscationError::ClientAddress)?;
    debug!("Local client connected from {}", client_addr);
    Ok(client_addr)
}

/// Egress and ingress tasks of one proxy, aborted on drop.
pub(crate) struct ForwardingTasks {
    send: JoinHandle<()>,
    recv: JoinHandle<()>,
}

impl ForwardingTasks {
    pub(crate) fn new(send: JoinHandle<()>, recv: JoinHandle<()>) -> Self {
        Self { send, recv }
    }

    /// Resolves when either direction stops.
    pub(crate) async fn wait(&mut self) {
        tokio::select! {
            _ = &mut self.send => trace!("Egress task finished"),
            _ = &mut self.recv => trace!("Ingress task finished"),
        }
    }
}

impl Drop for ForwardingTasks {
    fn drop(&mut self) {
        self.send.abort();
        self.recv.abort();
    }
}
