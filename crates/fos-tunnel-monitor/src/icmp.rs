//! ICMPv4 pinger over an unprivileged datagram socket.
//!
//! On Linux this needs the process group to be inside
//! `net.ipv4.ping_group_range`. The kernel owns the echo identifier for
//! datagram ICMP sockets, so replies are matched by sequence number and
//! sender only.

use crate::pinger::{
    Pinger, PingerError, PingerReply, PingerSendResult, ReplyHandler, echo_request,
    parse_echo_reply,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Sender identifier passed along with each echo request
pub const DEFAULT_IDENTIFIER: u16 = 757;

/// Socket read buffer size
const BUFFER_SIZE: usize = 65535;

pub struct IcmpPinger {
    identifier: u16,
    sequence_number: u16,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
}

impl IcmpPinger {
    pub fn new() -> Self {
        Self::with_identifier(DEFAULT_IDENTIFIER)
    }

    pub fn with_identifier(identifier: u16) -> Self {
        Self {
            identifier,
            sequence_number: 0,
            socket: None,
            reader: None,
        }
    }

    fn create_socket(interface: Option<&str>) -> Result<UdpSocket, PingerError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
            .map_err(PingerError::CreateSocket)?;

        if let Some(interface) = interface {
            bind_to_interface(&socket, interface)?;
        }

        socket
            .set_nonblocking(true)
            .map_err(PingerError::CreateSocket)?;
        UdpSocket::from_std(socket.into()).map_err(PingerError::CreateSocket)
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new()
    }
}

impl Pinger for IcmpPinger {
    fn open_socket(
        &mut self,
        interface: Option<&str>,
        on_reply: ReplyHandler,
    ) -> Result<(), PingerError> {
        self.close_socket();

        let socket = Arc::new(Self::create_socket(interface)?);
        debug!("Opened ICMP socket (interface: {:?})", interface);

        self.reader = Some(tokio::spawn(read_replies(socket.clone(), on_reply)));
        self.socket = Some(socket);
        Ok(())
    }

    fn close_socket(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.socket.take().is_some() {
            debug!("Closed ICMP socket");
        }
    }

    fn send(&mut self, destination: Ipv4Addr) -> Result<PingerSendResult, PingerError> {
        let socket = self.socket.clone().ok_or(PingerError::ClosedSocket)?;

        self.sequence_number = self.sequence_number.wrapping_add(1);
        let packet = echo_request(self.identifier, self.sequence_number);

        let bytes_sent = socket
            .try_send_to(&packet, SocketAddr::from((destination, 0)))
            .map_err(PingerError::SendPacket)?;

        trace!("Sent echo request #{} to {}", self.sequence_number, destination);
        Ok(PingerSendResult {
            sequence_number: self.sequence_number,
            bytes_sent,
        })
    }
}

impl Drop for IcmpPinger {
    fn drop(&mut self) {
        self.close_socket();
    }
}

async fn read_replies(socket: Arc<UdpSocket>, on_reply: ReplyHandler) {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, sender)) => match parse_echo_reply(&buffer[..len]) {
                Ok(reply) => on_reply(PingerReply::Response {
                    sender: sender.ip(),
                    sequence_number: reply.sequence_number,
                }),
                Err(e) => on_reply(PingerReply::Failure(e)),
            },
            Err(e) => {
                on_reply(PingerReply::Failure(PingerError::ReceivePacket(e)));
                break;
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_interface(socket: &Socket, interface: &str) -> Result<(), PingerError> {
    socket
        .bind_device(Some(interface.as_bytes()))
        .map_err(|source| PingerError::BindInterface {
            interface: interface.to_string(),
            source,
        })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_interface(_socket: &Socket, interface: &str) -> Result<(), PingerError> {
    debug!("Interface binding is not supported here, ignoring {}", interface);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_open_socket() {
        let mut pinger = IcmpPinger::new();
        let result = pinger.send(Ipv4Addr::LOCALHOST);
        assert!(matches!(result, Err(PingerError::ClosedSocket)));
    }

    #[tokio::test]
    async fn test_close_without_open_is_harmless() {
        let mut pinger = IcmpPinger::with_identifier(1);
        pinger.close_socket();
        pinger.close_socket();
        assert!(pinger.socket.is_none());
    }
}
