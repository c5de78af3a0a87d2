//! Pinger abstraction and ICMP echo wire format.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// ICMP message types
pub(crate) const ICMP_ECHO_REPLY: u8 = 0;
pub(crate) const ICMP_ECHO_REQUEST: u8 = 8;

pub(crate) const ICMP_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Result of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingerSendResult {
    pub sequence_number: u16,
    pub bytes_sent: usize,
}

/// Delivered to the [`ReplyHandler`] for every datagram read from the socket.
#[derive(Debug)]
pub enum PingerReply {
    Response {
        sender: IpAddr,
        sequence_number: u16,
    },
    Failure(PingerError),
}

pub type ReplyHandler = Arc<dyn Fn(PingerReply) + Send + Sync>;

/// Sends sequenced echo requests and reports replies.
///
/// Replies are delivered asynchronously from a reader task and never from
/// inside [`Pinger::send`], so callers may hold locks while sending.
pub trait Pinger: Send {
    /// Open the socket, optionally bound to an interface. Closes any
    /// previously opened socket.
    fn open_socket(
        &mut self,
        interface: Option<&str>,
        on_reply: ReplyHandler,
    ) -> Result<(), PingerError>;

    fn close_socket(&mut self);

    /// Send the next echo request. Sequence numbers wrap at `u16::MAX`.
    fn send(&mut self, destination: Ipv4Addr) -> Result<PingerSendResult, PingerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedResponseReason {
    #[error("IPv4 packet too small")]
    Ipv4PacketTooSmall,

    #[error("ICMP header too small")]
    IcmpHeaderTooSmall,

    #[error("Invalid IP version")]
    InvalidIpVersion,

    #[error("Not an echo reply")]
    InvalidEchoReplyType,

    #[error("Checksum mismatch (computed {computed:#06x}, received {received:#06x})")]
    ChecksumMismatch { computed: u16, received: u16 },
}

/// Pinger errors
#[derive(Debug, thiserror::Error)]
pub enum PingerError {
    #[error("Failed to create socket: {0}")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to bind socket to {interface}: {source}")]
    BindInterface {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Socket is closed")]
    ClosedSocket,

    #[error("Failed to send packet: {0}")]
    SendPacket(#[source] io::Error),

    #[error("Failed to receive packet: {0}")]
    ReceivePacket(#[source] io::Error),

    #[error("Malformed response: {0}")]
    MalformedResponse(MalformedResponseReason),
}

/// RFC 1071 internet checksum
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub(crate) fn echo_request(identifier: u16, sequence_number: u16) -> [u8; ICMP_HEADER_LEN] {
    let mut packet = [0u8; ICMP_HEADER_LEN];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence_number.to_be_bytes());
    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Parsed echo reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EchoReply {
    pub identifier: u16,
    pub sequence_number: u16,
}

/// Parse an echo reply, with or without a leading IPv4 header.
///
/// Linux datagram ICMP sockets deliver the bare ICMP message; BSD-derived
/// stacks prepend the IP header.
pub(crate) fn parse_echo_reply(buffer: &[u8]) -> Result<EchoReply, PingerError> {
    let malformed = PingerError::MalformedResponse;

    let icmp = match buffer.first().map(|b| b >> 4) {
        Some(4) => {
            if buffer.len() < IPV4_MIN_HEADER_LEN {
                return Err(malformed(MalformedResponseReason::Ipv4PacketTooSmall));
            }
            let header_len = usize::from(buffer[0] & 0x0f) * 4;
            buffer
                .get(header_len..)
                .ok_or(malformed(MalformedResponseReason::Ipv4PacketTooSmall))?
        }
        Some(0) => buffer,
        Some(_) => return Err(malformed(MalformedResponseReason::InvalidIpVersion)),
        None => return Err(malformed(MalformedResponseReason::IcmpHeaderTooSmall)),
    };

    if icmp.len() < ICMP_HEADER_LEN {
        return Err(malformed(MalformedResponseReason::IcmpHeaderTooSmall));
    }
    if icmp[0] != ICMP_ECHO_REPLY {
        return Err(malformed(MalformedResponseReason::InvalidEchoReplyType));
    }

    let received = u16::from_be_bytes([icmp[2], icmp[3]]);
    let mut zeroed = icmp.to_vec();
    zeroed[2] = 0;
    zeroed[3] = 0;
    let computed = internet_checksum(&zeroed);
    if computed != received {
        return Err(malformed(MalformedResponseReason::ChecksumMismatch {
            computed,
            received,
        }));
    }

    Ok(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence_number: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}
