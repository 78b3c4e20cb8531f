//! # Gateway Connectivity Probe
//!
//! A peer that cannot reach its upstream gateway is useless as a resource
//! host even if the cluster can still gossip with it, so every peer pings
//! its configured gateway on a fixed cadence and folds the verdict into its
//! effective status.
//!
//! Probing uses a raw ICMP socket. Opening one requires CAP_NET_RAW (or
//! root); failure to open it at startup is fatal by design — running blind
//! would mean happily accepting resources while the uplink is dead.
//!
//! A round sends up to three echoes with a one-second timeout each. Any
//! reply makes the round `Up`; only a fully silent round makes it `Down`.
//! The caller compares the verdict against the stored state, so
//! connectivity only changes when a round disagrees with it.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{PROBE_ATTEMPTS, PROBE_TIMEOUT};
use crate::value::Status;

/// ICMP type for an echo request.
pub const ECHO_REQUEST: u8 = 8;
/// ICMP type for an echo reply.
pub const ECHO_REPLY: u8 = 0;

/// Payload bytes carried by each echo.
const PAYLOAD_LEN: usize = 55;

/// Why probing could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("ICMP echoes need a raw socket: run as root or grant CAP_NET_RAW")]
    PermissionDenied(#[source] io::Error),
    #[error("failed to set up the ICMP socket: {0}")]
    Setup(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Packet codec
// ---------------------------------------------------------------------------

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds an echo request: 8-byte ICMP header plus a fixed ramp payload.
pub fn pack_echo(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + PAYLOAD_LEN);
    packet.extend_from_slice(&[ECHO_REQUEST, 0, 0, 0]);
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    for i in 0..PAYLOAD_LEN {
        packet.push(0x42u8.wrapping_add(i as u8));
    }
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Parses `(type, ident, seq)` out of a received datagram. Raw ICMP sockets
/// deliver the IP header too, so the ICMP header sits past the IHL.
pub fn unpack_echo(datagram: &[u8]) -> Option<(u8, u16, u16)> {
    let ihl = usize::from(datagram.first()? & 0x0f) * 4;
    let header = datagram.get(ihl..ihl + 8)?;
    let kind = header[0];
    let ident = u16::from_be_bytes([header[4], header[5]]);
    let seq = u16::from_be_bytes([header[6], header[7]]);
    Some((kind, ident, seq))
}

// ---------------------------------------------------------------------------
// Pinger
// ---------------------------------------------------------------------------

/// Sends echo requests to the gateway and waits for matching replies.
pub struct Pinger {
    socket: UdpSocket,
    gateway: Ipv4Addr,
    ident: u16,
    seq: AtomicU16,
}

impl Pinger {
    /// Opens the raw ICMP socket. Must run inside the tokio runtime; fails
    /// fast on missing privileges.
    pub fn new(gateway: Ipv4Addr) -> Result<Pinger, ProbeError> {
        let socket =
            Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    ProbeError::PermissionDenied(e)
                } else {
                    ProbeError::Setup(e)
                }
            })?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std::net::UdpSocket::from(socket))?;
        Ok(Pinger {
            socket,
            gateway,
            ident: (std::process::id() & 0xffff) as u16,
            seq: AtomicU16::new(0),
        })
    }

    /// One echo: send, then wait up to `timeout` for the matching reply.
    pub async fn check_connectivity(&self, timeout: Duration) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let packet = pack_echo(self.ident, seq);
        // The port is meaningless on a raw socket; the kernel only routes on
        // the address.
        let dest = SocketAddr::V4(SocketAddrV4::new(self.gateway, 1));
        if let Err(e) = self.socket.send_to(&packet, dest).await {
            warn!(gateway = %self.gateway, "echo send failed: {}", e);
            return false;
        }

        let wait_for_reply = async {
            let mut buf = [0u8; 2048];
            loop {
                match self.socket.recv_from(&mut buf).await {
                    Ok((len, _)) => {
                        // The raw socket sees every inbound ICMP packet on
                        // the host; skip anything that is not our reply.
                        if let Some((kind, ident, reply_seq)) = unpack_echo(&buf[..len]) {
                            if kind == ECHO_REPLY && ident == self.ident && reply_seq == seq {
                                return true;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("echo recv failed: {}", e);
                        return false;
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait_for_reply)
            .await
            .unwrap_or(false)
    }

    /// One probe round: the gateway is up if any echo comes back.
    pub async fn probe_round(&self) -> Status {
        for attempt in 1..=PROBE_ATTEMPTS {
            if self.check_connectivity(PROBE_TIMEOUT).await {
                return Status::Up;
            }
            debug!(attempt, gateway = %self.gateway, "echo timed out");
        }
        Status::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_echo_has_a_valid_checksum() {
        let packet = pack_echo(0x1234, 7);
        // Re-running the checksum over a packet that embeds its own checksum
        // folds to zero — the classic validity check.
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn checksum_handles_odd_lengths() {
        // Must not panic and must still validate after embedding.
        let data = [0x08, 0x00, 0x00, 0x00, 0x42];
        let sum = checksum(&data);
        let mut with_sum = data;
        with_sum[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&with_sum), 0);
    }

    #[test]
    fn unpack_reads_past_the_ip_header() {
        let echo = pack_echo(0xbeef, 42);
        // Minimal 20-byte IPv4 header: version 4, IHL 5.
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram.extend_from_slice(&echo);

        let (kind, ident, seq) = unpack_echo(&datagram).expect("well-formed datagram");
        assert_eq!(kind, ECHO_REQUEST);
        assert_eq!(ident, 0xbeef);
        assert_eq!(seq, 42);
    }

    #[test]
    fn unpack_honors_ip_options() {
        let echo = pack_echo(1, 2);
        // IHL 6 → 24-byte header (one option word).
        let mut datagram = vec![0u8; 24];
        datagram[0] = 0x46;
        datagram.extend_from_slice(&echo);
        let (kind, ident, seq) = unpack_echo(&datagram).expect("well-formed datagram");
        assert_eq!((kind, ident, seq), (ECHO_REQUEST, 1, 2));
    }

    #[test]
    fn unpack_rejects_truncated_datagrams() {
        assert!(unpack_echo(&[]).is_none());
        assert!(unpack_echo(&[0x45; 12]).is_none());
    }
}
