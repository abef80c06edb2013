//! Raw IPv4 sockets with TCP's protocol number.
//!
//! The kernel adds the IPv4 header on transmit and hands back whole IPv4
//! datagrams on receive, so received packets are split here before they
//! reach the TCP decoder.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use log::trace;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::probe::{PacketSource, ProbeError, RawChannel, ReceivedPacket};

const RECV_BUFFER_LEN: usize = 4096;
const MIN_IPV4_HEADER_LEN: usize = 20;
// A zero SO_RCVTIMEO blocks forever
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

fn open_bound(local: Ipv4Addr) -> Result<Socket, ProbeError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP)).map_err(ProbeError::SocketOpen)?;
    socket
        .bind(&SockAddr::from(SocketAddrV4::new(local, 0)))
        .map_err(|source| ProbeError::Bind { addr: local, source })?;
    Ok(socket)
}

/// Split a received IPv4 datagram into its source address and TCP bytes.
/// Anything that is not a TCP-over-IPv4 datagram yields `None`.
pub fn split_ipv4(datagram: &[u8]) -> Option<ReceivedPacket> {
    let ip = Ipv4Packet::new(datagram)?;
    if ip.get_version() != 4 || ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }

    let header_len = ip.get_header_length() as usize * 4;
    if header_len < MIN_IPV4_HEADER_LEN || header_len > datagram.len() {
        return None;
    }

    Some(ReceivedPacket { source: ip.get_source(), segment: datagram[header_len..].to_vec() })
}

/// Transport over real raw sockets. Needs root (or CAP_NET_RAW).
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSocketChannel;

impl RawChannel for RawSocketChannel {
    type Listener = RawSocketListener;

    fn open_listener(&self, local: Ipv4Addr) -> Result<Self::Listener, ProbeError> {
        Ok(RawSocketListener { socket: open_bound(local)?, buf: vec![0u8; RECV_BUFFER_LEN] })
    }

    fn transmit(&self, local: Ipv4Addr, remote: Ipv4Addr, segment: &[u8]) -> Result<(), ProbeError> {
        let socket = open_bound(local)?;
        let written = socket
            .send_to(segment, &SockAddr::from(SocketAddrV4::new(remote, 0)))
            .map_err(|source| ProbeError::Write { addr: remote, source })?;

        if written != segment.len() {
            return Err(ProbeError::ShortWrite { addr: remote, written, expected: segment.len() });
        }
        Ok(())
    }
}

/// Listening raw socket. Closed when dropped, whichever way the listener ends.
pub struct RawSocketListener {
    socket: Socket,
    buf: Vec<u8>,
}

impl PacketSource for RawSocketListener {
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<ReceivedPacket>> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining.max(MIN_READ_TIMEOUT)))?;

            let len = match self.socket.read(&mut self.buf) {
                Ok(len) => len,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match split_ipv4(&self.buf[..len]) {
                Some(packet) => return Ok(Some(packet)),
                None => trace!("Ignoring {} byte datagram that is not TCP over IPv4", len),
            }
        }
    }
}
