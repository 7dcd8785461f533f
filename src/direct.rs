//! The direct-link upgrade path: dialing a peer's announced external
//! address, listening for inbound dials, and the length-prefixed identity
//! handshake both sides perform before a socket is handed to a [`Peer`].

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{debug, info};

use crate::error::LinkError;
use crate::mac::MacAddr;
use crate::peer::Peer;
use crate::tap::TapEndpoint;

/// Longest identity string accepted in a handshake record, generous enough
/// for any realistic JID while still bounding the read.
const MAX_HANDSHAKE_LEN: usize = 1024;

fn encode_handshake(identity: &str) -> Vec<u8> {
    let bytes = identity.as_bytes();
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Connects to `external`, writes the identity handshake, and returns a
/// [`Peer`] already in `direct` state — mirroring the original's `Host`
/// constructor, which dials and sends its identity synchronously as soon
/// as it learns a peer's external address.
pub fn dial(
    external: SocketAddr,
    ip: Ipv4Addr,
    mac: MacAddr,
    peer_id: String,
    self_identity: &str,
) -> Result<Peer, LinkError> {
    let mut socket = TcpStream::connect(external)?;
    socket.write_all(&encode_handshake(self_identity))?;

    let mut peer = Peer::new(peer_id.clone(), ip, mac);
    // A freshly-dialed link has nothing buffered yet, so draining it is a
    // no-op; this sink only exists to satisfy `attach_link`'s signature.
    let mut sink = NullSink;
    peer.attach_link(socket, Vec::new(), &mut sink)?;

    info!(peer = %peer_id, addr = %external, "dialed peer's external address");
    Ok(peer)
}

struct NullSink;

impl TapEndpoint for NullSink {
    fn read_frame(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
    fn write(&mut self, _frame: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
    fn raw_fd(&self) -> RawFd {
        -1
    }
    fn mac(&self) -> MacAddr {
        MacAddr::ZERO
    }
    fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }
}

/// A TCP listener for inbound direct-link connections, bound once at
/// startup from the `[im]` `eport` config key.
pub struct DirectListener {
    listener: TcpListener,
}

impl DirectListener {
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(DirectListener { listener })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts every connection currently queued, returning each as a
    /// fresh [`PendingLink`] awaiting its handshake.
    pub fn accept_all(&self) -> std::io::Result<Vec<PendingLink>> {
        let mut out = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    socket.set_nonblocking(true)?;
                    debug!(addr = %addr, "accepted inbound direct-link connection");
                    out.push(PendingLink::new(socket));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

/// A freshly-accepted socket that hasn't sent its identity handshake yet.
/// The event loop polls it for readability like any other fd; once
/// [`PendingLink::on_readable`] reports a complete handshake, ownership of
/// the socket moves to the matching [`Peer`] via `attach_link`.
pub struct PendingLink {
    socket: TcpStream,
    buf: Vec<u8>,
}

impl PendingLink {
    fn new(socket: TcpStream) -> Self {
        PendingLink { socket, buf: Vec::new() }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Reads more handshake bytes. Returns `Some((identity, socket,
    /// leftover))` once the length-prefixed identity record is complete;
    /// `leftover` is any frame bytes the peer had already started sending
    /// in the same read and must be handed to `Peer::attach_link` rather
    /// than discarded.
    pub fn on_readable(mut self) -> Result<PendingOutcome, LinkError> {
        let mut chunk = [0u8; 512];
        let n = self.socket.read(&mut chunk)?;
        if n == 0 {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection before completing handshake",
            )));
        }
        self.buf.extend_from_slice(&chunk[0..n]);

        if self.buf.len() < 2 {
            return Ok(PendingOutcome::Incomplete(self));
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len > MAX_HANDSHAKE_LEN {
            return Err(LinkError::RecordTooLarge(len, MAX_HANDSHAKE_LEN));
        }
        if self.buf.len() < 2 + len {
            return Ok(PendingOutcome::Incomplete(self));
        }

        let identity = String::from_utf8_lossy(&self.buf[2..2 + len]).into_owned();
        let leftover = self.buf[2 + len..].to_vec();
        Ok(PendingOutcome::Complete {
            identity,
            socket: self.socket,
            leftover,
        })
    }
}

pub enum PendingOutcome {
    Incomplete(PendingLink),
    Complete {
        identity: String,
        socket: TcpStream,
        leftover: Vec<u8>,
    },
}
