//! A single remote node's state: identity, announced IP/MAC, and an
//! optional direct TCP link with its length-prefixed receive buffer.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{debug, warn};

use crate::error::LinkError;
use crate::mac::MacAddr;
use crate::tap::TapEndpoint;

/// Maximum length of a single length-prefixed record on a direct link: the
/// reference TAP MTU plus Ethernet header, never exceeding what fits in the
/// `u16` length prefix.
pub const MAX_FRAME_LEN: usize = 2000;

/// Reachability hint a peer announces for inbound direct dial-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalHint {
    pub addr: SocketAddr,
}

enum Link {
    None,
    Direct { socket: TcpStream, rx_buf: Vec<u8> },
}

/// State for one remote peer: stable identity, announced IP/MAC, and
/// whichever link state currently carries its traffic.
pub struct Peer {
    pub id: String,
    pub ip: std::net::Ipv4Addr,
    pub mac: MacAddr,
    pub external_hint: Option<ExternalHint>,
    link: Link,
}

impl Peer {
    pub fn new(id: String, ip: std::net::Ipv4Addr, mac: MacAddr) -> Self {
        Peer {
            id,
            ip,
            mac,
            external_hint: None,
            link: Link::None,
        }
    }

    pub fn with_external_hint(mut self, hint: ExternalHint) -> Self {
        self.external_hint = Some(hint);
        self
    }

    pub fn has_link(&self) -> bool {
        matches!(self.link, Link::Direct { .. })
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.link {
            Link::Direct { socket, .. } => Some(socket.as_raw_fd()),
            Link::None => None,
        }
    }

    /// Moves the peer into `direct` state, draining any frames already
    /// buffered in `initial_rx` (bytes read by the [`crate::direct::PendingLink`]
    /// handshake before ownership transferred here) to `tap` before
    /// returning.
    pub fn attach_link(
        &mut self,
        socket: TcpStream,
        initial_rx: Vec<u8>,
        tap: &mut dyn TapEndpoint,
    ) -> Result<(), LinkError> {
        self.link = Link::Direct {
            socket,
            rx_buf: initial_rx,
        };
        self.drain(tap)
    }

    /// Tears the link down, dropping the socket and returning the peer to
    /// `None` state. The peer entry itself is untouched; presence is what
    /// decides whether it still exists.
    pub fn detach_link(&mut self) {
        self.link = Link::None;
    }

    /// Reads up to 2000 bytes into the receive buffer and drains any
    /// complete length-prefixed records to `tap`. A read or decode error
    /// tears the link down and is returned so the caller can log it.
    pub fn on_readable(&mut self, tap: &mut dyn TapEndpoint) -> Result<(), LinkError> {
        let result = (|| -> Result<(), LinkError> {
            let (socket, rx_buf) = match &mut self.link {
                Link::Direct { socket, rx_buf } => (socket, rx_buf),
                Link::None => return Ok(()),
            };
            let mut chunk = [0u8; MAX_FRAME_LEN];
            let n = socket.read(&mut chunk)?;
            if n == 0 {
                return Err(LinkError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed direct link",
                )));
            }
            rx_buf.extend_from_slice(&chunk[0..n]);
            Ok(())
        })();

        if let Err(err) = result {
            self.detach_link();
            return Err(err);
        }

        self.drain(tap)
    }

    /// Repeatedly decodes `[u16 BE length][frame]` records from the
    /// receive buffer, writing each complete frame to `tap` in order and
    /// leaving only a strict prefix of the next record behind. Never
    /// writes a partial frame.
    fn drain(&mut self, tap: &mut dyn TapEndpoint) -> Result<(), LinkError> {
        let rx_buf = match &mut self.link {
            Link::Direct { rx_buf, .. } => rx_buf,
            Link::None => return Ok(()),
        };

        let mut consumed = 0;
        loop {
            let remaining = &rx_buf[consumed..];
            if remaining.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([remaining[0], remaining[1]]) as usize;
            if len > MAX_FRAME_LEN {
                let bad_len = len;
                rx_buf.drain(0..consumed);
                self.detach_link();
                return Err(LinkError::RecordTooLarge(bad_len, MAX_FRAME_LEN));
            }
            if remaining.len() < 2 + len {
                break;
            }
            let frame = &remaining[2..2 + len];
            if let Err(err) = tap.write(frame) {
                rx_buf.drain(0..consumed);
                self.detach_link();
                return Err(LinkError::Io(err));
            }
            consumed += 2 + len;
        }
        rx_buf.drain(0..consumed);
        Ok(())
    }

    /// Serializes `[u16 BE length][frame bytes]` to the direct link. A
    /// write failure tears the link down; the peer remains in the table
    /// and is eligible for the next presence-driven reconfirmation.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let socket = match &mut self.link {
            Link::Direct { socket, .. } => socket,
            Link::None => {
                return Err(LinkError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "peer has no direct link",
                )))
            }
        };
        let result = (|| -> io::Result<()> {
            let len = frame.len() as u16;
            socket.write_all(&len.to_be_bytes())?;
            socket.write_all(frame)?;
            Ok(())
        })();

        if let Err(err) = result {
            warn!(peer = %self.id, error = %err, "direct link write failed, tearing down");
            self.detach_link();
            return Err(LinkError::Io(err));
        }
        debug!(peer = %self.id, bytes = frame.len(), "sent frame over direct link");
        Ok(())
    }
}
