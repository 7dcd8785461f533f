//! Error taxonomy.
//!
//! Per-source errors (frame parsing, link I/O, transport hiccups) are
//! recovered at their owning component and never bubble past it. Only
//! [`TapError`] and [`ConfigError`] are allowed to reach `main` and end the
//! process, matching the propagation policy in the design notes.

use std::io;

/// A frame too short to contain an Ethernet header, or an ARP payload too
/// short to contain the fixed RFC 826 body.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },
    #[error("not an ARP request")]
    NotArpRequest,
}

/// A direct-link TCP socket failed a read or write, or sent a malformed
/// length-prefixed record. Either way the link is torn down; the owning
/// [`crate::peer::Peer`] falls back to `None` state.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("record length {0} exceeds maximum frame size {1}")]
    RecordTooLarge(usize, usize),
}

/// Messaging-transport failure. Always recovered by the adapter's own
/// reconnect state machine; never surfaced to the event loop as an error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("authentication failed")]
    AuthFailed,
    #[error("not connected")]
    NotConnected,
}

/// Fatal: the overlay cannot run without a working TAP device.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("unsupported platform: no TAP implementation for this OS")]
    PlatformUnsupported,
    #[error("opening {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("ioctl {name} on {path} failed: {source}")]
    Ioctl {
        name: &'static str,
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("running `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {status}")]
    CommandFailed { command: String, status: i32 },
    #[error("reading MAC address from {path}: {source}")]
    ReadMac {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("could not parse MAC address from {path}: {raw:?}")]
    ParseMac { path: String, raw: String },
    #[error("looking up user/group {name}: {source}")]
    UserLookup {
        name: String,
        #[source]
        source: nix::Error,
    },
    #[error("no such user or group: {0}")]
    NoSuchUserOrGroup(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal: the config file is missing, unreadable, or internally
/// inconsistent (e.g. `im.ip` without `im.port`).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config file found at any of: {0:?}")]
    NotFound(Vec<String>),
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("im.ip is set but im.port is missing")]
    ExternalPortMissing,
    #[error("invalid IPv4 address {0:?} in field {1}")]
    InvalidIpv4(String, &'static str),
}
