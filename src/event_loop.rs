//! The single-threaded, readiness-driven dispatch loop: TAP ↔ peers ↔
//! messaging transport, plus accepting and completing inbound direct
//! links. A `mio::Poll` readiness set replaces the original's `select()`;
//! the dispatch semantics (wake on whichever source is ready, handle it,
//! loop) are unchanged.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::direct::{DirectListener, PendingLink, PendingOutcome};
use crate::frame::Frame;
use crate::messaging::ImClient;
use crate::messaging::MessagingAdapter;
use crate::peer_table::PeerTable;
use crate::tap::TapEndpoint;

/// Readiness is re-checked at least this often even with nothing to do, so
/// the messaging transport's own reconnect bookkeeping and any future
/// periodic housekeeping never stalls indefinitely, matching the
/// original's `select(..., 3)` timeout.
const POLL_TIMEOUT: Duration = Duration::from_secs(3);

const TAP_TOKEN: Token = Token(0);
const MESSAGING_TOKEN: Token = Token(1);
const LISTENER_TOKEN: Token = Token(2);
const FIRST_DYNAMIC_TOKEN: usize = 3;

enum Source {
    Peer(String),
    Pending,
}

/// Owns every long-lived readable source and drives the dispatch loop.
/// Generic over the messaging transport implementation so tests can run
/// it against [`crate::messaging::LoopbackImClient`].
pub struct EventLoop<C: ImClient> {
    poll: Poll,
    tap: Box<dyn TapEndpoint>,
    messaging: MessagingAdapter<C>,
    table: PeerTable,
    listener: Option<DirectListener>,
    pendings: HashMap<Token, PendingLink>,
    sources: HashMap<Token, Source>,
    next_token: usize,
    messaging_fd: Option<std::os::unix::io::RawFd>,
}

impl<C: ImClient> EventLoop<C> {
    pub fn new(
        tap: Box<dyn TapEndpoint>,
        messaging: MessagingAdapter<C>,
        table: PeerTable,
        listener: Option<DirectListener>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry();

        registry.register(&mut SourceFd(&tap.raw_fd()), TAP_TOKEN, Interest::READABLE)?;
        let messaging_fd = messaging.raw_fd();
        if let Some(fd) = messaging_fd {
            registry.register(&mut SourceFd(&fd), MESSAGING_TOKEN, Interest::READABLE)?;
        }
        if let Some(listener) = &listener {
            registry.register(&mut SourceFd(&listener.raw_fd()), LISTENER_TOKEN, Interest::READABLE)?;
        }

        Ok(EventLoop {
            poll,
            tap,
            messaging,
            table,
            listener,
            pendings: HashMap::new(),
            sources: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            messaging_fd,
        })
    }

    /// Reconnecting the messaging transport replaces its underlying
    /// socket; re-syncs the poll registration with whatever fd it holds
    /// now.
    fn resync_messaging_registration(&mut self) -> io::Result<()> {
        let current = self.messaging.raw_fd();
        if current == self.messaging_fd {
            return Ok(());
        }
        if let Some(old) = self.messaging_fd {
            let _ = self.poll.registry().deregister(&mut SourceFd(&old));
        }
        if let Some(new) = current {
            self.poll
                .registry()
                .register(&mut SourceFd(&new), MESSAGING_TOKEN, Interest::READABLE)?;
        }
        self.messaging_fd = current;
        Ok(())
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn register_peer(&mut self, id: &str) -> io::Result<()> {
        let Some(fd) = self.table.lookup_by_id(id).and_then(|p| p.raw_fd()) else {
            return Ok(());
        };
        // The fd may already be registered under an older token (e.g. it
        // was just a pending handshake connection); re-registering without
        // deregistering first fails with EEXIST.
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        let token = self.allocate_token();
        self.poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.sources.insert(token, Source::Peer(id.to_string()));
        Ok(())
    }

    fn register_pending(&mut self, pending: PendingLink) -> io::Result<()> {
        let fd = pending.raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        let token = self.allocate_token();
        self.poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.sources.insert(token, Source::Pending);
        self.pendings.insert(token, pending);
        Ok(())
    }

    /// Runs until `should_stop` returns true after a poll wakes. Exposed
    /// as a parameter (rather than an infinite `loop`) so tests can run a
    /// bounded number of iterations, and so a caller can wire `should_stop`
    /// to a signal-set flag. Disconnects the messaging transport before
    /// returning, so a clean stop always ends the loop with no dangling
    /// session on the transport side.
    pub fn run_until(&mut self, mut should_stop: impl FnMut() -> bool) -> io::Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            if should_stop() {
                self.messaging.disconnect();
                return Ok(());
            }
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            // New peers may have been added by presence handling below, and
            // their sockets need registering before the next poll call.
            let mut newly_linked = Vec::new();

            for event in events.iter() {
                let token = event.token();
                match token {
                    TAP_TOKEN => self.on_tap_readable(),
                    MESSAGING_TOKEN => {
                        self.on_messaging_readable(&mut newly_linked);
                        self.resync_messaging_registration()?;
                    }
                    LISTENER_TOKEN => self.on_listener_readable()?,
                    other => self.on_dynamic_readable(other)?,
                }
            }

            for id in newly_linked {
                self.register_peer(&id)?;
            }
        }
    }

    fn on_tap_readable(&mut self) {
        let frame_bytes = match self.tap.read_frame() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "reading from tap failed");
                return;
            }
        };
        let frame = match Frame::parse(&frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "dropping unparseable frame from tap");
                return;
            }
        };
        self.table.dispatch(frame, self.tap.as_mut(), &mut self.messaging);
    }

    fn on_messaging_readable(&mut self, newly_linked: &mut Vec<String>) {
        let before: std::collections::HashSet<String> = self.table.ids().map(str::to_string).collect();
        self.messaging.on_readable(&mut self.table, self.tap.as_mut());
        for id in self.table.ids() {
            if !before.contains(id) && self.table.lookup_by_id(id).map(|p| p.has_link()).unwrap_or(false) {
                newly_linked.push(id.to_string());
            }
        }
    }

    fn on_listener_readable(&mut self) -> io::Result<()> {
        let Some(listener) = &self.listener else { return Ok(()) };
        for pending in listener.accept_all()? {
            self.register_pending(pending)?;
        }
        Ok(())
    }

    fn on_dynamic_readable(&mut self, token: Token) -> io::Result<()> {
        match self.sources.get(&token) {
            Some(Source::Peer(id)) => {
                let id = id.clone();
                if let Some(peer) = self.table.lookup_by_id_mut(&id) {
                    let fd_before = peer.raw_fd();
                    if let Err(err) = peer.on_readable(self.tap.as_mut()) {
                        info!(peer = %id, error = %err, "direct link torn down");
                        if let Some(fd) = fd_before {
                            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                        }
                        self.sources.remove(&token);
                    }
                } else {
                    self.sources.remove(&token);
                }
            }
            Some(Source::Pending) => {
                if let Some(pending) = self.pendings.remove(&token) {
                    self.sources.remove(&token);
                    match pending.on_readable() {
                        Ok(PendingOutcome::Incomplete(pending)) => {
                            self.register_pending(pending)?;
                        }
                        Ok(PendingOutcome::Complete { identity, socket, leftover }) => {
                            self.complete_pending_link(identity, socket, leftover)?;
                        }
                        Err(err) => {
                            debug!(error = %err, "dropping inbound connection that failed its handshake");
                        }
                    }
                }
            }
            None => {}
        }
        Ok(())
    }

    fn complete_pending_link(
        &mut self,
        identity: String,
        socket: std::net::TcpStream,
        leftover: Vec<u8>,
    ) -> io::Result<()> {
        let Some(peer) = self.table.lookup_by_id_mut(&identity) else {
            debug!(peer = %identity, "inbound handshake for unknown peer, dropping");
            return Ok(());
        };
        if peer.has_link() {
            debug!(peer = %identity, "inbound handshake for already-linked peer, dropping");
            return Ok(());
        }
        if let Err(err) = peer.attach_link(socket, leftover, self.tap.as_mut()) {
            warn!(peer = %identity, error = %err, "attaching inbound direct link failed");
            return Ok(());
        }
        info!(peer = %identity, "inbound direct link established");
        self.register_peer(&identity)?;
        Ok(())
    }
}
