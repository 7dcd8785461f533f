//! The messaging-transport client boundary.
//!
//! Per the scope notes, the XML-stream connection, SASL authentication, and
//! stanza dispatch of the chat/presence transport itself are an external
//! collaborator — this crate depends only on [`ImClient`]. A production
//! deployment plugs in a real client crate behind this trait; `l2overlay`
//! ships [`loopback::LoopbackImClient`], a paired in-process double used by
//! the test suite and the `stand` subcommand.

use std::os::unix::io::RawFd;

use crate::error::TransportError;

/// One event surfaced by the transport: either a presence update or a
/// directed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImEvent {
    Presence {
        from: String,
        available: bool,
        status: Option<String>,
    },
    Message {
        from: String,
        kind: String,
        body: String,
    },
}

/// Everything [`super::MessagingAdapter`] needs from the underlying
/// transport.
pub trait ImClient {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn authenticate(&mut self, node: &str, password: &str, resource: &str) -> Result<(), TransportError>;
    fn send_presence(&mut self, status: &str) -> Result<(), TransportError>;
    fn send_message(&mut self, to: &str, kind: &str, body: &str) -> Result<(), TransportError>;
    /// Non-blocking: drains whatever events are currently available.
    fn poll_events(&mut self) -> Result<Vec<ImEvent>, TransportError>;
    fn disconnect(&mut self);
    /// `None` while disconnected; the event loop must re-fetch this every
    /// iteration since reconnection replaces the underlying socket.
    fn as_raw_fd(&self) -> Option<RawFd>;
}

/// An in-process stand-in for two ends of a chat session, wired directly
/// to each other rather than through a real server. This is the crate's
/// one shipped [`ImClient`]: used by the test suite, and by the `stand`
/// subcommand for a single-node smoke run with no network dependency. A
/// production deployment supplies its own [`ImClient`] backed by a real
/// messaging-transport client crate.
pub mod loopback {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc::{self, Receiver, Sender};

    pub struct LoopbackImClient {
        inbox: Receiver<ImEvent>,
        peer_outbox: Sender<ImEvent>,
        connected: bool,
        fail_next_connect: bool,
        pending: VecDeque<ImEvent>,
    }

    impl LoopbackImClient {
        /// Builds a connected pair; events sent on one arrive via
        /// `poll_events` on the other.
        pub fn new_pair() -> (LoopbackImClient, LoopbackImClient) {
            let (tx_a, rx_a) = mpsc::channel();
            let (tx_b, rx_b) = mpsc::channel();
            (
                LoopbackImClient {
                    inbox: rx_a,
                    peer_outbox: tx_b,
                    connected: false,
                    fail_next_connect: false,
                    pending: VecDeque::new(),
                },
                LoopbackImClient {
                    inbox: rx_b,
                    peer_outbox: tx_a,
                    connected: false,
                    fail_next_connect: false,
                    pending: VecDeque::new(),
                },
            )
        }

        pub fn fail_next_connect(&mut self) {
            self.fail_next_connect = true;
        }

        /// Queues a message event that will be returned by the next
        /// `poll_events` call, without going through the peer channel.
        pub fn inject(&mut self, event: ImEvent) {
            self.pending.push_back(event);
        }
    }

    impl ImClient for LoopbackImClient {
        fn connect(&mut self) -> Result<(), TransportError> {
            if self.fail_next_connect {
                self.fail_next_connect = false;
                return Err(TransportError::NotConnected);
            }
            self.connected = true;
            Ok(())
        }

        fn authenticate(&mut self, _node: &str, _password: &str, _resource: &str) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            Ok(())
        }

        fn send_presence(&mut self, status: &str) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            let _ = self.peer_outbox.send(ImEvent::Presence {
                from: "self".to_string(),
                available: true,
                status: Some(status.to_string()),
            });
            Ok(())
        }

        fn send_message(&mut self, to: &str, kind: &str, body: &str) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.peer_outbox
                .send(ImEvent::Message {
                    from: to.to_string(),
                    kind: kind.to_string(),
                    body: body.to_string(),
                })
                .map_err(|_| TransportError::NotConnected)
        }

        fn poll_events(&mut self) -> Result<Vec<ImEvent>, TransportError> {
            let mut out: Vec<ImEvent> = self.pending.drain(..).collect();
            while let Ok(event) = self.inbox.try_recv() {
                out.push(event);
            }
            Ok(out)
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn as_raw_fd(&self) -> Option<RawFd> {
            if self.connected {
                Some(0)
            } else {
                None
            }
        }
    }
}
