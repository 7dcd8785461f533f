//! Ferries frames over the chat transport and maintains the presence
//! protocol used for peer discovery (§4.5).

mod client;

pub use client::loopback::LoopbackImClient;
pub use client::{ImClient, ImEvent};

use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::direct;
use crate::error::TransportError;
use crate::mac::MacAddr;
use crate::peer::{ExternalHint, Peer};
use crate::peer_table::PeerTable;
use crate::tap::TapEndpoint;

/// The resource this node always registers under. Incoming presence whose
/// sender resource doesn't start with this is from a different client of
/// the same account and is ignored; resources that do match are
/// normalized back to this exact value before use as a table key, so the
/// random suffix some servers append doesn't fragment identities.
pub const RESOURCE: &str = "xtunnel";

/// Reconnect backoff, matching the original's `time.sleep(7)`.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(7);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Authenticating,
    Live,
}

/// Parsed form of this node's (or a peer's) presence status text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceStatus {
    Internal { ip: Ipv4Addr, mac: MacAddr },
    External { ip: Ipv4Addr, mac: MacAddr, external: SocketAddr },
}

impl PresenceStatus {
    pub fn mac(&self) -> MacAddr {
        match self {
            PresenceStatus::Internal { mac, .. } => *mac,
            PresenceStatus::External { mac, .. } => *mac,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        match self {
            PresenceStatus::Internal { ip, .. } => *ip,
            PresenceStatus::External { ip, .. } => *ip,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, PresenceStatus::External { .. })
    }

    /// Formats the wire grammar: `Internal <ip> <mac>` or
    /// `External <ip> <mac> <eip> <eport>`.
    pub fn to_status_line(&self) -> String {
        match self {
            PresenceStatus::Internal { ip, mac } => format!("Internal {ip} {mac}"),
            PresenceStatus::External { ip, mac, external } => {
                format!("External {ip} {mac} {} {}", external.ip(), external.port())
            }
        }
    }

    fn parse(text: &str) -> Option<PresenceStatus> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.as_slice() {
            ["Internal", ip, mac] => Some(PresenceStatus::Internal {
                ip: ip.parse().ok()?,
                mac: MacAddr::parse_loose(mac)?,
            }),
            ["External", ip, mac, eip, eport] => Some(PresenceStatus::External {
                ip: ip.parse().ok()?,
                mac: MacAddr::parse_loose(mac)?,
                external: SocketAddr::new(eip.parse().ok()?, eport.parse().ok()?),
            }),
            _ => None,
        }
    }
}

fn normalize_sender(raw: &str) -> Option<String> {
    let (bare, resource) = raw.split_once('/')?;
    if !resource.starts_with(RESOURCE) {
        return None;
    }
    Some(format!("{bare}/{RESOURCE}"))
}

/// Wraps an [`ImClient`], adding reconnect, the presence grammar, and
/// base64 frame transport. Owns no peer state itself: presence events
/// mutate the [`PeerTable`] passed in by the caller (the event loop), and
/// message bodies are written straight to the given [`TapEndpoint`].
pub struct MessagingAdapter<C: ImClient> {
    client: C,
    node: String,
    password: String,
    self_identity: String,
    self_status: PresenceStatus,
    state: State,
    reconnect_delay: Duration,
}

impl<C: ImClient> MessagingAdapter<C> {
    pub fn new(client: C, node: String, password: String, self_status: PresenceStatus) -> Self {
        let self_identity = format!("{node}/{RESOURCE}");
        MessagingAdapter {
            client,
            node,
            password,
            self_identity,
            self_status,
            state: State::Disconnected,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn self_identity(&self) -> &str {
        &self.self_identity
    }

    pub fn is_live(&self) -> bool {
        self.state == State::Live
    }

    /// Must be re-read every event-loop iteration: reconnection replaces
    /// the underlying socket.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.client.as_raw_fd()
    }

    /// Initial connect at startup; blocks (sleeping between attempts)
    /// until live, mirroring the original's constructor calling
    /// `reconnect()` immediately.
    pub fn start(&mut self) {
        self.reconnect();
    }

    /// Sleeps, drops the old session, and retries connect → authenticate
    /// → publish-presence until all three succeed. Never returns an
    /// error: the caller learns the adapter is down only by `is_live`
    /// being false in between, which is not user-visible since this call
    /// blocks until live again.
    fn reconnect(&mut self) {
        loop {
            std::thread::sleep(self.reconnect_delay);
            self.client.disconnect();
            self.state = State::Connecting;

            if let Err(err) = self.client.connect() {
                warn!(error = %err, "messaging transport connect failed, retrying");
                continue;
            }

            self.state = State::Authenticating;
            if let Err(err) = self.client.authenticate(&self.node, &self.password, RESOURCE) {
                warn!(error = %err, "messaging transport authentication failed, retrying");
                continue;
            }

            if let Err(err) = self.client.send_presence(&self.self_status.to_status_line()) {
                warn!(error = %err, "publishing presence failed, retrying");
                continue;
            }

            self.state = State::Live;
            info!(identity = %self.self_identity, "messaging transport live");
            return;
        }
    }

    /// Drains whatever transport events are ready, applying presence
    /// updates to `table` and writing decoded message frames to `tap`. Any
    /// transport error triggers the reconnect cycle; the peer table is
    /// left untouched across a reconnect (§8 scenario S5).
    pub fn on_readable(&mut self, table: &mut PeerTable, tap: &mut dyn TapEndpoint) {
        let events = match self.client.poll_events() {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "messaging transport error, reconnecting");
                self.reconnect();
                return;
            }
        };

        for event in events {
            match event {
                ImEvent::Presence { from, available, status } => {
                    self.handle_presence(table, &from, available, status.as_deref());
                }
                ImEvent::Message { kind, body, .. } => {
                    if kind != "normal" {
                        continue;
                    }
                    match BASE64.decode(body.as_bytes()) {
                        Ok(bytes) => {
                            if let Err(err) = tap.write(&bytes) {
                                warn!(error = %err, "writing messaging-delivered frame to tap");
                            }
                        }
                        Err(err) => warn!(error = %err, "malformed base64 message body"),
                    }
                }
            }
        }
    }

    fn handle_presence(&mut self, table: &mut PeerTable, from: &str, available: bool, status: Option<&str>) {
        let Some(identity) = normalize_sender(from) else {
            return; // §8 invariant 6: filtered resources never mutate the table.
        };
        if identity == self.self_identity {
            return;
        }

        if !available {
            table.remove(&identity);
            return;
        }

        let Some(status) = status.and_then(PresenceStatus::parse) else {
            return;
        };

        let peer = match status {
            PresenceStatus::Internal { ip, mac } => Peer::new(identity.clone(), ip, mac),
            PresenceStatus::External { ip, mac, external } => {
                // Internal nodes always dial out (they have no listener of
                // their own to be dialed on). When both sides are External,
                // a node with a MAC greater than the peer's waits to be
                // dialed instead, so exactly one side initiates (§4.5).
                let should_dial = !self.self_status.is_external() || self.self_status.mac() <= mac;
                if !should_dial {
                    Peer::new(identity.clone(), ip, mac).with_external_hint(ExternalHint { addr: external })
                } else {
                    match direct::dial(external, ip, mac, identity.clone(), &self.self_identity) {
                        Ok(peer) => peer,
                        Err(err) => {
                            warn!(peer = %identity, error = %err, "dialing peer's external address failed, falling back to messaging");
                            Peer::new(identity.clone(), ip, mac).with_external_hint(ExternalHint { addr: external })
                        }
                    }
                }
            }
        };

        if table.add(peer) {
            debug!(peer = %identity, "peer added from presence");
        }
    }

    /// Sends a type-`normal` message whose body is base64 of `frame`. A
    /// send failure triggers reconnect.
    pub fn send_frame_via_messaging(&mut self, peer_id: &str, frame: &[u8]) -> Result<(), TransportError> {
        let body = BASE64.encode(frame);
        match self.client.send_message(peer_id, "normal", &body) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(peer = peer_id, error = %err, "sending frame via messaging failed, reconnecting");
                self.reconnect();
                Err(err)
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
        self.state = State::Disconnected;
    }
}

#[cfg(test)]
pub mod tests {
    pub use super::client::loopback::LoopbackImClient;
    use super::*;
    use crate::tap::tests::RecordingTap;

    fn internal_status() -> PresenceStatus {
        PresenceStatus::Internal {
            ip: "10.0.0.1".parse().unwrap(),
            mac: MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap(),
        }
    }

    #[test]
    fn status_line_round_trips() {
        let status = PresenceStatus::External {
            ip: "10.0.0.1".parse().unwrap(),
            mac: MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap(),
            external: "203.0.113.9:18080".parse().unwrap(),
        };
        let line = status.to_status_line();
        assert_eq!(line, "External 10.0.0.1 aaaaaaaaaa01 203.0.113.9 18080");
        assert_eq!(PresenceStatus::parse(&line), Some(status));
    }

    /// §8 invariant 6: a presence with a non-matching resource never
    /// mutates the table.
    #[test]
    fn presence_from_other_resource_is_ignored() {
        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        let mut table = PeerTable::new();

        adapter.handle_presence(&mut table, "other@example.com/gajim.abc123", true, Some("Internal 10.0.0.2 aaaaaaaaaa02"));
        assert!(table.is_empty());

        adapter.handle_presence(&mut table, "other@example.com/xtunnel-random", true, Some("Internal 10.0.0.2 aaaaaaaaaa02"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn presence_from_self_is_ignored() {
        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        let mut table = PeerTable::new();
        adapter.handle_presence(&mut table, "me@example.com/xtunnel", true, Some("Internal 10.0.0.1 aaaaaaaaaa01"));
        assert!(table.is_empty());
    }

    #[test]
    fn unavailable_presence_removes_peer() {
        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        let mut table = PeerTable::new();
        adapter.handle_presence(&mut table, "p@example.com/xtunnel", true, Some("Internal 10.0.0.2 aaaaaaaaaa02"));
        assert_eq!(table.len(), 1);
        adapter.handle_presence(&mut table, "p@example.com/xtunnel", false, None);
        assert!(table.is_empty());
    }

    /// Scenario S3 (§8): fallback to messaging for a peer known only as
    /// Internal.
    #[test]
    fn send_frame_via_messaging_encodes_base64() {
        let (client, mut peer_client) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        adapter.send_frame_via_messaging("p@example.com/xtunnel", b"hello-frame").unwrap();

        let events = peer_client.poll_events().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ImEvent::Message { kind, body, .. } => {
                assert_eq!(kind, "normal");
                assert_eq!(BASE64.decode(body.as_bytes()).unwrap(), b"hello-frame");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn message_event_writes_decoded_frame_to_tap() {
        let (client, mut peer_client) = LoopbackImClient::new_pair();
        peer_client
            .send_message("ignored", "normal", &BASE64.encode(b"payload-bytes"))
            .unwrap();

        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        let mut table = PeerTable::new();
        let mut tap = RecordingTap::new();
        adapter.on_readable(&mut table, &mut tap);

        assert_eq!(tap.written, vec![b"payload-bytes".to_vec()]);
    }

    #[test]
    fn internal_presence_never_dials() {
        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        let mut table = PeerTable::new();
        adapter.handle_presence(&mut table, "p@example.com/xtunnel", true, Some("Internal 10.0.0.2 aaaaaaaaaa02"));
        let peer = table.lookup_by_id("p@example.com/xtunnel").unwrap();
        assert!(!peer.has_link());
        assert!(peer.external_hint.is_none());
    }

    /// §8 invariant 5 / scenario S4: an Internal node always dials an
    /// External peer that announces reachability, since it has no
    /// listener of its own to be dialed on.
    #[test]
    fn internal_self_dials_external_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), internal_status());
        let mut table = PeerTable::new();
        let status = format!("External 10.0.0.2 aaaaaaaaaa02 {} {}", addr.ip(), addr.port());
        adapter.handle_presence(&mut table, "p@example.com/xtunnel", true, Some(&status));

        listener.accept().unwrap();
        let peer = table.lookup_by_id("p@example.com/xtunnel").unwrap();
        assert!(peer.has_link());
    }

    /// §4.5: of two External nodes, the one with the lesser-or-equal MAC
    /// dials; the greater one waits to be dialed instead.
    #[test]
    fn lesser_mac_dials_greater_mac_waits() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let status = format!("External 10.0.0.2 aaaaaaaaaa02 {} {}", addr.ip(), addr.port());

        // Self has the lesser MAC (..01 < ..02): should dial.
        let lesser_self = PresenceStatus::External {
            ip: "10.0.0.9".parse().unwrap(),
            mac: MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap(),
            external: "203.0.113.9:18080".parse().unwrap(),
        };
        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), lesser_self);
        let mut table = PeerTable::new();
        adapter.handle_presence(&mut table, "p@example.com/xtunnel", true, Some(&status));
        listener.accept().unwrap();
        assert!(table.lookup_by_id("p@example.com/xtunnel").unwrap().has_link());

        // Self has the greater MAC (..03 > ..02): should wait instead.
        let greater_self = PresenceStatus::External {
            ip: "10.0.0.9".parse().unwrap(),
            mac: MacAddr::parse_loose("aa:aa:aa:aa:aa:03").unwrap(),
            external: "203.0.113.9:18080".parse().unwrap(),
        };
        let (client, _peer) = LoopbackImClient::new_pair();
        let mut adapter = MessagingAdapter::new(client, "me@example.com".into(), "pw".into(), greater_self);
        let mut table = PeerTable::new();
        adapter.handle_presence(&mut table, "p@example.com/xtunnel", true, Some(&status));
        let peer = table.lookup_by_id("p@example.com/xtunnel").unwrap();
        assert!(!peer.has_link());
        assert_eq!(peer.external_hint, Some(ExternalHint { addr }));
    }
}
