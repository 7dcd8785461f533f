//! Indexed registry of peers by identity, IP, and MAC, and the frame
//! switching logic that decides where an outbound frame goes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, trace, warn};

use crate::frame::{EtherType, Frame};
use crate::mac::MacAddr;
use crate::messaging::{ImClient, MessagingAdapter};
use crate::peer::Peer;
use crate::tap::TapEndpoint;

/// Registry of peers, indexed three ways. The invariant (§8, property 1)
/// is that all three indices always point at the same set of peers: `add`
/// and `remove` are the only mutators and both keep the indices in lock
/// step.
#[derive(Default)]
pub struct PeerTable {
    by_id: HashMap<String, Peer>,
    id_by_ip: HashMap<Ipv4Addr, String>,
    id_by_mac: HashMap<MacAddr, String>,
    dropped_other_ethertype: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `peer` unless its id, ip, or mac already has an entry, in
    /// which case the existing entry wins and `peer` is dropped silently
    /// (§4.3, §8 property 7). Returns whether the insert happened.
    pub fn add(&mut self, peer: Peer) -> bool {
        if self.by_id.contains_key(&peer.id)
            || self.id_by_ip.contains_key(&peer.ip)
            || self.id_by_mac.contains_key(&peer.mac)
        {
            warn!(
                peer = %peer.id, ip = %peer.ip, mac = %peer.mac,
                "dropping peer, conflicts with an existing id/ip/mac"
            );
            return false;
        }
        self.id_by_ip.insert(peer.ip, peer.id.clone());
        self.id_by_mac.insert(peer.mac, peer.id.clone());
        self.by_id.insert(peer.id.clone(), peer);
        true
    }

    /// Removes a peer from all three indices and drops any direct link.
    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        let peer = self.by_id.remove(id)?;
        self.id_by_ip.remove(&peer.ip);
        self.id_by_mac.remove(&peer.mac);
        Some(peer)
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<&Peer> {
        self.by_id.get(id)
    }

    pub fn lookup_by_id_mut(&mut self, id: &str) -> Option<&mut Peer> {
        self.by_id.get_mut(id)
    }

    pub fn lookup_by_ip(&self, ip: Ipv4Addr) -> Option<&Peer> {
        self.id_by_ip.get(&ip).and_then(|id| self.by_id.get(id))
    }

    pub fn lookup_by_mac(&self, mac: MacAddr) -> Option<&Peer> {
        self.id_by_mac.get(&mac).and_then(|id| self.by_id.get(id))
    }

    pub fn lookup_by_mac_mut(&mut self, mac: MacAddr) -> Option<&mut Peer> {
        let id = self.id_by_mac.get(&mac)?.clone();
        self.by_id.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(|s| s.as_str())
    }

    /// Peers currently in `direct` state, for the event loop's readable
    /// set.
    pub fn linked_peer_ids(&self) -> Vec<String> {
        self.by_id
            .iter()
            .filter(|(_, p)| p.has_link())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Switches one frame read from TAP: ARP requests are answered locally
    /// by spoofing a reply on the resolved peer's behalf (§4.3); IP frames
    /// go out the addressed peer's direct link if it has one, otherwise
    /// fall back to the messaging transport; anything else is dropped and
    /// counted.
    pub fn dispatch<C: ImClient>(
        &mut self,
        frame: Frame<'_>,
        tap: &mut dyn TapEndpoint,
        messaging: &mut MessagingAdapter<C>,
    ) {
        match frame.ethertype() {
            EtherType::Arp => {
                let Some(requested_ip) = frame.arp_requested_ip() else {
                    trace!("dropping ARP frame that is not a resolvable request");
                    return;
                };
                let Some(peer) = self.lookup_by_ip(requested_ip) else {
                    trace!(ip = %requested_ip, "no peer for ARP request, dropping");
                    return;
                };
                match frame.synthesize_arp_reply(peer.mac) {
                    Ok(reply) => {
                        if let Err(err) = tap.write(&reply) {
                            warn!(error = %err, "writing synthesized ARP reply to tap");
                        } else {
                            debug!(ip = %requested_ip, mac = %peer.mac, "spoofed ARP reply");
                        }
                    }
                    Err(err) => warn!(error = %err, "could not synthesize ARP reply"),
                }
            }
            EtherType::Ip => {
                let destination = frame.destination_mac();
                let Some(peer) = self.lookup_by_mac_mut(destination) else {
                    trace!(mac = %destination, "no peer for destination mac, dropping");
                    return;
                };
                if peer.has_link() {
                    if peer.send(frame.as_bytes()).is_err() {
                        debug!(peer = %peer.id, "direct send failed, peer falls back to none");
                    }
                } else {
                    let id = peer.id.clone();
                    if let Err(err) = messaging.send_frame_via_messaging(&id, frame.as_bytes()) {
                        warn!(peer = %id, error = %err, "sending frame via messaging fallback");
                    }
                }
            }
            EtherType::Other(value) => {
                self.dropped_other_ethertype += 1;
                trace!(ethertype = format!("0x{value:04x}"), "dropping unhandled ethertype");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::loopback::LoopbackImClient;
    use crate::tap::tests::RecordingTap;

    fn sample_peer(id: &str, ip: &str, mac: &str) -> Peer {
        Peer::new(id.to_string(), ip.parse().unwrap(), MacAddr::parse_loose(mac).unwrap())
    }

    #[test]
    fn all_three_indices_agree() {
        let mut table = PeerTable::new();
        table.add(sample_peer("a@example.com", "10.0.0.1", "aa:aa:aa:aa:aa:01"));

        let by_id = table.lookup_by_id("a@example.com").unwrap();
        let by_ip = table.lookup_by_ip("10.0.0.1".parse().unwrap()).unwrap();
        let by_mac = table
            .lookup_by_mac(MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap())
            .unwrap();
        assert_eq!(by_id.id, by_ip.id);
        assert_eq!(by_id.id, by_mac.id);
    }

    #[test]
    fn duplicate_ip_is_dropped() {
        let mut table = PeerTable::new();
        assert!(table.add(sample_peer("a@example.com", "10.0.0.1", "aa:aa:aa:aa:aa:01")));
        assert!(!table.add(sample_peer("b@example.com", "10.0.0.1", "aa:aa:aa:aa:aa:02")));
        assert_eq!(table.len(), 1);
        assert!(table.lookup_by_id("b@example.com").is_none());
    }

    #[test]
    fn duplicate_mac_is_dropped() {
        let mut table = PeerTable::new();
        assert!(table.add(sample_peer("a@example.com", "10.0.0.1", "aa:aa:aa:aa:aa:01")));
        assert!(!table.add(sample_peer("b@example.com", "10.0.0.2", "aa:aa:aa:aa:aa:01")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_clears_all_indices() {
        let mut table = PeerTable::new();
        table.add(sample_peer("a@example.com", "10.0.0.1", "aa:aa:aa:aa:aa:01"));
        table.remove("a@example.com");
        assert!(table.lookup_by_id("a@example.com").is_none());
        assert!(table.lookup_by_ip("10.0.0.1".parse().unwrap()).is_none());
        assert!(table
            .lookup_by_mac(MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap())
            .is_none());
    }

    /// Scenario S2 (§8): ARP request for a known peer's IP is answered
    /// locally; nothing is sent to the peer itself.
    #[test]
    fn dispatch_arp_spoofs_locally() {
        let mut table = PeerTable::new();
        table.add(sample_peer("b@example.com", "10.0.0.2", "aa:aa:aa:aa:aa:02"));

        let request = build_arp_request(
            MacAddr::parse_loose("aa:aa:aa:aa:aa:01").unwrap(),
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        );
        let frame = Frame::parse(&request).unwrap();

        let mut tap = RecordingTap::new();
        let mut messaging = MessagingAdapter::new(
            LoopbackImClient::new_pair().0,
            "me@example.com".to_string(),
            "pw".to_string(),
            test_status(),
        );

        table.dispatch(frame, &mut tap, &mut messaging);

        assert_eq!(tap.written.len(), 1);
        let reply = Frame::parse(&tap.written[0]).unwrap();
        assert_eq!(reply.source_mac(), MacAddr::parse_loose("aa:aa:aa:aa:aa:02").unwrap());
    }

    fn test_status() -> crate::messaging::PresenceStatus {
        crate::messaging::PresenceStatus::Internal {
            ip: "10.0.0.9".parse().unwrap(),
            mac: MacAddr::parse_loose("aa:aa:aa:aa:aa:ff").unwrap(),
        }
    }

    fn build_arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
        use crate::frame::*;
        use byte_struct::ByteStruct;

        let header_len = 14;
        let mut out = vec![0u8; header_len + 28];
        let eth = crate::frame::EthernetHeader {
            destination_mac: MacAddr::BROADCAST,
            source_mac: sender_mac,
            ethertype: EtherType::Arp,
        };
        eth.write_bytes(&mut out[0..header_len]);
        // Hand-encode the ARP body directly; it's private to `frame`.
        out[header_len..header_len + 2].copy_from_slice(&1u16.to_be_bytes());
        out[header_len + 2..header_len + 4].copy_from_slice(&EtherType::Ip.as_u16().to_be_bytes());
        out[header_len + 4] = 6;
        out[header_len + 5] = 4;
        out[header_len + 6..header_len + 8].copy_from_slice(&1u16.to_be_bytes());
        out[header_len + 8..header_len + 14].copy_from_slice(sender_mac.as_bytes());
        out[header_len + 14..header_len + 18].copy_from_slice(&sender_ip.octets());
        out[header_len + 18..header_len + 24].copy_from_slice(&[0u8; 6]);
        out[header_len + 24..header_len + 28].copy_from_slice(&target_ip.octets());
        out
    }
}
