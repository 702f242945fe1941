use std::collections::{HashSet, VecDeque};
use std::fmt;

use particle_core::{Contact, PeerId};

/// Coarse per-adapter transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_queued: u64,
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub last_error: Option<String>,
}

/// Byte-oriented transport contract used by the dispatch driver.
pub trait TransportAdapter: Send {
    /// Transport-specific send error.
    type Error: fmt::Display;

    /// Attempts delivery of a serialized particle to one contact.
    fn send(&mut self, contact: &Contact, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Returns the next inbound payload and its sending peer.
    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)>;

    /// Best-effort transport health counters for ops decisions.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// In-memory adapter for tests and loopback deployments.
///
/// Sends to unreachable peers or addresses fail, which lets callers exercise
/// alternate-contact routing.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAdapter {
    inbound: VecDeque<(PeerId, Vec<u8>)>,
    outbound: Vec<(Contact, Vec<u8>)>,
    unreachable_peers: HashSet<PeerId>,
    unreachable_addresses: HashSet<String>,
    send_ok: u64,
    send_err: u64,
    recv_ok: u64,
    last_error: Option<String>,
}

impl InMemoryAdapter {
    /// Queues bytes as inbound traffic from `peer`.
    pub fn enqueue_inbound(&mut self, peer: PeerId, bytes: Vec<u8>) {
        self.inbound.push_back((peer, bytes));
    }

    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&mut self) -> Vec<(Contact, Vec<u8>)> {
        std::mem::take(&mut self.outbound)
    }

    /// Makes every send to `peer` fail until cleared.
    pub fn set_peer_reachable(&mut self, peer: PeerId, reachable: bool) {
        if reachable {
            self.unreachable_peers.remove(&peer);
        } else {
            self.unreachable_peers.insert(peer);
        }
    }

    /// Makes sends to a contact whose first address is `address` fail.
    pub fn set_address_reachable(&mut self, address: impl Into<String>, reachable: bool) {
        let address = address.into();
        if reachable {
            self.unreachable_addresses.remove(&address);
        } else {
            self.unreachable_addresses.insert(address);
        }
    }

    fn reachable(&self, contact: &Contact) -> bool {
        if self.unreachable_peers.contains(&contact.peer_id) {
            return false;
        }
        contact
            .addresses
            .first()
            .map_or(true, |addr| !self.unreachable_addresses.contains(addr))
    }
}

/// Routes all captured outbound messages from one in-memory adapter into
/// another adapter's inbound queue, tagging them as sent by `from_peer`.
pub fn route_in_memory_outbound(
    from_adapter: &mut InMemoryAdapter,
    to_adapter: &mut InMemoryAdapter,
    from_peer: PeerId,
) -> usize {
    let outbound = from_adapter.take_outbound();
    let moved = outbound.len();
    for (_, bytes) in outbound {
        to_adapter.enqueue_inbound(from_peer, bytes);
    }
    moved
}

impl TransportAdapter for InMemoryAdapter {
    type Error = &'static str;

    fn send(&mut self, contact: &Contact, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.reachable(contact) {
            self.send_err += 1;
            self.last_error = Some("peer unreachable".to_string());
            return Err("peer unreachable");
        }
        self.outbound.push((contact.clone(), bytes.to_vec()));
        self.send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)> {
        let msg = self.inbound.pop_front();
        if msg.is_some() {
            self.recv_ok += 1;
        }
        msg
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_queued: self.outbound.len() as u64,
            outbound_send_ok: self.send_ok,
            outbound_send_err: self.send_err,
            inbound_received: self.recv_ok,
            last_error: self.last_error.clone(),
        }
    }
}
