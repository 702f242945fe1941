use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use particle_core::{Contact, PeerId};

/// Peer discovery boundary (a Kademlia lookup in a full deployment).
///
/// An empty result means no route is known; that is a normal outcome.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, peer: &PeerId) -> Vec<Contact>;
}

/// Resolver backed by a fixed contact book, for bootstrap lists and tests.
#[derive(Debug, Default)]
pub struct StaticResolver {
    contacts: RwLock<HashMap<PeerId, Vec<Contact>>>,
}

impl StaticResolver {
    /// Adds a candidate contact; earlier contacts are tried first.
    pub fn insert(&self, contact: Contact) {
        let mut contacts = self.contacts.write().unwrap_or_else(PoisonError::into_inner);
        let entry = contacts.entry(contact.peer_id).or_default();
        if !entry.contains(&contact) {
            entry.push(contact);
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        self.contacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
            .is_some()
    }
}

impl PeerResolver for StaticResolver {
    fn resolve(&self, peer: &PeerId) -> Vec<Contact> {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }
}
