//! The connection registry: every live peer on the server.
//!
//! # Concurrency note
//!
//! `ConnectionRegistry` is NOT thread-safe. It is a plain `HashMap` owned
//! by the server host task, and every mutation arrives through that task's
//! input queue, so mutations are serialized without a lock.

use std::collections::HashMap;

use tether_protocol::Identity;
use tether_transport::{ConnectionId, LinkId};

use crate::{AuthState, PeerSession, SessionError};

/// Tracks one [`PeerSession`] per live connection.
///
/// Keeps registration order so identity lookups are deterministic: when
/// more than one peer carries the same identity, the one registered first
/// wins.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: HashMap<ConnectionId, PeerSession>,
    /// Handles in registration order. Kept in sync with `peers`.
    order: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new peer.
    ///
    /// # Errors
    /// - [`SessionError::DuplicateHandle`] if `handle` is already present
    /// - [`SessionError::DuplicateLink`] if another peer already owns `link`
    ///
    /// Either way the existing entry is left untouched.
    pub fn add(
        &mut self,
        handle: ConnectionId,
        link: LinkId,
    ) -> Result<&PeerSession, SessionError> {
        if self.peers.contains_key(&handle) {
            return Err(SessionError::DuplicateHandle(handle));
        }
        if let Some(owner) = self.peers.values().find(|p| p.link() == link) {
            return Err(SessionError::DuplicateLink {
                link,
                owner: owner.handle(),
            });
        }
        self.peers.insert(handle, PeerSession::new(handle, link));
        self.order.push(handle);
        tracing::debug!(%handle, %link, "peer registered");
        Ok(self.peers.get(&handle).expect("just inserted"))
    }

    /// Removes a peer. No-op if it is not registered.
    pub fn remove(&mut self, handle: ConnectionId) -> Option<PeerSession> {
        let removed = self.peers.remove(&handle)?;
        self.order.retain(|h| *h != handle);
        tracing::debug!(%handle, "peer unregistered");
        Some(removed)
    }

    pub fn get(&self, handle: ConnectionId) -> Option<&PeerSession> {
        self.peers.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnectionId) -> Option<&mut PeerSession> {
        self.peers.get_mut(&handle)
    }

    /// The first peer, in registration order, carrying `identity`.
    pub fn find_by_identity(&self, identity: Identity) -> Option<&PeerSession> {
        self.iter().find(|p| p.identity() == Some(identity))
    }

    pub fn find_by_identity_mut(
        &mut self,
        identity: Identity,
    ) -> Option<&mut PeerSession> {
        let handle = self.find_by_identity(identity)?.handle();
        self.peers.get_mut(&handle)
    }

    /// Peers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.order.iter().filter_map(|h| self.peers.get(h))
    }

    /// How many peers are in `state`.
    pub fn count_in(&self, state: AuthState) -> usize {
        self.peers
            .values()
            .filter(|p| p.auth_state() == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
