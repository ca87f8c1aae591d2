//! Per-connection peer state on the server.

use std::time::Instant;

use tether_protocol::Identity;
use tether_transport::{ConnectionId, LinkId};

use crate::SessionError;

// ---------------------------------------------------------------------------
// AuthState
// ---------------------------------------------------------------------------

/// Where a peer is in the handshake.
///
/// ```text
///   Unauthenticated ──(request)──→ PendingValidation ──(Ok)──→ Authenticated
///          │                               │
///          └───(refused up front)──┐       └──(not Ok / timeout)──┐
///                                  ▼                              ▼
///                               Rejected ◄────────────────────────┘
/// ```
///
/// States only move forward; `Authenticated` and `Rejected` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    Unauthenticated,
    PendingValidation,
    Authenticated,
    Rejected,
}

impl AuthState {
    /// Whether `self → to` is a legal step.
    pub fn can_transition_to(self, to: AuthState) -> bool {
        use AuthState::*;
        matches!(
            (self, to),
            (Unauthenticated, PendingValidation)
                | (Unauthenticated, Rejected)
                | (PendingValidation, Authenticated)
                | (PendingValidation, Rejected)
        )
    }

    /// `Authenticated` or `Rejected`.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Authenticated | Self::Rejected)
    }
}

// ---------------------------------------------------------------------------
// PeerSession
// ---------------------------------------------------------------------------

/// The server's record of one accepted connection.
///
/// Created when the transport reports the connection, destroyed when it
/// goes away. The identity is recorded once, when the peer's auth request
/// arrives, and never changes afterwards.
#[derive(Debug, Clone)]
pub struct PeerSession {
    handle: ConnectionId,
    link: LinkId,
    identity: Option<Identity>,
    auth_state: AuthState,
    connected_at: Instant,
}

impl PeerSession {
    pub fn new(handle: ConnectionId, link: LinkId) -> Self {
        Self {
            handle,
            link,
            identity: None,
            auth_state: AuthState::Unauthenticated,
            connected_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> ConnectionId {
        self.handle
    }

    /// The underlying link connection.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// The asserted identity, once the auth request has arrived.
    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state == AuthState::Authenticated
    }

    /// Records the identity the peer asserted.
    ///
    /// # Errors
    /// [`SessionError::IdentityAlreadySet`] if one was recorded before.
    pub fn assign_identity(
        &mut self,
        identity: Identity,
    ) -> Result<(), SessionError> {
        if let Some(existing) = self.identity {
            return Err(SessionError::IdentityAlreadySet {
                handle: self.handle,
                identity: existing,
            });
        }
        self.identity = Some(identity);
        Ok(())
    }

    /// Moves the handshake forward.
    ///
    /// # Errors
    /// [`SessionError::InvalidTransition`] for any step
    /// [`AuthState::can_transition_to`] does not allow. The state is left
    /// unchanged.
    pub fn transition(&mut self, to: AuthState) -> Result<(), SessionError> {
        if !self.auth_state.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                handle: self.handle,
                from: self.auth_state,
                to,
            });
        }
        tracing::trace!(handle = %self.handle, from = ?self.auth_state, ?to, "auth state");
        self.auth_state = to;
        Ok(())
    }
}
