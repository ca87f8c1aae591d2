//! Server side of the ticket handshake.
//!
//! [`ServerAuthenticator`] does no I/O of its own. The server host feeds it
//! whatever happened (a peer connected, a request arrived, the validator
//! answered, a timer fired) together with the registry, and carries out the
//! [`ServerAction`]s it returns, in order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{AuthMessage, AuthStatus, Identity};
use tether_transport::{ConnectionId, LinkId};

use crate::{
    AuthConfig, AuthState, ConnectionRegistry, IdentityError, PeerSession,
    SessionError, TicketValidator, ValidationOutcome, ValidationStatus,
};

/// Why a peer was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The identity service said no.
    Validation(ValidationStatus),
    /// The identity service never answered.
    TimedOut,
    /// Another live peer already holds the identity.
    IdentityInUse,
    /// The request broke a protocol rule.
    Malformed(String),
    /// The identity service refused to take the request.
    ServiceRefused(IdentityError),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(status) => write!(f, "validation failed: {status}"),
            Self::TimedOut => f.write_str("validation timed out"),
            Self::IdentityInUse => f.write_str("identity already in use"),
            Self::Malformed(why) => write!(f, "malformed request: {why}"),
            Self::ServiceRefused(e) => write!(f, "{e}"),
        }
    }
}

/// Something the server host must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Send `AuthResponse { status }` to the peer on the reliable channel.
    Respond {
        handle: ConnectionId,
        status: AuthStatus,
    },
    /// Tell the application the peer is authenticated.
    Authenticated {
        handle: ConnectionId,
        identity: Identity,
    },
    /// Tell the application the peer was rejected.
    Rejected {
        handle: ConnectionId,
        identity: Identity,
        reason: RejectReason,
    },
    /// Call [`ServerAuthenticator::on_validation_timeout`] for the peer
    /// after `after`, unless cancelled first.
    StartValidationTimer {
        handle: ConnectionId,
        after: Duration,
    },
    /// Disconnect the peer after `after`, unless cancelled first.
    ScheduleDisconnect {
        handle: ConnectionId,
        after: Duration,
    },
    /// Drop every pending timer for the peer.
    CancelTimers { handle: ConnectionId },
}

/// Drives the server side of the handshake for every peer.
pub struct ServerAuthenticator<V> {
    validator: Arc<V>,
    config: AuthConfig,
}

impl<V: TicketValidator> ServerAuthenticator<V> {
    pub fn new(validator: Arc<V>, config: AuthConfig) -> Self {
        Self { validator, config }
    }

    pub fn validator(&self) -> &Arc<V> {
        &self.validator
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Registers a freshly connected peer as `Unauthenticated`.
    ///
    /// # Errors
    /// [`SessionError::DuplicateHandle`] or [`SessionError::DuplicateLink`]
    /// if the handle or the link is already registered.
    pub fn on_connected(
        &self,
        registry: &mut ConnectionRegistry,
        handle: ConnectionId,
        link: LinkId,
    ) -> Result<(), SessionError> {
        registry.add(handle, link)?;
        Ok(())
    }

    /// Handles a handshake message from a peer.
    ///
    /// A valid request from a fresh peer records the identity, moves the
    /// peer to `PendingValidation` and submits the ticket. Repeated
    /// requests, requests from unknown handles and responses (which only
    /// servers send) are ignored. Malformed requests, identity collisions
    /// and synchronous validator failures reject the peer on the spot.
    pub fn on_auth_message(
        &self,
        registry: &mut ConnectionRegistry,
        handle: ConnectionId,
        message: AuthMessage,
    ) -> Vec<ServerAction> {
        let verdict = message.validate();
        let AuthMessage::AuthRequest { identity, ticket } = message else {
            tracing::debug!(%handle, "ignoring auth response sent by a client");
            return Vec::new();
        };

        let Some(peer) = registry.get(handle) else {
            tracing::debug!(%handle, "auth request from unknown handle");
            return Vec::new();
        };
        if let Some(existing) = peer.identity() {
            tracing::debug!(%handle, %existing, "repeated auth request ignored");
            return Vec::new();
        }

        if let Err(e) = verdict {
            return self.reject_early(
                registry,
                handle,
                identity,
                RejectReason::Malformed(e.to_string()),
            );
        }

        let collides = registry.iter().any(|p| {
            p.handle() != handle
                && p.identity() == Some(identity)
                && p.auth_state() != AuthState::Rejected
        });
        if collides {
            return self.reject_early(
                registry,
                handle,
                identity,
                RejectReason::IdentityInUse,
            );
        }

        let Some(peer) = registry.get_mut(handle) else {
            return Vec::new();
        };
        if !admit(peer, identity, AuthState::PendingValidation) {
            return Vec::new();
        }
        tracing::info!(%handle, %identity, "auth request received, validating");

        match self.validator.begin_validation(&ticket, identity) {
            Ok(()) => match self.config.validation_timeout() {
                Some(after) => {
                    vec![ServerAction::StartValidationTimer { handle, after }]
                }
                None => Vec::new(),
            },
            Err(e) => {
                tracing::warn!(%handle, %identity, error = %e, "validator refused request");
                if !step(peer, AuthState::Rejected) {
                    return Vec::new();
                }
                self.rejection(handle, identity, RejectReason::ServiceRefused(e))
            }
        }
    }

    /// Applies an answer from the identity service.
    ///
    /// The answer goes to the first peer, in registration order, that
    /// carries the identity and is still `PendingValidation`. If no such
    /// peer exists (it disconnected, or was already decided) the answer is
    /// discarded.
    pub fn on_validation(
        &self,
        registry: &mut ConnectionRegistry,
        outcome: ValidationOutcome,
    ) -> Vec<ServerAction> {
        let ValidationOutcome {
            identity,
            owner,
            status,
        } = outcome;

        let target = registry
            .iter()
            .find(|p| {
                p.identity() == Some(identity)
                    && p.auth_state() == AuthState::PendingValidation
            })
            .map(PeerSession::handle);
        let Some(handle) = target else {
            if registry.find_by_identity(identity).is_some() {
                tracing::debug!(%identity, %status, "validation for already decided peer discarded");
            } else {
                tracing::debug!(%identity, %status, "validation for unknown identity discarded");
            }
            return Vec::new();
        };
        let Some(peer) = registry.get_mut(handle) else {
            return Vec::new();
        };

        if status.is_ok() {
            if !step(peer, AuthState::Authenticated) {
                return Vec::new();
            }
            tracing::info!(%handle, %identity, %owner, "peer authenticated");
            vec![
                ServerAction::CancelTimers { handle },
                ServerAction::Respond {
                    handle,
                    status: AuthStatus::Ok,
                },
                ServerAction::Authenticated { handle, identity },
            ]
        } else {
            if !step(peer, AuthState::Rejected) {
                return Vec::new();
            }
            let mut actions = vec![ServerAction::CancelTimers { handle }];
            actions.extend(self.rejection(
                handle,
                identity,
                RejectReason::Validation(status),
            ));
            actions
        }
    }

    /// The validation timer for `handle` fired.
    ///
    /// Rejects the peer if it is still waiting; otherwise does nothing.
    pub fn on_validation_timeout(
        &self,
        registry: &mut ConnectionRegistry,
        handle: ConnectionId,
    ) -> Vec<ServerAction> {
        let Some(peer) = registry.get_mut(handle) else {
            return Vec::new();
        };
        if peer.auth_state() != AuthState::PendingValidation {
            return Vec::new();
        }
        let Some(identity) = peer.identity() else {
            return Vec::new();
        };
        if !step(peer, AuthState::Rejected) {
            return Vec::new();
        }
        tracing::warn!(%handle, %identity, "no validation answer in time");
        self.rejection(handle, identity, RejectReason::TimedOut)
    }

    /// Forgets a peer whose connection is gone.
    ///
    /// Any validation still in flight for it is left alone; when its answer
    /// arrives it will find no pending peer and be discarded.
    pub fn on_disconnected(
        &self,
        registry: &mut ConnectionRegistry,
        handle: ConnectionId,
    ) -> Vec<ServerAction> {
        match registry.remove(handle) {
            Some(peer) => {
                tracing::debug!(%handle, state = ?peer.auth_state(), "peer gone");
                vec![ServerAction::CancelTimers { handle }]
            }
            None => Vec::new(),
        }
    }

    fn reject_early(
        &self,
        registry: &mut ConnectionRegistry,
        handle: ConnectionId,
        identity: Identity,
        reason: RejectReason,
    ) -> Vec<ServerAction> {
        let Some(peer) = registry.get_mut(handle) else {
            return Vec::new();
        };
        if !admit(peer, identity, AuthState::Rejected) {
            return Vec::new();
        }
        self.rejection(handle, identity, reason)
    }

    fn rejection(
        &self,
        handle: ConnectionId,
        identity: Identity,
        reason: RejectReason,
    ) -> Vec<ServerAction> {
        tracing::info!(%handle, %identity, %reason, "peer rejected");
        vec![
            ServerAction::Respond {
                handle,
                status: AuthStatus::Failed,
            },
            ServerAction::Rejected {
                handle,
                identity,
                reason,
            },
            ServerAction::ScheduleDisconnect {
                handle,
                after: self.config.grace_delay(),
            },
        ]
    }
}

/// Records the identity and takes the first step. Logs and returns `false`
/// if the peer's state does not allow it.
fn admit(peer: &mut PeerSession, identity: Identity, to: AuthState) -> bool {
    if let Err(e) = peer.assign_identity(identity) {
        tracing::error!(error = %e, "cannot record identity");
        return false;
    }
    step(peer, to)
}

fn step(peer: &mut PeerSession, to: AuthState) -> bool {
    match peer.transition(to) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "auth state machine violated");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tether_protocol::MAX_TICKET_LEN;

    use super::*;
    use crate::ValidationSink;

    #[derive(Default)]
    struct RecordingValidator {
        submitted: Mutex<Vec<(Vec<u8>, Identity)>>,
        refuse: bool,
    }

    impl TicketValidator for RecordingValidator {
        fn install(&self, _sink: ValidationSink) {}

        fn begin_validation(
            &self,
            ticket: &[u8],
            identity: Identity,
        ) -> Result<(), IdentityError> {
            if self.refuse {
                return Err(IdentityError::ServiceUnavailable("offline".into()));
            }
            self.submitted.lock().unwrap().push((ticket.to_vec(), identity));
            Ok(())
        }
    }

    fn h(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    fn setup(validator: RecordingValidator) -> (ServerAuthenticator<RecordingValidator>, ConnectionRegistry) {
        let auth = ServerAuthenticator::new(Arc::new(validator), AuthConfig::default());
        (auth, ConnectionRegistry::new())
    }

    fn connect(
        auth: &ServerAuthenticator<RecordingValidator>,
        reg: &mut ConnectionRegistry,
        n: u64,
    ) {
        auth.on_connected(reg, h(n), LinkId::new(n)).unwrap();
    }

    fn request(identity: u64, ticket: &[u8]) -> AuthMessage {
        AuthMessage::AuthRequest {
            identity: Identity(identity),
            ticket: ticket.to_vec(),
        }
    }

    fn outcome(identity: u64, status: ValidationStatus) -> ValidationOutcome {
        ValidationOutcome {
            identity: Identity(identity),
            owner: Identity(identity),
            status,
        }
    }

    fn rejection_of(handle: ConnectionId, identity: u64, reason: RejectReason) -> Vec<ServerAction> {
        vec![
            ServerAction::Respond {
                handle,
                status: AuthStatus::Failed,
            },
            ServerAction::Rejected {
                handle,
                identity: Identity(identity),
                reason,
            },
            ServerAction::ScheduleDisconnect {
                handle,
                after: Duration::from_secs(1),
            },
        ]
    }

    #[test]
    fn test_on_connected_twice_fails_with_duplicate() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        assert_eq!(
            auth.on_connected(&mut reg, h(1), LinkId::new(99)),
            Err(SessionError::DuplicateHandle(h(1)))
        );
    }

    #[test]
    fn test_on_auth_message_submits_and_starts_timer() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);

        let actions = auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        assert_eq!(
            actions,
            vec![ServerAction::StartValidationTimer {
                handle: h(1),
                after: Duration::from_secs(30),
            }]
        );
        assert_eq!(
            *auth.validator().submitted.lock().unwrap(),
            vec![(b"abc".to_vec(), Identity(42))]
        );
        let peer = reg.get(h(1)).unwrap();
        assert_eq!(peer.identity(), Some(Identity(42)));
        assert_eq!(peer.auth_state(), AuthState::PendingValidation);
    }

    #[test]
    fn test_on_auth_message_without_timeout_starts_no_timer() {
        let validator = Arc::new(RecordingValidator::default());
        let auth = ServerAuthenticator::new(
            validator,
            AuthConfig {
                validation_timeout_ms: 0,
                ..AuthConfig::default()
            },
        );
        let mut reg = ConnectionRegistry::new();
        auth.on_connected(&mut reg, h(1), LinkId::new(1)).unwrap();

        assert!(auth.on_auth_message(&mut reg, h(1), request(1, b"t")).is_empty());
    }

    #[test]
    fn test_on_validation_ok_authenticates_once() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        let actions = auth.on_validation(&mut reg, outcome(42, ValidationStatus::Ok));

        assert_eq!(
            actions,
            vec![
                ServerAction::CancelTimers { handle: h(1) },
                ServerAction::Respond {
                    handle: h(1),
                    status: AuthStatus::Ok,
                },
                ServerAction::Authenticated {
                    handle: h(1),
                    identity: Identity(42),
                },
            ]
        );
        assert!(reg.get(h(1)).unwrap().is_authenticated());

        // A duplicate answer changes nothing.
        assert!(auth.on_validation(&mut reg, outcome(42, ValidationStatus::Ok)).is_empty());
        assert_eq!(reg.count_in(AuthState::Authenticated), 1);
    }

    #[test]
    fn test_on_validation_failure_rejects_with_grace() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        let actions = auth.on_validation(&mut reg, outcome(42, ValidationStatus::Banned));

        let mut expected = vec![ServerAction::CancelTimers { handle: h(1) }];
        expected.extend(rejection_of(
            h(1),
            42,
            RejectReason::Validation(ValidationStatus::Banned),
        ));
        assert_eq!(actions, expected);
        assert_eq!(reg.get(h(1)).unwrap().auth_state(), AuthState::Rejected);
    }

    #[test]
    fn test_on_validation_after_disconnect_is_discarded() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        auth.on_auth_message(&mut reg, h(1), request(7, b"abc"));

        assert_eq!(
            auth.on_disconnected(&mut reg, h(1)),
            vec![ServerAction::CancelTimers { handle: h(1) }]
        );
        let actions = auth.on_validation(&mut reg, outcome(7, ValidationStatus::Ok));

        assert!(actions.is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_on_disconnected_unknown_handle_is_noop() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        assert!(auth.on_disconnected(&mut reg, h(5)).is_empty());
    }

    #[test]
    fn test_repeated_request_is_ignored() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        let actions = auth.on_auth_message(&mut reg, h(1), request(43, b"xyz"));

        assert!(actions.is_empty());
        assert_eq!(auth.validator().submitted.lock().unwrap().len(), 1);
        assert_eq!(reg.get(h(1)).unwrap().identity(), Some(Identity(42)));
    }

    #[test]
    fn test_colliding_identity_rejects_newcomer() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        connect(&auth, &mut reg, 2);
        auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        let actions = auth.on_auth_message(&mut reg, h(2), request(42, b"abc"));

        assert_eq!(actions, rejection_of(h(2), 42, RejectReason::IdentityInUse));
        assert_eq!(auth.validator().submitted.lock().unwrap().len(), 1);
        assert_eq!(
            reg.get(h(1)).unwrap().auth_state(),
            AuthState::PendingValidation
        );

        // The first holder still gets its answer.
        let actions = auth.on_validation(&mut reg, outcome(42, ValidationStatus::Ok));
        assert!(actions.contains(&ServerAction::Authenticated {
            handle: h(1),
            identity: Identity(42),
        }));
    }

    #[test]
    fn test_identity_of_rejected_peer_can_be_reused() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        auth.on_auth_message(&mut reg, h(1), request(9, b"old"));
        auth.on_validation(&mut reg, outcome(9, ValidationStatus::TicketInvalid));
        connect(&auth, &mut reg, 2);

        auth.on_auth_message(&mut reg, h(2), request(9, b"new"));
        let actions = auth.on_validation(&mut reg, outcome(9, ValidationStatus::Ok));

        assert!(actions.contains(&ServerAction::Authenticated {
            handle: h(2),
            identity: Identity(9),
        }));
        assert_eq!(reg.get(h(1)).unwrap().auth_state(), AuthState::Rejected);
    }

    #[test]
    fn test_malformed_ticket_rejected_without_submission() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        connect(&auth, &mut reg, 2);

        let empty = auth.on_auth_message(&mut reg, h(1), request(1, b""));
        let huge = auth.on_auth_message(&mut reg, h(2), request(2, &vec![0; MAX_TICKET_LEN + 1]));

        assert!(matches!(
            empty.get(1),
            Some(ServerAction::Rejected { reason: RejectReason::Malformed(_), .. })
        ));
        assert!(matches!(
            huge.get(1),
            Some(ServerAction::Rejected { reason: RejectReason::Malformed(_), .. })
        ));
        assert!(auth.validator().submitted.lock().unwrap().is_empty());
        assert_eq!(reg.count_in(AuthState::Rejected), 2);
    }

    #[test]
    fn test_validator_refusal_rejects_immediately() {
        let (auth, mut reg) = setup(RecordingValidator {
            refuse: true,
            ..Default::default()
        });
        connect(&auth, &mut reg, 1);

        let actions = auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        assert_eq!(
            actions,
            rejection_of(
                h(1),
                42,
                RejectReason::ServiceRefused(IdentityError::ServiceUnavailable(
                    "offline".into()
                )),
            )
        );
        assert_eq!(reg.get(h(1)).unwrap().auth_state(), AuthState::Rejected);
    }

    #[test]
    fn test_validation_timeout_rejects_pending_peer_only() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        connect(&auth, &mut reg, 2);
        auth.on_auth_message(&mut reg, h(1), request(42, b"abc"));

        assert_eq!(
            auth.on_validation_timeout(&mut reg, h(1)),
            rejection_of(h(1), 42, RejectReason::TimedOut)
        );
        // Not pending: nothing to do.
        assert!(auth.on_validation_timeout(&mut reg, h(2)).is_empty());
        assert!(auth.on_validation_timeout(&mut reg, h(1)).is_empty());
        assert!(auth.on_validation_timeout(&mut reg, h(3)).is_empty());

        // A late answer after the timeout is discarded.
        assert!(auth.on_validation(&mut reg, outcome(42, ValidationStatus::Ok)).is_empty());
    }

    #[test]
    fn test_auth_response_from_client_is_ignored() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        connect(&auth, &mut reg, 1);
        let bogus = AuthMessage::AuthResponse {
            status: AuthStatus::Ok,
        };
        assert!(auth.on_auth_message(&mut reg, h(1), bogus).is_empty());
        assert_eq!(reg.get(h(1)).unwrap().auth_state(), AuthState::Unauthenticated);
    }

    #[test]
    fn test_request_from_unknown_handle_is_ignored() {
        let (auth, mut reg) = setup(RecordingValidator::default());
        assert!(auth.on_auth_message(&mut reg, h(3), request(1, b"a")).is_empty());
        assert!(auth.validator().submitted.lock().unwrap().is_empty());
    }
}
