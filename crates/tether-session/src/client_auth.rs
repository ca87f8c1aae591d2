//! Client side of the ticket handshake.
//!
//! Like the server side, [`ClientAuthenticator`] is a plain state machine:
//! the client host reports transport and identity-service events and
//! carries out the returned [`ClientAction`]s.

use std::fmt;

use tether_protocol::{AuthMessage, AuthStatus, Identity};

use crate::{AuthTicket, IdentityError};

/// Client handshake progress for the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthState {
    /// Not connected, or connected and not yet started.
    Idle,
    /// Waiting for the identity service to hand over a ticket.
    AcquiringTicket,
    /// Request sent, waiting for the server's verdict.
    AwaitingResponse,
    Authenticated,
    Failed,
}

/// Why the client gave up on a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No ticket could be obtained.
    Ticket(IdentityError),
    /// The server answered with a failure status.
    Rejected,
    /// The connection dropped mid-handshake.
    ConnectionLost,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticket(e) => write!(f, "{e}"),
            Self::Rejected => f.write_str("rejected by server"),
            Self::ConnectionLost => f.write_str("connection lost during handshake"),
        }
    }
}

/// Something the client host must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Ask the ticket provider for a ticket and report it back through
    /// [`ClientAuthenticator::on_ticket`] with the same `attempt`.
    AcquireTicket { attempt: u64 },
    /// Send this message to the server on the reliable channel.
    Send(AuthMessage),
    /// Tell the application the handshake succeeded.
    Authenticated { identity: Identity },
    /// Tell the application the handshake failed.
    AuthFailed { reason: AuthFailure },
    /// Close the connection.
    Disconnect,
}

/// Drives the client side of the handshake.
#[derive(Debug)]
pub struct ClientAuthenticator {
    state: ClientAuthState,
    attempt: u64,
    identity: Option<Identity>,
}

impl Default for ClientAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientAuthenticator {
    pub fn new() -> Self {
        Self {
            state: ClientAuthState::Idle,
            attempt: 0,
            identity: None,
        }
    }

    pub fn state(&self) -> ClientAuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ClientAuthState::Authenticated
    }

    /// The identity sent in the current attempt's request.
    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    /// The transport connected: start a new attempt.
    pub fn on_connected(&mut self) -> Vec<ClientAction> {
        self.attempt += 1;
        self.state = ClientAuthState::AcquiringTicket;
        self.identity = None;
        tracing::debug!(attempt = self.attempt, "acquiring ticket");
        vec![ClientAction::AcquireTicket {
            attempt: self.attempt,
        }]
    }

    /// The ticket provider finished for `attempt`.
    ///
    /// Results for any attempt other than the one currently waiting for a
    /// ticket are discarded.
    pub fn on_ticket(
        &mut self,
        attempt: u64,
        result: Result<AuthTicket, IdentityError>,
    ) -> Vec<ClientAction> {
        if attempt != self.attempt
            || self.state != ClientAuthState::AcquiringTicket
        {
            tracing::debug!(attempt, current = self.attempt, "stale ticket discarded");
            return Vec::new();
        }
        match result {
            Ok(AuthTicket { identity, data }) => {
                self.state = ClientAuthState::AwaitingResponse;
                self.identity = Some(identity);
                tracing::debug!(%identity, "sending auth request");
                vec![ClientAction::Send(AuthMessage::AuthRequest {
                    identity,
                    ticket: data,
                })]
            }
            Err(e) => {
                self.state = ClientAuthState::Failed;
                tracing::warn!(error = %e, "could not obtain a ticket");
                vec![
                    ClientAction::AuthFailed {
                        reason: AuthFailure::Ticket(e),
                    },
                    ClientAction::Disconnect,
                ]
            }
        }
    }

    /// A handshake message arrived from the server.
    pub fn on_auth_message(&mut self, message: AuthMessage) -> Vec<ClientAction> {
        let AuthMessage::AuthResponse { status } = message else {
            tracing::debug!("ignoring auth request sent by the server");
            return Vec::new();
        };
        self.on_response(status)
    }

    /// The server's verdict arrived.
    pub fn on_response(&mut self, status: AuthStatus) -> Vec<ClientAction> {
        if self.state != ClientAuthState::AwaitingResponse {
            tracing::debug!(?status, state = ?self.state, "unexpected auth response ignored");
            return Vec::new();
        }
        match (status, self.identity) {
            (AuthStatus::Ok, Some(identity)) => {
                self.state = ClientAuthState::Authenticated;
                tracing::info!(%identity, "authenticated");
                vec![ClientAction::Authenticated { identity }]
            }
            _ => {
                self.state = ClientAuthState::Failed;
                tracing::info!("authentication rejected by server");
                vec![
                    ClientAction::AuthFailed {
                        reason: AuthFailure::Rejected,
                    },
                    ClientAction::Disconnect,
                ]
            }
        }
    }

    /// The transport disconnected.
    ///
    /// Losing the connection mid-handshake fails the attempt.
    pub fn on_disconnected(&mut self) -> Vec<ClientAction> {
        let outstanding = matches!(
            self.state,
            ClientAuthState::AcquiringTicket | ClientAuthState::AwaitingResponse
        );
        self.state = ClientAuthState::Idle;
        if outstanding {
            vec![ClientAction::AuthFailed {
                reason: AuthFailure::ConnectionLost,
            }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(identity: u64) -> Result<AuthTicket, IdentityError> {
        Ok(AuthTicket {
            identity: Identity(identity),
            data: b"abc".to_vec(),
        })
    }

    #[test]
    fn test_on_connected_requests_ticket() {
        let mut c = ClientAuthenticator::new();
        assert_eq!(
            c.on_connected(),
            vec![ClientAction::AcquireTicket { attempt: 1 }]
        );
        assert_eq!(c.state(), ClientAuthState::AcquiringTicket);
    }

    #[test]
    fn test_on_ticket_sends_request() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();

        assert_eq!(
            c.on_ticket(1, ticket(42)),
            vec![ClientAction::Send(AuthMessage::AuthRequest {
                identity: Identity(42),
                ticket: b"abc".to_vec(),
            })]
        );
        assert_eq!(c.state(), ClientAuthState::AwaitingResponse);
        assert_eq!(c.identity(), Some(Identity(42)));
    }

    #[test]
    fn test_ok_response_authenticates() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        c.on_ticket(1, ticket(42));

        assert_eq!(
            c.on_response(AuthStatus::Ok),
            vec![ClientAction::Authenticated {
                identity: Identity(42)
            }]
        );
        assert!(c.is_authenticated());
        // Already decided.
        assert!(c.on_response(AuthStatus::Failed).is_empty());
    }

    #[test]
    fn test_failed_response_fails_and_disconnects() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        c.on_ticket(1, ticket(42));

        assert_eq!(
            c.on_response(AuthStatus::Failed),
            vec![
                ClientAction::AuthFailed {
                    reason: AuthFailure::Rejected
                },
                ClientAction::Disconnect,
            ]
        );
        assert_eq!(c.state(), ClientAuthState::Failed);
        // The disconnect that follows is not a second failure.
        assert!(c.on_disconnected().is_empty());
    }

    #[test]
    fn test_ticket_error_fails_and_disconnects() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        let err = IdentityError::TicketUnavailable("service down".into());

        assert_eq!(
            c.on_ticket(1, Err(err.clone())),
            vec![
                ClientAction::AuthFailed {
                    reason: AuthFailure::Ticket(err)
                },
                ClientAction::Disconnect,
            ]
        );
    }

    #[test]
    fn test_stale_ticket_is_discarded() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        c.on_disconnected();
        c.on_connected();

        assert!(c.on_ticket(1, ticket(42)).is_empty());
        assert_eq!(c.state(), ClientAuthState::AcquiringTicket);
        assert_eq!(c.on_ticket(2, ticket(42)).len(), 1);
    }

    #[test]
    fn test_ticket_after_disconnect_is_discarded() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        c.on_disconnected();

        assert!(c.on_ticket(1, ticket(42)).is_empty());
        assert_eq!(c.state(), ClientAuthState::Idle);
    }

    #[test]
    fn test_disconnect_while_waiting_reports_connection_lost() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        c.on_ticket(1, ticket(42));

        assert_eq!(
            c.on_disconnected(),
            vec![ClientAction::AuthFailed {
                reason: AuthFailure::ConnectionLost
            }]
        );
        assert_eq!(c.state(), ClientAuthState::Idle);
    }

    #[test]
    fn test_response_before_request_is_ignored() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        assert!(c.on_response(AuthStatus::Ok).is_empty());
        assert_eq!(c.state(), ClientAuthState::AcquiringTicket);
    }

    #[test]
    fn test_request_from_server_is_ignored() {
        let mut c = ClientAuthenticator::new();
        c.on_connected();
        c.on_ticket(1, ticket(1));
        let bogus = AuthMessage::AuthRequest {
            identity: Identity(1),
            ticket: vec![1],
        };
        assert!(c.on_auth_message(bogus).is_empty());
        assert_eq!(c.state(), ClientAuthState::AwaitingResponse);
    }
}
