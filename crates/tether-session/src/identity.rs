//! Seams to the external identity service.
//!
//! Tether does not issue or check tickets itself. A platform identity
//! service does, and it plugs in through two traits:
//!
//! - [`TicketProvider`] on the client, asked once per connection for a
//!   proof of identity
//! - [`TicketValidator`] on the server, handed each ticket and answering
//!   later, from whatever thread it likes, through a [`ValidationSink`]
//!
//! Validation is fire-and-forget: the answer names the identity it is about,
//! not the request, and the server matches it back to a peer by identity.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tether_protocol::Identity;

use crate::IdentityError;

/// A ticket for one handshake attempt. Consumed when the request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTicket {
    pub identity: Identity,
    pub data: Vec<u8>,
}

/// The identity service's verdict on a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStatus {
    Ok,
    UserNotConnected,
    NoLicenseOrExpired,
    Banned,
    LoggedInElsewhere,
    CheckTimedOut,
    TicketCanceled,
    TicketAlreadyUsed,
    TicketInvalid,
    PublisherBanned,
}

impl ValidationStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::UserNotConnected => "user not connected to the service",
            Self::NoLicenseOrExpired => "no license or license expired",
            Self::Banned => "banned",
            Self::LoggedInElsewhere => "logged in elsewhere",
            Self::CheckTimedOut => "service check timed out",
            Self::TicketCanceled => "ticket canceled",
            Self::TicketAlreadyUsed => "ticket already used",
            Self::TicketInvalid => "ticket invalid",
            Self::PublisherBanned => "banned by publisher",
        };
        f.write_str(text)
    }
}

/// One asynchronous answer from the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// The identity the ticket was checked against.
    pub identity: Identity,
    /// Who owns the licence the identity is playing under. Usually the
    /// same as `identity`; differs for borrowed or shared licences.
    pub owner: Identity,
    pub status: ValidationStatus,
}

/// Where a [`TicketValidator`] delivers its answers.
///
/// Cloneable and callable from any thread. The server host installs one
/// that forwards into its input queue.
#[derive(Clone)]
pub struct ValidationSink {
    deliver: Arc<dyn Fn(ValidationOutcome) + Send + Sync>,
}

impl ValidationSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(ValidationOutcome) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Hands an outcome to the server.
    pub fn deliver(&self, outcome: ValidationOutcome) {
        (self.deliver)(outcome);
    }
}

/// How a listening server presents itself to the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerListing {
    pub name: String,
    pub max_peers: usize,
    pub port: u16,
}

impl fmt::Debug for ValidationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationSink").finish_non_exhaustive()
    }
}

/// Client side of the identity service.
///
/// # Example
///
/// ```rust
/// use tether_protocol::Identity;
/// use tether_session::{AuthTicket, IdentityError, TicketProvider};
///
/// /// Hands out the same ticket every time. Development only.
/// struct FixedTicket(u64);
///
/// impl TicketProvider for FixedTicket {
///     async fn acquire_ticket(&self) -> Result<AuthTicket, IdentityError> {
///         Ok(AuthTicket {
///             identity: Identity(self.0),
///             data: b"dev-ticket".to_vec(),
///         })
///     }
/// }
/// ```
pub trait TicketProvider: Send + Sync + 'static {
    /// Obtains a fresh ticket for the local identity.
    ///
    /// May take a while (a round trip to the service); the client host
    /// runs it on a separate task.
    fn acquire_ticket(
        &self,
    ) -> impl Future<Output = Result<AuthTicket, IdentityError>> + Send;

    /// Whether the service can be reached at all. The client host refuses
    /// to connect while this is `false`.
    fn is_available(&self) -> bool {
        true
    }
}

/// Server side of the identity service.
pub trait TicketValidator: Send + Sync + 'static {
    /// Called once, before any validation, with the sink outcomes must be
    /// delivered to.
    fn install(&self, sink: ValidationSink);

    /// Starts checking `ticket` against `identity`. Returns immediately.
    ///
    /// The verdict arrives later through the installed sink, possibly
    /// on another thread, possibly never.
    ///
    /// # Errors
    /// Any [`IdentityError`] the service raises while taking the request;
    /// no outcome will follow in that case.
    fn begin_validation(
        &self,
        ticket: &[u8],
        identity: Identity,
    ) -> Result<(), IdentityError>;

    /// Whether the service can be reached. The server host refuses to
    /// listen while this is `false`.
    fn is_available(&self) -> bool {
        true
    }

    /// Called when the server starts listening, so the service can show
    /// the server's name and capacity to players.
    fn advertise(&self, listing: &ServerListing) {
        let _ = listing;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_sink_clones_deliver_to_same_target() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let target = Arc::clone(&got);
        let sink = ValidationSink::new(move |o| target.lock().unwrap().push(o));
        let copy = sink.clone();

        let outcome = ValidationOutcome {
            identity: Identity(1),
            owner: Identity(1),
            status: ValidationStatus::Ok,
        };
        sink.deliver(outcome.clone());
        std::thread::spawn(move || copy.deliver(outcome)).join().unwrap();

        assert_eq!(got.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_only_ok_status_is_ok() {
        assert!(ValidationStatus::Ok.is_ok());
        assert!(!ValidationStatus::Banned.is_ok());
        assert!(!ValidationStatus::TicketInvalid.is_ok());
    }

    #[test]
    fn test_validator_defaults_available_and_ignore_listing() {
        struct Silent;
        impl TicketValidator for Silent {
            fn install(&self, _sink: ValidationSink) {}
            fn begin_validation(
                &self,
                _ticket: &[u8],
                _identity: Identity,
            ) -> Result<(), IdentityError> {
                Ok(())
            }
        }

        assert!(Silent.is_available());
        Silent.advertise(&ServerListing {
            name: "EU-1".into(),
            max_peers: 16,
            port: 27015,
        });
    }

    #[tokio::test]
    async fn test_ticket_provider_can_be_awaited_from_spawned_task() {
        struct Fixed;
        impl TicketProvider for Fixed {
            async fn acquire_ticket(&self) -> Result<AuthTicket, IdentityError> {
                Ok(AuthTicket {
                    identity: Identity(42),
                    data: b"abc".to_vec(),
                })
            }
        }

        let provider = Arc::new(Fixed);
        let ticket = tokio::spawn(async move { provider.acquire_ticket().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.identity, Identity(42));
    }
}
