use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether::prelude::*;
use tether::telemetry::init_tracing;
use tokio::sync::mpsc;

/// How long the dev service takes to issue a ticket.
const ISSUE_LATENCY: Duration = Duration::from_millis(20);
/// How long the dev service takes to check one.
const CHECK_LATENCY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Development identity service
// ---------------------------------------------------------------------------

/// Stand-in for a platform identity service. Issues single-use tickets and
/// checks them on its own thread, the way a real service calls back.
#[derive(Clone, Default)]
struct DevIdentityService {
    state: Arc<Mutex<DevState>>,
}

#[derive(Default)]
struct DevState {
    sink: Option<ValidationSink>,
    banned: HashSet<Identity>,
    outstanding: HashMap<Identity, Vec<u8>>,
    redeemed: HashSet<Vec<u8>>,
    next_nonce: u64,
}

impl DevIdentityService {
    fn ban(&self, identity: Identity) {
        self.lock().banned.insert(identity);
    }

    fn issue(&self, identity: Identity) -> AuthTicket {
        let mut state = self.lock();
        state.next_nonce += 1;
        let data = format!("dev:{}:{}", identity.0, state.next_nonce).into_bytes();
        state.outstanding.insert(identity, data.clone());
        AuthTicket { identity, data }
    }

    fn check(&self, ticket: &[u8], identity: Identity) -> ValidationStatus {
        let mut state = self.lock();
        if state.banned.contains(&identity) {
            return ValidationStatus::Banned;
        }
        if state.redeemed.contains(ticket) {
            return ValidationStatus::TicketAlreadyUsed;
        }
        match state.outstanding.get(&identity) {
            Some(expected) if expected.as_slice() == ticket => {
                state.outstanding.remove(&identity);
                state.redeemed.insert(ticket.to_vec());
                ValidationStatus::Ok
            }
            _ => ValidationStatus::TicketInvalid,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DevState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TicketValidator for DevIdentityService {
    fn install(&self, sink: ValidationSink) {
        self.lock().sink = Some(sink);
    }

    fn begin_validation(
        &self,
        ticket: &[u8],
        identity: Identity,
    ) -> Result<(), IdentityError> {
        let sink = self.lock().sink.clone().ok_or_else(|| {
            IdentityError::ServiceUnavailable("validator not installed".into())
        })?;
        let service = self.clone();
        let ticket = ticket.to_vec();
        std::thread::spawn(move || {
            std::thread::sleep(CHECK_LATENCY);
            let status = service.check(&ticket, identity);
            sink.deliver(ValidationOutcome {
                identity,
                owner: identity,
                status,
            });
        });
        Ok(())
    }

    fn advertise(&self, listing: &ServerListing) {
        tracing::info!(
            name = %listing.name,
            max_peers = listing.max_peers,
            port = listing.port,
            "server listed"
        );
    }
}

struct DevTicketProvider {
    service: DevIdentityService,
    identity: Identity,
}

impl TicketProvider for DevTicketProvider {
    async fn acquire_ticket(&self) -> Result<AuthTicket, IdentityError> {
        tokio::time::sleep(ISSUE_LATENCY).await;
        Ok(self.service.issue(self.identity))
    }
}

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

fn start_server(
    config: ServerConfig,
    service: &DevIdentityService,
) -> Result<(ServerHandle, tokio::task::JoinHandle<Result<(), TetherError>>), TetherError> {
    let mut server = ServerHostBuilder::new()
        .config(config)
        .build(WebSocketLink::new(), service.clone())?;

    // Echo whatever authenticated players send.
    let echo = server.handle();
    server.events().subscribe(move |event| match event {
        ServerEvent::Message {
            handle,
            channel,
            data,
        } => {
            let echo = echo.clone();
            let (handle, channel, data) = (*handle, *channel, data.clone());
            tokio::spawn(async move {
                if let Err(e) = echo.send(handle, channel, data).await {
                    tracing::warn!(%handle, error = %e, "echo failed");
                }
            });
        }
        other => tracing::info!(event = ?other, "server"),
    });

    server.listen()?;
    let handle = server.handle();
    Ok((handle, tokio::spawn(server.run())))
}

fn start_player(
    service: &DevIdentityService,
    identity: Identity,
    port: u16,
) -> Result<(ClientHandle, mpsc::UnboundedReceiver<ClientEvent>), TetherError> {
    let provider = DevTicketProvider {
        service: service.clone(),
        identity,
    };
    let mut client = ClientHostBuilder::new()
        .port(port)
        .build(WebSocketLink::new(), provider)?;

    let (tx, rx) = mpsc::unbounded_channel();
    client.events().subscribe(move |event: &ClientEvent| {
        tracing::info!(%identity, event = ?event, "player");
        let _ = tx.send(event.clone());
    });

    client.connect("127.0.0.1")?;
    let handle = client.handle();
    tokio::spawn(client.run());
    Ok((handle, rx))
}

/// Waits up to five seconds for an event matching `want`.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    want: impl Fn(&ClientEvent) -> bool,
) -> Option<ClientEvent> {
    let search = async {
        while let Some(event) = events.recv().await {
            if want(&event) {
                return Some(event);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), search)
        .await
        .ok()
        .flatten()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info,tether=debug");

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig {
            server_name: "loopback".into(),
            ..ServerConfig::default()
        },
    };
    let port = config.transport.port;

    let service = DevIdentityService::default();
    service.ban(Identity(13));

    let (server, server_task) = start_server(config, &service)?;
    let (alice, mut alice_events) = start_player(&service, Identity(42), port)?;
    let (mallory, mut mallory_events) = start_player(&service, Identity(13), port)?;

    if wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Authenticated { .. }))
        .await
        .is_some()
    {
        alice
            .send(Channel::Reliable, b"hello from ID-42".to_vec())
            .await?;
        if let Some(ClientEvent::Message { data, .. }) =
            wait_for(&mut alice_events, |e| matches!(e, ClientEvent::Message { .. })).await
        {
            tracing::info!(echo = %String::from_utf8_lossy(&data), "alice got her echo");
        }
    }

    if let Some(ClientEvent::AuthFailed { reason }) =
        wait_for(&mut mallory_events, |e| matches!(e, ClientEvent::AuthFailed { .. })).await
    {
        tracing::info!(%reason, "mallory was turned away");
    }

    for peer in server.peers().await? {
        tracing::info!(
            handle = %peer.handle,
            identity = ?peer.identity,
            state = ?peer.state,
            address = peer.address.as_deref().unwrap_or("unknown"),
            "still connected"
        );
    }

    alice.stop()?;
    mallory.stop()?;
    server.stop()?;
    server_task.await??;
    Ok(())
}
