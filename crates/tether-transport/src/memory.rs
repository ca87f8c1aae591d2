//! In-process link.
//!
//! A [`MemoryNetwork`] is a tiny switchboard shared by any number of
//! [`MemoryLink`]s. It understands both direct and relay endpoints, delivers
//! every message in send order, and never drops anything, which makes it
//! the link of choice for deterministic tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::{
    Channel, Endpoint, Link, LinkEvent, LinkId, SendError, TransportError,
};

type NodeId = u64;

/// A shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    next_node: NodeId,
    next_link: u64,
    mailboxes: HashMap<NodeId, Mailbox>,
    listeners: HashMap<Endpoint, NodeId>,
    routes: HashMap<LinkId, Route>,
    offline: bool,
}

struct Mailbox {
    events: VecDeque<LinkEvent>,
    notify: Arc<Notify>,
}

/// One end of an established pipe.
#[derive(Clone, Copy)]
struct Route {
    owner: NodeId,
    peer: LinkId,
    remote: Remote,
}

/// What one end of a pipe sees on the other side.
#[derive(Clone, Copy)]
enum Remote {
    /// The connecting link, named by its node.
    Node(NodeId),
    /// The endpoint that was dialled.
    Endpoint(Endpoint),
}

impl Hub {
    fn allocate_link(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId::new(self.next_link)
    }

    fn deliver(&mut self, node: NodeId, event: LinkEvent) {
        if let Some(mailbox) = self.mailboxes.get_mut(&node) {
            mailbox.events.push_back(event);
            mailbox.notify.notify_one();
        }
    }

    /// Tears down both ends of the pipe `link` belongs to and tells the
    /// other side.
    fn hang_up(&mut self, link: LinkId) {
        let Some(route) = self.routes.remove(&link) else {
            return;
        };
        if let Some(peer) = self.routes.remove(&route.peer) {
            self.deliver(peer.owner, LinkEvent::Disconnected(route.peer));
        }
    }
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new link to this network.
    pub fn link(&self) -> MemoryLink {
        let notify = Arc::new(Notify::new());
        let mut hub = self.lock();
        hub.next_node += 1;
        let node = hub.next_node;
        hub.mailboxes.insert(
            node,
            Mailbox {
                events: VecDeque::new(),
                notify: Arc::clone(&notify),
            },
        );
        MemoryLink {
            network: self.clone(),
            node,
            notify,
        }
    }

    /// Returns `true` if some link is listening on `endpoint`.
    pub fn is_listening(&self, endpoint: &Endpoint) -> bool {
        self.lock().listeners.contains_key(endpoint)
    }

    /// Takes the whole network down (or brings it back). While it is down
    /// every link reports itself unavailable.
    pub fn set_available(&self, available: bool) {
        self.lock().offline = !available;
    }

    /// Number of established pipes on the network.
    pub fn open_connections(&self) -> usize {
        self.lock().routes.len() / 2
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A link attached to a [`MemoryNetwork`].
///
/// Dropping it closes every connection it owns and releases its listener.
pub struct MemoryLink {
    network: MemoryNetwork,
    node: NodeId,
    notify: Arc<Notify>,
}

impl MemoryLink {
    fn owned_route(hub: &Hub, node: NodeId, link: LinkId) -> Option<Route> {
        hub.routes.get(&link).copied().filter(|r| r.owner == node)
    }
}

impl Link for MemoryLink {
    fn listen(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let mut hub = self.network.lock();
        if hub.listeners.contains_key(endpoint) {
            return Err(TransportError::BindFailed(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{endpoint} is already in use"),
            )));
        }
        hub.listeners.insert(*endpoint, self.node);
        tracing::debug!(%endpoint, "memory link listening");
        Ok(())
    }

    fn stop_listening(&mut self) {
        let node = self.node;
        self.network.lock().listeners.retain(|_, owner| *owner != node);
    }

    fn connect(
        &mut self,
        endpoint: &Endpoint,
    ) -> Result<LinkId, TransportError> {
        let mut hub = self.network.lock();
        let local = hub.allocate_link();

        let Some(server) = hub.listeners.get(endpoint).copied() else {
            hub.deliver(
                self.node,
                LinkEvent::Error {
                    link: local,
                    cause: format!("connection refused by {endpoint}"),
                },
            );
            hub.deliver(self.node, LinkEvent::Disconnected(local));
            return Ok(local);
        };

        let remote = hub.allocate_link();
        hub.routes.insert(
            local,
            Route {
                owner: self.node,
                peer: remote,
                remote: Remote::Endpoint(*endpoint),
            },
        );
        hub.routes.insert(
            remote,
            Route {
                owner: server,
                peer: local,
                remote: Remote::Node(self.node),
            },
        );
        hub.deliver(server, LinkEvent::Connected(remote));
        hub.deliver(self.node, LinkEvent::Connected(local));
        Ok(local)
    }

    fn send(
        &mut self,
        link: LinkId,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), SendError> {
        let mut hub = self.network.lock();
        let route = Self::owned_route(&hub, self.node, link)
            .ok_or(SendError::NotConnected)?;
        let receiver = hub
            .routes
            .get(&route.peer)
            .map(|r| r.owner)
            .ok_or(SendError::NotConnected)?;
        hub.deliver(
            receiver,
            LinkEvent::Message {
                link: route.peer,
                channel,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn flush(&mut self, _link: LinkId) {
        // Delivery is immediate; nothing is ever buffered.
    }

    fn close(&mut self, link: LinkId) {
        let mut hub = self.network.lock();
        if Self::owned_route(&hub, self.node, link).is_some() {
            hub.hang_up(link);
        }
    }

    fn poll(&mut self, out: &mut Vec<LinkEvent>) {
        let mut hub = self.network.lock();
        if let Some(mailbox) = hub.mailboxes.get_mut(&self.node) {
            out.extend(mailbox.events.drain(..));
        }
    }

    fn activity(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    fn peer_address(&self, link: LinkId) -> Option<String> {
        let hub = self.network.lock();
        let route = Self::owned_route(&hub, self.node, link)?;
        Some(match route.remote {
            Remote::Node(node) => format!("memory-node-{node}"),
            Remote::Endpoint(endpoint) => endpoint.to_string(),
        })
    }

    fn is_available(&self) -> bool {
        !self.network.lock().offline
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        let node = self.node;
        let mut hub = self.network.lock();
        let owned: Vec<LinkId> = hub
            .routes
            .iter()
            .filter(|(_, r)| r.owner == node)
            .map(|(id, _)| *id)
            .collect();
        for link in owned {
            hub.hang_up(link);
        }
        hub.listeners.retain(|_, owner| *owner != node);
        hub.mailboxes.remove(&node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayId;

    fn addr() -> Endpoint {
        Endpoint::Direct("10.0.0.1:7777".parse().unwrap())
    }

    fn drain(link: &mut MemoryLink) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        link.poll(&mut out);
        out
    }

    #[test]
    fn test_connect_to_listener_reports_both_sides() {
        let net = MemoryNetwork::new();
        let mut server = net.link();
        let mut client = net.link();
        server.listen(&addr()).unwrap();

        let local = client.connect(&addr()).unwrap();

        assert_eq!(drain(&mut client), vec![LinkEvent::Connected(local)]);
        assert!(matches!(
            drain(&mut server).as_slice(),
            [LinkEvent::Connected(_)]
        ));
        assert_eq!(net.open_connections(), 1);
    }

    #[test]
    fn test_connect_without_listener_reports_error_then_disconnect() {
        let net = MemoryNetwork::new();
        let mut client = net.link();

        let local = client.connect(&Endpoint::Relay(RelayId(1))).unwrap();

        let events = drain(&mut client);
        assert!(matches!(
            events.as_slice(),
            [LinkEvent::Error { link, .. }, LinkEvent::Disconnected(l2)]
                if *link == local && *l2 == local
        ));
    }

    #[test]
    fn test_listen_twice_on_same_endpoint_fails() {
        let net = MemoryNetwork::new();
        let mut a = net.link();
        let mut b = net.link();
        a.listen(&addr()).unwrap();

        assert!(matches!(
            b.listen(&addr()),
            Err(TransportError::BindFailed(_))
        ));
    }

    #[test]
    fn test_messages_arrive_in_send_order() {
        let net = MemoryNetwork::new();
        let mut server = net.link();
        let mut client = net.link();
        server.listen(&addr()).unwrap();
        let local = client.connect(&addr()).unwrap();
        drain(&mut server);

        for i in 0..5u8 {
            client.send(local, Channel::Reliable, &[i]).unwrap();
        }

        let payloads: Vec<u8> = drain(&mut server)
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Message { data, .. } => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_close_notifies_remote_only() {
        let net = MemoryNetwork::new();
        let mut server = net.link();
        let mut client = net.link();
        server.listen(&addr()).unwrap();
        let local = client.connect(&addr()).unwrap();
        drain(&mut client);
        let remote = match drain(&mut server).as_slice() {
            [LinkEvent::Connected(id)] => *id,
            other => panic!("unexpected {other:?}"),
        };

        client.close(local);

        assert!(drain(&mut client).is_empty());
        assert_eq!(drain(&mut server), vec![LinkEvent::Disconnected(remote)]);
        assert_eq!(
            client.send(local, Channel::Reliable, b"late"),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn test_dropping_link_hangs_up_its_connections() {
        let net = MemoryNetwork::new();
        let mut server = net.link();
        server.listen(&addr()).unwrap();
        {
            let mut client = net.link();
            client.connect(&addr()).unwrap();
        }

        let events = drain(&mut server);
        assert!(matches!(
            events.as_slice(),
            [LinkEvent::Connected(a), LinkEvent::Disconnected(b)] if a == b
        ));
        assert_eq!(net.open_connections(), 0);
    }

    #[test]
    fn test_peer_address_names_the_other_end() {
        let net = MemoryNetwork::new();
        let mut server = net.link();
        let mut client = net.link();
        server.listen(&addr()).unwrap();
        let local = client.connect(&addr()).unwrap();
        let remote = match drain(&mut server).as_slice() {
            [LinkEvent::Connected(id)] => *id,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(client.peer_address(local).as_deref(), Some("10.0.0.1:7777"));
        let name = server.peer_address(remote).unwrap();
        assert!(name.starts_with("memory-node-"), "{name}");
        assert_eq!(server.peer_address(local), None);
    }

    #[test]
    fn test_set_available_toggles_every_link() {
        let net = MemoryNetwork::new();
        let a = net.link();
        let b = net.link();
        assert!(a.is_available());

        net.set_available(false);
        assert!(!a.is_available());
        assert!(!b.is_available());

        net.set_available(true);
        assert!(b.is_available());
    }

    #[test]
    fn test_cannot_send_on_someone_elses_link() {
        let net = MemoryNetwork::new();
        let mut server = net.link();
        let mut client = net.link();
        let mut stranger = net.link();
        server.listen(&addr()).unwrap();
        let local = client.connect(&addr()).unwrap();

        assert_eq!(
            stranger.send(local, Channel::Reliable, b"spoof"),
            Err(SendError::NotConnected)
        );
    }
}
