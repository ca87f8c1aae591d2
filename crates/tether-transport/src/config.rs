//! Transport configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{Endpoint, RelayId, TransportError};

/// How a transport session reaches its peers.
///
/// Fixed when the session is built; a session never switches modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Address + port.
    #[default]
    Direct,
    /// Relay-routed peer identifiers.
    Relay,
}

/// Settings for a [`ServerTransport`](crate::ServerTransport) or
/// [`ClientTransport`](crate::ClientTransport).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Direct or relay addressing.
    pub mode: ConnectMode,

    /// Game port. The server listens on it; clients connect to it.
    pub port: u16,

    /// Interface the server binds in direct mode.
    pub bind_address: IpAddr,

    /// Relay id a client connects to in relay mode.
    pub relay_target: Option<RelayId>,

    /// Relay id a server registers under in relay mode.
    pub local_relay_id: Option<RelayId>,

    /// Most concurrent connections a server accepts.
    pub max_peers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: ConnectMode::Direct,
            port: 7777,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_target: None,
            local_relay_id: None,
            max_peers: 64,
        }
    }
}

impl TransportConfig {
    /// Where a server listens for the given port.
    pub(crate) fn listen_endpoint(
        &self,
        port: u16,
    ) -> Result<Endpoint, TransportError> {
        match self.mode {
            ConnectMode::Direct => {
                Ok(Endpoint::Direct(SocketAddr::new(self.bind_address, port)))
            }
            ConnectMode::Relay => self
                .local_relay_id
                .map(Endpoint::Relay)
                .ok_or(TransportError::MissingRelayId("local_relay_id")),
        }
    }

    /// Where a client connects for the given host.
    ///
    /// In relay mode the host is ignored and `relay_target` is used.
    pub(crate) fn connect_endpoint(
        &self,
        host: &str,
    ) -> Result<Endpoint, TransportError> {
        match self.mode {
            ConnectMode::Direct => {
                let ip: IpAddr = host.parse().map_err(|e| {
                    TransportError::ConnectFailed(format!(
                        "invalid address {host:?}: {e}"
                    ))
                })?;
                Ok(Endpoint::Direct(SocketAddr::new(ip, self.port)))
            }
            ConnectMode::Relay => self
                .relay_target
                .map(Endpoint::Relay)
                .ok_or(TransportError::MissingRelayId("relay_target")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_endpoint_direct_uses_bind_address() {
        let config = TransportConfig::default();
        let endpoint = config.listen_endpoint(9000).unwrap();
        assert_eq!(endpoint, Endpoint::Direct("0.0.0.0:9000".parse().unwrap()));
    }

    #[test]
    fn test_listen_endpoint_relay_without_id_fails() {
        let config = TransportConfig {
            mode: ConnectMode::Relay,
            ..TransportConfig::default()
        };
        assert!(matches!(
            config.listen_endpoint(9000),
            Err(TransportError::MissingRelayId("local_relay_id"))
        ));
    }

    #[test]
    fn test_connect_endpoint_relay_ignores_host() {
        let config = TransportConfig {
            mode: ConnectMode::Relay,
            relay_target: Some(RelayId(77)),
            ..TransportConfig::default()
        };
        let endpoint = config.connect_endpoint("not an address").unwrap();
        assert_eq!(endpoint, Endpoint::Relay(RelayId(77)));
    }

    #[test]
    fn test_connect_endpoint_direct_rejects_garbage_host() {
        let config = TransportConfig::default();
        assert!(matches!(
            config.connect_endpoint("nowhere"),
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
