//! Host configuration.
//!
//! Each host takes one config struct grouping the per-crate settings. All
//! fields have defaults, so a config file only names what it changes:
//!
//! ```toml
//! server_name = "EU-1"
//!
//! [transport]
//! port = 27015
//! max_peers = 16
//!
//! [auth]
//! grace_delay_ms = 1500
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_pump::PumpConfig;
use tether_session::AuthConfig;
use tether_transport::{ConnectMode, TransportConfig};

/// Why a configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Every rule the parsed config broke, in field order.
    #[error("invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Settings for a [`ServerHost`](crate::ServerHost).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Display name advertised to players.
    pub server_name: String,
    pub transport: TransportConfig,
    pub auth: AuthConfig,
    pub pump: PumpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "Tether Server".to_owned(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            pump: PumpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Checks the rules serde cannot express.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] listing every broken rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let transport = &self.transport;
        match transport.mode {
            ConnectMode::Direct if transport.port == 0 => {
                problems.push("transport.port must be non-zero in direct mode".to_owned());
            }
            ConnectMode::Relay if transport.local_relay_id.is_none() => {
                problems.push(
                    "transport.local_relay_id is required in relay mode".to_owned(),
                );
            }
            _ => {}
        }
        if transport.max_peers == 0 {
            problems.push("transport.max_peers must be at least 1".to_owned());
        }
        check_pump(&self.pump, &mut problems);
        finish(problems)
    }
}

/// Settings for a [`ClientHost`](crate::ClientHost).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub pump: PumpConfig,
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.transport.mode == ConnectMode::Relay
            && self.transport.relay_target.is_none()
        {
            problems.push("transport.relay_target is required in relay mode".to_owned());
        }
        check_pump(&self.pump, &mut problems);
        finish(problems)
    }
}

fn check_pump(pump: &PumpConfig, problems: &mut Vec<String>) {
    if pump.rate_hz == 0 || pump.rate_hz > PumpConfig::MAX_RATE_HZ {
        problems.push(format!(
            "pump.rate_hz must be between 1 and {}",
            PumpConfig::MAX_RATE_HZ
        ));
    }
}

fn finish(problems: Vec<String>) -> Result<(), ConfigError> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_transport::RelayId;

    use super::*;

    #[test]
    fn test_from_toml_str_empty_gives_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config.server_name, "Tether Server");
        assert_eq!(config.transport.port, 7777);
        assert_eq!(config.auth.grace_delay(), Duration::from_secs(1));
        assert_eq!(config.pump.rate_hz, 60);
    }

    #[test]
    fn test_from_toml_str_partial_override() {
        let config = ServerConfig::from_toml_str(
            r#"
            server_name = "EU-1"

            [transport]
            port = 27015
            bind_address = "127.0.0.1"
            max_peers = 16

            [auth]
            validation_timeout_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "EU-1");
        assert_eq!(config.transport.port, 27015);
        assert_eq!(config.transport.bind_address.to_string(), "127.0.0.1");
        assert_eq!(config.transport.max_peers, 16);
        assert_eq!(config.auth.validation_timeout(), None);
        assert_eq!(config.auth.grace_delay_ms, 1_000);
    }

    #[test]
    fn test_from_toml_str_relay_mode() {
        let config = ServerConfig::from_toml_str(
            r#"
            [transport]
            mode = "relay"
            local_relay_id = 76561198000000001
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.mode, ConnectMode::Relay);
        assert_eq!(
            config.transport.local_relay_id,
            Some(RelayId(76561198000000001))
        );
    }

    #[test]
    fn test_validate_relay_server_without_id_fails() {
        let err = ServerConfig::from_toml_str("[transport]\nmode = \"relay\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("local_relay_id"));
    }

    #[test]
    fn test_validate_relay_client_without_target_fails() {
        let err = ClientConfig::from_toml_str("[transport]\nmode = \"relay\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("relay_target"));
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = ServerConfig::default();
        config.transport.port = 0;
        config.transport.max_peers = 0;
        config.pump.rate_hz = 5_000;

        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_from_toml_str_bad_syntax_is_parse_error() {
        let err = ServerConfig::from_toml_str("[transport\nport = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_toml_str_wrong_type_is_parse_error() {
        let err =
            ClientConfig::from_toml_str("[pump]\nrate_hz = \"fast\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ServerConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
