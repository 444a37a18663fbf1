use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::IceServer;

/// Application configuration
///
/// Shared by the reference signaling service (`server`, `capacity`, `relay`,
/// `rendezvous`, `ice`) and by embedders of the network layer (`client`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub capacity: CapacityConfig,
    pub relay: RelayConfig,
    pub rendezvous: RendezvousConfig,
    pub ice: IceConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Room capacity routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Rooms whose occupancy is strictly greater than this are routed to the relay
    pub relay_threshold: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self { relay_threshold: 5 }
    }
}

/// Media relay (SFU) access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay signaling address handed to clients. Empty disables relay mode.
    pub url: String,
    /// HMAC secret shared with the relay for access tokens
    pub token_secret: String,
    pub token_ttl_secs: u64,
    pub issuer: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token_secret: String::new(),
            token_ttl_secs: 600,
            issuer: "plaza".to_string(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }

    #[must_use]
    pub const fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Mesh rendezvous channel served by the reference service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Application namespace mixed into every rendezvous topic
    pub app_id: String,
    pub max_message_size: usize,
    /// Outbound queue depth per connection before messages are dropped
    pub send_queue_size: usize,
    /// Public WebSocket address advertised to clients
    pub public_url: String,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            app_id: "plaza".to_string(),
            max_message_size: 64 * 1024,
            send_queue_size: 256,
            public_url: "ws://localhost:8080/ws/rendezvous".to_string(),
        }
    }
}

/// ICE servers advertised to mesh clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl IceConfig {
    /// All configured servers in the shape clients expect
    #[must_use]
    pub fn servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();
        servers.extend(self.turn_servers.iter().cloned());
        servers
    }
}

/// Network layer tuning for room sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the capacity/config resolution service
    pub capacity_url: String,
    /// Rendezvous namespace; must match the service's `rendezvous.app_id`
    pub app_id: String,
    pub broadcast_interval_ms: u64,
    pub reaction_window_ms: u64,
    /// Peers silent for longer than this are evicted. 0 disables expiry.
    pub peer_timeout_secs: u64,
    pub keepalive_ms: u64,
    pub sweep_interval_ms: u64,
    /// Extra attempts for the capacity lookup on transport errors
    pub resolve_retries: usize,
    pub rendezvous_max_reconnects: usize,
    /// Used for mesh links when the service does not provide any
    pub ice_servers: Vec<IceServer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            capacity_url: "http://localhost:8080".to_string(),
            app_id: "plaza".to_string(),
            broadcast_interval_ms: 50,
            reaction_window_ms: 2500,
            peer_timeout_secs: 15,
            keepalive_ms: 1000,
            sweep_interval_ms: 1000,
            resolve_retries: 2,
            rendezvous_max_reconnects: 8,
            ice_servers: IceConfig::default().servers(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    #[must_use]
    pub const fn reaction_window(&self) -> Duration {
        Duration::from_millis(self.reaction_window_ms)
    }

    #[must_use]
    pub const fn peer_timeout(&self) -> Option<Duration> {
        if self.peer_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.peer_timeout_secs))
        }
    }

    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (PLAZA_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PLAZA")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check for values that would leave the service or a session unusable
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.capacity.relay_threshold == 0 {
            errors.push("capacity.relay_threshold must be at least 1".to_string());
        }
        if self.relay.is_enabled() && self.relay.token_secret.is_empty() {
            errors.push("relay.token_secret is required when relay.url is set".to_string());
        }
        if self.relay.token_ttl_secs == 0 {
            errors.push("relay.token_ttl_secs must be positive".to_string());
        }
        if self.rendezvous.app_id.is_empty() {
            errors.push("rendezvous.app_id must not be empty".to_string());
        }
        if self.rendezvous.send_queue_size == 0 {
            errors.push("rendezvous.send_queue_size must be positive".to_string());
        }
        if self.client.broadcast_interval_ms == 0 {
            errors.push("client.broadcast_interval_ms must be positive".to_string());
        }
        if self.client.sweep_interval_ms == 0 {
            errors.push("client.sweep_interval_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.capacity.relay_threshold, 5);
        assert_eq!(config.client.broadcast_interval(), Duration::from_millis(50));
        assert_eq!(config.client.reaction_window(), Duration::from_millis(2500));
        assert!(!config.relay.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 9000,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_relay_without_secret() {
        let mut config = Config::default();
        config.relay.url = "wss://relay.example.com".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("token_secret"));
    }

    #[test]
    fn test_peer_timeout_disabled() {
        let client = ClientConfig {
            peer_timeout_secs: 0,
            ..ClientConfig::default()
        };
        assert!(client.peer_timeout().is_none());
    }

    #[test]
    fn test_ice_servers() {
        let ice = IceConfig {
            stun_servers: vec!["stun:a".to_string()],
            turn_servers: vec![IceServer {
                urls: vec!["turn:b".to_string()],
                username: Some("u".to_string()),
                credential: Some("c".to_string()),
            }],
        };

        let servers = ice.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:a".to_string()]);
        assert!(servers[0].username.is_none());
        assert_eq!(servers[1].credential.as_deref(), Some("c"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "capacity:\n  relay_threshold: 8\nlogging:\n  format: json").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.capacity.relay_threshold, 8);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.server.http_port, 8080);
    }
}
