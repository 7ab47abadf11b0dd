//! Configuration module for the TURN relay
//!
//! This module provides configuration structures and functionality for:
//! - Listener transport settings
//! - Authentication, users and rate limiting
//! - Relay resources (addresses, port range, quotas, denied peers)
//! - Lifetime bounds and timeouts

use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for the client-facing listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Network interface to listen on
    pub listen_address: IpAddr,

    /// UDP port for STUN/TURN
    pub port: u16,

    /// Size of the listener receive buffer
    pub buffer_size: usize,
}

/// Configuration for rate limiting of failed authentication
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failed authentications within the window before blacklisting
    pub max_auth_failures: usize,

    /// Time window for counting failures
    #[serde_as(as = "DurationSeconds<u64>")]
    pub window: Duration,

    /// Duration to blacklist offending sources
    #[serde_as(as = "DurationSeconds<u64>")]
    pub blacklist_duration: Duration,

    /// Networks exempt from rate limiting, in CIDR notation
    pub whitelist: Vec<String>,
}

/// Configuration for authentication
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication realm
    pub realm: String,

    /// How long an issued nonce stays fresh
    #[serde_as(as = "DurationSeconds<u64>")]
    pub nonce_lifetime: Duration,

    /// Long-term credential users, username to password
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Reject requests whose username differs from the allocation creator
    #[serde(default)]
    pub enforce_allocation_owner: bool,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Configuration for relay resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Local address relay sockets bind to
    pub relay_address: IpAddr,

    /// Address advertised in XOR-RELAYED-ADDRESS when behind NAT
    #[serde(default)]
    pub public_address: Option<IpAddr>,

    /// Lowest relay port; 0 together with `max_port` 0 lets the OS choose
    pub min_port: u16,

    /// Highest relay port
    pub max_port: u16,

    /// Maximum concurrent allocations
    pub max_allocations: usize,

    /// Maximum concurrent allocations per username
    pub user_quota: usize,

    /// Peer networks that may not be granted permissions, in CIDR notation
    #[serde(default)]
    pub denied_peer_ranges: Vec<String>,

    /// Receive buffer of each allocation's relay socket; larger peer
    /// datagrams are truncated
    #[serde(default = "default_peer_buffer_size")]
    pub peer_buffer_size: usize,
}

fn default_peer_buffer_size() -> usize {
    2048
}

/// Configuration for lifetimes and periodic work
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Lifetime granted when a request carries no LIFETIME
    #[serde_as(as = "DurationSeconds<u64>")]
    pub default_allocation_lifetime: Duration,

    /// Lower bound for requested allocation lifetimes
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_allocation_lifetime: Duration,

    /// Upper bound for requested allocation lifetimes
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_allocation_lifetime: Duration,

    /// How long permissions remain valid
    #[serde_as(as = "DurationSeconds<u64>")]
    pub permission_lifetime: Duration,

    /// How long channel bindings remain valid
    #[serde_as(as = "DurationSeconds<u64>")]
    pub channel_lifetime: Duration,

    /// How often to sweep expired allocations
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cleanup_interval: Duration,
}

/// Main server configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport configuration
    pub transport: TransportConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Relay resource configuration
    pub relay: RelayConfig,

    /// Timeout configuration
    pub timeouts: TimeoutConfig,
}

impl ServerConfig {
    /// Get the listener bind address
    pub fn get_bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.transport.listen_address, self.transport.port)
    }

    /// Get the authentication realm
    pub fn get_realm(&self) -> &str {
        &self.auth.realm
    }

    /// Get maximum allowed allocations
    pub fn get_max_allocations(&self) -> usize {
        self.relay.max_allocations
    }

    /// Get permission lifetime duration
    pub fn get_permission_lifetime(&self) -> Duration {
        self.timeouts.permission_lifetime
    }

    /// Get channel binding lifetime duration
    pub fn get_channel_lifetime(&self) -> Duration {
        self.timeouts.channel_lifetime
    }

    /// Get cleanup interval duration
    pub fn get_cleanup_interval(&self) -> Duration {
        self.timeouts.cleanup_interval
    }

    /// Get network buffer size
    pub fn get_buffer_size(&self) -> usize {
        self.transport.buffer_size
    }

    /// Get the per-allocation relay buffer size
    pub fn get_peer_buffer_size(&self) -> usize {
        self.relay.peer_buffer_size
    }

    /// Clamps a requested allocation lifetime into the configured bounds
    ///
    /// # Arguments
    /// * `requested` - LIFETIME attribute in seconds, if present
    ///
    /// # Returns
    /// The default lifetime when absent, otherwise `requested` bounded by
    /// `[min_allocation_lifetime, max_allocation_lifetime]`
    pub fn clamp_allocation_lifetime(&self, requested: Option<u32>) -> Duration {
        match requested {
            None => self.timeouts.default_allocation_lifetime,
            Some(secs) => Duration::from_secs(u64::from(secs)).clamp(
                self.timeouts.min_allocation_lifetime,
                self.timeouts.max_allocation_lifetime,
            ),
        }
    }

    /// Parses the denied peer ranges
    pub fn denied_peer_networks(&self) -> Result<Vec<IpNetwork>> {
        self.relay
            .denied_peer_ranges
            .iter()
            .map(|net| {
                net.parse::<IpNetwork>()
                    .map_err(|e| Error::Config(format!("invalid denied peer range {}: {}", net, e)))
            })
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.transport.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be greater than 0".into()));
        }
        if self.relay.peer_buffer_size == 0 {
            return Err(Error::Config("peer_buffer_size must be greater than 0".into()));
        }
        if self.auth.realm.is_empty() {
            return Err(Error::Config("realm must not be empty".into()));
        }
        if self.auth.nonce_lifetime.is_zero() {
            return Err(Error::Config("nonce_lifetime must be greater than 0".into()));
        }

        let rate_limit = &self.auth.rate_limit;
        if rate_limit.max_auth_failures == 0 {
            return Err(Error::Config("max_auth_failures must be greater than 0".into()));
        }
        if rate_limit.window.is_zero() {
            return Err(Error::Config("rate limit window must be greater than 0".into()));
        }

        let relay = &self.relay;
        if relay.min_port > relay.max_port {
            return Err(Error::Config(format!(
                "relay port range {}-{} is empty",
                relay.min_port, relay.max_port
            )));
        }
        if relay.min_port == 0 && relay.max_port != 0 {
            return Err(Error::Config("min_port must be set with max_port".into()));
        }
        if relay.max_allocations == 0 || relay.user_quota == 0 {
            return Err(Error::Config(
                "max_allocations and user_quota must be greater than 0".into(),
            ));
        }
        self.denied_peer_networks()?;

        let t = &self.timeouts;
        if t.min_allocation_lifetime.is_zero() {
            return Err(Error::Config("min_allocation_lifetime must be greater than 0".into()));
        }
        if !(t.min_allocation_lifetime <= t.default_allocation_lifetime
            && t.default_allocation_lifetime <= t.max_allocation_lifetime)
        {
            return Err(Error::Config(
                "allocation lifetimes must satisfy min <= default <= max".into(),
            ));
        }
        if t.permission_lifetime.is_zero() || t.channel_lifetime.is_zero() {
            return Err(Error::Config(
                "permission and channel lifetimes must be greater than 0".into(),
            ));
        }
        if t.cleanup_interval.is_zero() {
            return Err(Error::Config("cleanup_interval must be greater than 0".into()));
        }

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }
}

// Default implementation provides reasonable defaults for all settings
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 3478,
                buffer_size: 65535,
            },
            auth: AuthConfig {
                realm: "turn.example.com".to_string(),
                nonce_lifetime: Duration::from_secs(3600),
                users: HashMap::new(),
                enforce_allocation_owner: false,
                rate_limit: RateLimitConfig {
                    max_auth_failures: 5,
                    window: Duration::from_secs(60),
                    blacklist_duration: Duration::from_secs(3600),
                    whitelist: vec![],
                },
            },
            relay: RelayConfig {
                relay_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                public_address: None,
                min_port: 49152,
                max_port: 65535,
                max_allocations: 10000,
                user_quota: 10,
                denied_peer_ranges: vec![],
                peer_buffer_size: default_peer_buffer_size(),
            },
            timeouts: TimeoutConfig {
                default_allocation_lifetime: Duration::from_secs(600),
                min_allocation_lifetime: Duration::from_secs(60),
                max_allocation_lifetime: Duration::from_secs(3600),
                permission_lifetime: Duration::from_secs(300),
                channel_lifetime: Duration::from_secs(600),
                cleanup_interval: Duration::from_secs(60),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.transport.port, 3478);
        assert_eq!(config.auth.realm, "turn.example.com");
        assert!(config.auth.users.is_empty());
        assert!(!config.auth.enforce_allocation_owner);
        assert_eq!(config.relay.min_port, 49152);
        assert_eq!(config.relay.max_port, 65535);
        assert_eq!(config.get_permission_lifetime(), Duration::from_secs(300));
        assert_eq!(config.get_channel_lifetime(), Duration::from_secs(600));
        assert_eq!(config.get_cleanup_interval(), Duration::from_secs(60));
        assert!(config.get_peer_buffer_size() < config.get_buffer_size());
        assert!(config.get_peer_buffer_size() >= 1500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_address() {
        let mut config = ServerConfig::default();
        config.transport.listen_address = "127.0.0.1".parse().unwrap();

        assert_eq!(config.get_bind_address().to_string(), "127.0.0.1:3478");
    }

    #[test]
    fn test_lifetime_clamping() {
        let config = ServerConfig::default();

        assert_eq!(
            config.clamp_allocation_lifetime(None),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.clamp_allocation_lifetime(Some(1)),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.clamp_allocation_lifetime(Some(1200)),
            Duration::from_secs(1200)
        );
        assert_eq!(
            config.clamp_allocation_lifetime(Some(u32::MAX)),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();

        config.relay.min_port = 50000;
        config.relay.max_port = 40000;
        assert!(config.validate().is_err());

        config.relay.min_port = 0;
        config.relay.max_port = 0;
        assert!(config.validate().is_ok());

        config.timeouts.default_allocation_lifetime = Duration::from_secs(7200);
        assert!(config.validate().is_err());

        config.timeouts.default_allocation_lifetime = Duration::from_secs(600);
        config.relay.denied_peer_ranges = vec!["10.0.0.0/33".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.relay.denied_peer_ranges = vec!["10.0.0.0/8".to_string()];
        assert!(config.validate().is_ok());
        assert_eq!(config.denied_peer_networks().unwrap().len(), 1);

        config.relay.peer_buffer_size = 0;
        assert!(config.validate().is_err());
        config.relay.peer_buffer_size = 2048;

        config.auth.rate_limit.window = Duration::from_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_loading() {
        let config_str = r#"
        {
            "transport": {
                "listen_address": "127.0.0.1",
                "port": 3479,
                "buffer_size": 1500
            },
            "auth": {
                "realm": "custom.realm",
                "nonce_lifetime": 600,
                "users": { "alice": "secret" },
                "rate_limit": {
                    "max_auth_failures": 10,
                    "window": 120,
                    "blacklist_duration": 7200,
                    "whitelist": ["192.168.1.0/24"]
                }
            },
            "relay": {
                "relay_address": "127.0.0.1",
                "public_address": "203.0.113.5",
                "min_port": 50000,
                "max_port": 50100,
                "max_allocations": 100,
                "user_quota": 2,
                "denied_peer_ranges": ["10.0.0.0/8"]
            },
            "timeouts": {
                "default_allocation_lifetime": 600,
                "min_allocation_lifetime": 60,
                "max_allocation_lifetime": 3600,
                "permission_lifetime": 300,
                "channel_lifetime": 600,
                "cleanup_interval": 30
            }
        }"#;

        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, config_str).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.get_bind_address().to_string(), "127.0.0.1:3479");
        assert_eq!(config.get_buffer_size(), 1500);
        assert_eq!(config.get_realm(), "custom.realm");
        assert_eq!(config.auth.users.get("alice").map(String::as_str), Some("secret"));
        assert!(!config.auth.enforce_allocation_owner);
        assert_eq!(config.auth.rate_limit.window, Duration::from_secs(120));
        assert_eq!(
            config.relay.public_address,
            Some("203.0.113.5".parse().unwrap())
        );
        assert_eq!(config.get_max_allocations(), 100);
        assert_eq!(config.relay.user_quota, 2);
        // Optional, falls back to the default
        assert_eq!(config.get_peer_buffer_size(), 2048);
        assert_eq!(config.get_cleanup_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_file_rejects_invalid() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, "{ \"transport\": {} }").unwrap();

        assert!(matches!(
            ServerConfig::from_file(&config_path),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_file(temp_dir.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }
}
