//! A TURN relay server in Rust
//!
//! This crate provides a TURN (Traversal Using Relays around NAT) server
//! implementation following RFC 5766: authenticated allocations keyed by the
//! client's 5-tuple, per-peer permissions, channel bindings and UDP relaying
//! in both directions.

mod auth;
mod config;
mod error;
mod proto;
mod rate_limit;
mod turn;
mod types;

// Re-export primary types
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use turn::{ServerContext, TurnServer};

// Re-export the types
pub use types::*;

// Re-export configuration types that users might need to construct ServerConfig
pub use config::{AuthConfig, RateLimitConfig, RelayConfig, TimeoutConfig, TransportConfig};

// Re-export error types for error handling
pub use error::AuthError;

// Credential lookup injected into the server
pub use auth::{long_term_key, CredentialStore, StaticCredentials};

// Wire codecs
pub use proto::{ChannelData, TurnMessage};

// Allocation state
pub use turn::{Allocation, AllocationManager, AllocationRequest, PeerRoute};

// Re-export rate limiter if needed externally
pub use rate_limit::{RateLimitStats, RateLimiter};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the logger for the TURN server
///
/// Filtering follows `RUST_LOG`, for example `RUST_LOG=turn_relay=debug`.
pub fn init_logger() {
    env_logger::init();
}
