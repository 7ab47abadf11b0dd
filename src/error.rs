//! Error types and handling for the TURN relay
//!
//! This module provides error types and conversion implementations for:
//! - STUN/TURN wire errors
//! - Authentication errors
//! - Allocation state preconditions
//! - Resource exhaustion
//! - Configuration errors
//!
//! The error types map to the STUN error codes defined in RFC 5766 / RFC 8656.
//! Errors that map to no code are never answered; the datagram is dropped.

use std::io;
use std::net::IpAddr;
use stun_rs::error::StunDecodeError;
use stun_rs::error::StunEncodeError;
use stun_rs::StunError;
use thiserror::Error;

/// The main error type for the TURN relay
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from std::io
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// STUN attribute or encoding errors
    #[error("STUN protocol error: {0}")]
    Stun(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The datagram is neither valid STUN nor valid ChannelData
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No route exists for the class and method pair
    #[error("Unhandled message kind: {class} {method}")]
    UnhandledMessageKind { class: String, method: String },

    /// The request is missing or carries invalid attributes
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The peer address is administratively denied
    #[error("Forbidden peer address {0}")]
    Forbidden(IpAddr),

    /// An allocation exists for the 5-tuple with different parameters
    #[error("Allocation mismatch")]
    AllocationMismatch,

    /// The 5-tuple has no live allocation
    #[error("No allocation for 5-tuple")]
    AllocationNotFound,

    /// Requested transport is not UDP
    #[error("Unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// The user holds the maximum number of allocations
    #[error("Allocation quota reached for user {0}")]
    QuotaReached(String),

    /// No relay resources left
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Channel number outside 0x4000-0x7FFF
    #[error("Invalid channel number {0:#06x}")]
    InvalidChannelNumber(u16),

    /// Channel number is bound to a different peer
    #[error("Channel number {0:#06x} already bound to another peer")]
    ChannelNumberInUse(u16),

    /// Peer is bound to a different channel number
    #[error("Peer already bound to channel {0:#06x}")]
    PeerAlreadyBound(u16),

    /// No live permission for the peer
    #[error("No permission for peer {0}")]
    NoPermission(IpAddr),

    /// Authenticated user does not own the allocation
    #[error("Wrong credentials for allocation owned by {0}")]
    WrongCredentials(String),
}

/// Authentication-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Request carries no MESSAGE-INTEGRITY
    #[error("Missing message integrity")]
    MissingIntegrity,

    /// Request carries no NONCE
    #[error("Missing nonce")]
    MissingNonce,

    /// Nonce is older than its validity window or was not issued here
    #[error("Stale nonce")]
    StaleNonce,

    /// USERNAME or REALM absent
    #[error("Missing credentials")]
    MissingCredentials,

    /// Unknown user or MESSAGE-INTEGRITY mismatch
    #[error("Integrity check failed")]
    IntegrityMismatch,

    /// Source is blacklisted after repeated failures
    #[error("IP is blacklisted")]
    Blacklisted,
}

/// Result type alias for TURN relay operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convert the error to a STUN error code
    ///
    /// Maps internal errors to the STUN error codes of RFC 5766 / RFC 8656:
    /// - 400: Bad Request
    /// - 401: Unauthorized
    /// - 403: Forbidden
    /// - 437: Allocation Mismatch
    /// - 438: Stale Nonce
    /// - 441: Wrong Credentials
    /// - 442: Unsupported Transport Protocol
    /// - 486: Allocation Quota Reached
    /// - 500: Server Error
    /// - 508: Insufficient Capacity
    ///
    /// `None` means the request gets no response at all.
    pub fn to_stun_error_code(&self) -> Option<u16> {
        let code = match self {
            Error::Auth(AuthError::MissingIntegrity) => 401,
            Error::Auth(AuthError::MissingNonce) => 401,
            Error::Auth(AuthError::IntegrityMismatch) => 401,
            Error::Auth(AuthError::StaleNonce) => 438,
            Error::Auth(AuthError::MissingCredentials) => 400,
            Error::Auth(AuthError::Blacklisted) => return None,
            Error::BadRequest(_) => 400,
            Error::Stun(_) => 400,
            Error::InvalidChannelNumber(_) => 400,
            Error::ChannelNumberInUse(_) => 400,
            Error::PeerAlreadyBound(_) => 400,
            Error::Forbidden(_) => 403,
            Error::AllocationMismatch => 437,
            Error::AllocationNotFound => 437,
            Error::WrongCredentials(_) => 441,
            Error::UnsupportedTransport(_) => 442,
            Error::QuotaReached(_) => 486,
            Error::InsufficientCapacity(_) => 508,
            Error::Io(_) => 500,
            Error::Config(_) => 500,
            Error::MalformedMessage(_) => return None,
            Error::UnhandledMessageKind { .. } => return None,
            Error::NoPermission(_) => return None,
        };
        Some(code)
    }

    /// Standard reason phrase for the error's STUN code
    pub fn to_stun_error_message(&self) -> &'static str {
        match self.to_stun_error_code() {
            Some(400) => "Bad Request",
            Some(401) => "Unauthorized",
            Some(403) => "Forbidden",
            Some(437) => "Allocation Mismatch",
            Some(438) => "Stale Nonce",
            Some(441) => "Wrong Credentials",
            Some(442) => "Unsupported Transport Protocol",
            Some(486) => "Allocation Quota Reached",
            Some(508) => "Insufficient Capacity",
            _ => "Server Error",
        }
    }

    /// Whether the error response must carry a fresh NONCE and the REALM
    pub fn is_challenge(&self) -> bool {
        matches!(self.to_stun_error_code(), Some(401) | Some(438))
    }
}

// Error conversion implementations
impl From<StunError> for Error {
    fn from(err: StunError) -> Self {
        Error::Stun(err.to_string())
    }
}

impl From<StunEncodeError> for Error {
    fn from(err: StunEncodeError) -> Self {
        Error::Stun(err.to_string())
    }
}

impl From<StunDecodeError> for Error {
    fn from(err: StunDecodeError) -> Self {
        Error::MalformedMessage(err.to_string())
    }
}
