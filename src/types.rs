//! Core type definitions for the TURN relay
//!
//! This module provides fundamental types used throughout the relay:
//! - Channel numbers
//! - The client 5-tuple that keys allocations
//! - Network address types
//! - Timing and expiration handling

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// IANA protocol number for UDP, the only relay transport offered
pub const PROTOCOL_UDP: u8 = 17;

/// Channel number for TURN channel bindings (0x4000 through 0x7FFF)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelNumber(u16);

/// Transport protocol between the client and the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
}

/// The client's 5-tuple: transport, client source address and the
/// server address the request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub protocol: TransportProtocol,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

/// Peer address for TURN allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress(pub SocketAddr);

/// Relay address assigned by the TURN server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddress(pub SocketAddr);

/// Duration for which a resource is valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime(pub Duration);

/// Point in time when a resource expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration(pub Instant);

impl ChannelNumber {
    pub const MIN: u16 = 0x4000;
    pub const MAX: u16 = 0x7FFF;

    /// Creates a new channel number if within valid range
    ///
    /// # Arguments
    /// * `value` - The channel number value (must be 0x4000-0x7FFF)
    ///
    /// # Returns
    /// * `Some(ChannelNumber)` if value is valid
    /// * `None` if value is outside valid range
    pub fn new(value: u16) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Gets the raw channel number value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl FiveTuple {
    /// Builds the 5-tuple of a UDP client
    pub fn udp(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            protocol: TransportProtocol::Udp,
            src_addr,
            dst_addr,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} -> {}", self.protocol, self.src_addr, self.dst_addr)
    }
}

impl Lifetime {
    /// Creates a new lifetime duration
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Gets the lifetime in whole seconds, saturating at `u32::MAX`
    pub fn get(&self) -> u32 {
        u32::try_from(self.0.as_secs()).unwrap_or(u32::MAX)
    }
}

impl Expiration {
    /// Creates an expiration `duration` after `now`
    pub fn starting_at(now: Instant, duration: Duration) -> Self {
        Self(now + duration)
    }

    /// Checks expiry against a caller supplied clock reading.
    ///
    /// A resource is still usable at exactly its deadline.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.0
    }

    /// Time left before expiry, zero once expired
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }

    /// Replaces the deadline with `now + duration`
    pub fn refresh_at(&mut self, now: Instant, duration: Duration) {
        self.0 = now + duration;
    }
}

impl RelayAddress {
    /// Creates a new relay address
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }
}
