//! Channel Management Module
//!
//! This module implements channel binding as specified in RFC 5766 Section 11.
//! Channels reduce the overhead of relayed data by replacing the STUN Data
//! indication with a 4-byte ChannelData header.
//!
//! Within one allocation a channel number names at most one peer address and
//! a peer address holds at most one channel number. Bindings expire but are
//! never removed explicitly; an expired binding frees both its number and its
//! peer for a new binding.

use crate::error::{Error, Result};
use crate::types::{ChannelNumber, Expiration, PeerAddress};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A single binding between a channel number and a peer address
#[derive(Debug, Clone, Copy)]
pub struct ChannelBinding {
    /// The bound channel number
    number: ChannelNumber,
    /// The peer's address this channel is bound to
    peer_address: PeerAddress,
    /// When this binding expires
    expiration: Expiration,
}

impl ChannelBinding {
    fn new(number: ChannelNumber, peer_address: PeerAddress, now: Instant, lifetime: Duration) -> Self {
        Self {
            number,
            peer_address,
            expiration: Expiration::starting_at(now, lifetime),
        }
    }

    pub fn number(&self) -> ChannelNumber {
        self.number
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address.0
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expiration.is_expired_at(now)
    }
}

/// Channel bindings of one allocation with lookup in both directions
#[derive(Debug)]
pub struct ChannelTable {
    /// Maps channel numbers to bindings
    by_number: HashMap<ChannelNumber, ChannelBinding>,
    /// Maps peer addresses to channel numbers
    by_peer: HashMap<PeerAddress, ChannelNumber>,
    /// Lifetime of a new or refreshed binding
    lifetime: Duration,
}

impl ChannelTable {
    /// Creates an empty table whose bindings last `lifetime`
    pub fn new(lifetime: Duration) -> Self {
        Self {
            by_number: HashMap::new(),
            by_peer: HashMap::new(),
            lifetime,
        }
    }

    /// Creates or refreshes the binding of `number` to `peer`
    ///
    /// # Arguments
    /// * `number` - The channel number requested by the client
    /// * `peer` - The peer's transport address
    /// * `now` - Current time
    ///
    /// # Returns
    /// * `Ok(())` - The binding is live for another full lifetime
    /// * `Err(Error::ChannelNumberInUse)` - `number` is live for another peer
    /// * `Err(Error::PeerAlreadyBound)` - `peer` is live on another number
    pub fn bind(&mut self, number: ChannelNumber, peer: SocketAddr, now: Instant) -> Result<()> {
        let peer = PeerAddress(peer);

        if let Some(existing) = self.live_binding(number, now) {
            if existing.peer_address != peer {
                return Err(Error::ChannelNumberInUse(number.value()));
            }
        }
        if let Some(bound) = self.by_peer.get(&peer).copied() {
            if bound != number && self.live_binding(bound, now).is_some() {
                return Err(Error::PeerAlreadyBound(bound.value()));
            }
        }

        // Whatever is left for this number or peer is either this binding or expired
        if let Some(stale) = self.by_number.remove(&number) {
            self.by_peer.remove(&stale.peer_address);
        }
        if let Some(stale) = self.by_peer.remove(&peer) {
            self.by_number.remove(&stale);
        }

        self.by_number
            .insert(number, ChannelBinding::new(number, peer, now, self.lifetime));
        self.by_peer.insert(peer, number);
        Ok(())
    }

    fn live_binding(&self, number: ChannelNumber, now: Instant) -> Option<&ChannelBinding> {
        self.by_number
            .get(&number)
            .filter(|binding| !binding.is_expired_at(now))
    }

    /// The peer bound to `number`, if the binding is live
    pub fn peer_for(&self, number: ChannelNumber, now: Instant) -> Option<SocketAddr> {
        self.live_binding(number, now)
            .map(ChannelBinding::peer_address)
    }

    /// The channel number bound to `peer`, if the binding is live
    pub fn number_for(&self, peer: SocketAddr, now: Instant) -> Option<ChannelNumber> {
        let number = *self.by_peer.get(&PeerAddress(peer))?;
        self.live_binding(number, now).map(ChannelBinding::number)
    }

    /// Removes expired bindings, returning how many were dropped
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<ChannelBinding> = self
            .by_number
            .values()
            .filter(|binding| binding.is_expired_at(now))
            .copied()
            .collect();

        for binding in &expired {
            self.by_number.remove(&binding.number);
            self.by_peer.remove(&binding.peer_address);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}
