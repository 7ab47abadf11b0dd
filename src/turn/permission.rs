//! Permission Management Module
//!
//! This module implements permission handling as specified in RFC 5766 Section 8.
//! Permissions authorize a peer IP address, on any port, to exchange data
//! through one allocation. Without a live permission the relay drops data to
//! and from that peer.
//!
//! Every method takes the current time explicitly; the owning allocation reads
//! the clock once per operation under its lock.

use crate::types::Expiration;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Permission for one peer IP address
#[derive(Debug, Clone, Copy)]
pub struct Permission {
    /// The peer's IP address
    peer_ip: IpAddr,
    /// When this permission expires
    expiration: Expiration,
}

impl Permission {
    /// Creates a permission valid for `lifetime` from `now`
    pub fn new(peer_ip: IpAddr, now: Instant, lifetime: Duration) -> Self {
        Self {
            peer_ip,
            expiration: Expiration::starting_at(now, lifetime),
        }
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expiration.is_expired_at(now)
    }

    /// Restarts the permission's lifetime at `now`
    pub fn refresh_at(&mut self, now: Instant, lifetime: Duration) {
        self.expiration.refresh_at(now, lifetime);
    }
}

/// The permission set of one allocation, keyed by peer IP
#[derive(Debug)]
pub struct PermissionTable {
    permissions: HashMap<IpAddr, Permission>,
    lifetime: Duration,
}

impl PermissionTable {
    /// Creates an empty table whose grants last `lifetime`
    pub fn new(lifetime: Duration) -> Self {
        Self {
            permissions: HashMap::new(),
            lifetime,
        }
    }

    /// Creates or refreshes the permission for `peer_ip`
    pub fn grant(&mut self, peer_ip: IpAddr, now: Instant) {
        let lifetime = self.lifetime;
        self.permissions
            .entry(peer_ip)
            .and_modify(|permission| permission.refresh_at(now, lifetime))
            .or_insert_with(|| Permission::new(peer_ip, now, lifetime));
    }

    /// Whether a live permission exists for `peer_ip`
    pub fn is_permitted(&self, peer_ip: IpAddr, now: Instant) -> bool {
        self.permissions
            .get(&peer_ip)
            .map_or(false, |permission| !permission.is_expired_at(now))
    }

    /// Refreshes the permission for `peer_ip` only if it is still live
    ///
    /// # Returns
    /// `true` if the peer was permitted, `false` if the data must be dropped
    pub fn refresh_if_permitted(&mut self, peer_ip: IpAddr, now: Instant) -> bool {
        match self.permissions.get_mut(&peer_ip) {
            Some(permission) if !permission.is_expired_at(now) => {
                permission.refresh_at(now, self.lifetime);
                true
            }
            _ => false,
        }
    }

    /// Removes expired permissions, returning how many were dropped
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.permissions.len();
        self.permissions
            .retain(|_, permission| !permission.is_expired_at(now));
        before - self.permissions.len()
    }

    /// Peer IPs with a live permission
    pub fn permitted_peers(&self, now: Instant) -> Vec<IpAddr> {
        self.permissions
            .values()
            .filter(|permission| !permission.is_expired_at(now))
            .map(Permission::peer_ip)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}
