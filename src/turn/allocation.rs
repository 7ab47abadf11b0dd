//! TURN Allocation Management Module
//!
//! This module implements allocation management as specified in RFC 5766.
//! It handles:
//! - Creating allocations keyed by the client's 5-tuple
//! - Binding relay sockets inside the configured port range
//! - Per-allocation permission and channel tables
//! - Allocation lifecycle, expiry and teardown
//!
//! The store is a `DashMap` of `Arc<Allocation>`. Each allocation guards its
//! deadline and tables with its own mutex, so unrelated clients never contend.
//! Map guards are never held across an await point.
//!
//! Server-wide and per-user limits are claimed atomically in a
//! [`CapacityLedger`] before the relay socket is bound. The claim travels with
//! the allocation and is returned when it closes.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::turn::channel::ChannelTable;
use crate::turn::permission::PermissionTable;
use crate::turn::relay;
use crate::types::{ChannelNumber, Expiration, FiveTuple, Lifetime, RelayAddress, PROTOCOL_UDP};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use rand::Rng;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;

/// Parameters of an Allocate request that identify a retransmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Authenticated username of the requester
    pub username: String,
    /// REQUESTED-TRANSPORT protocol number
    pub transport: u8,
    /// LIFETIME attribute in seconds, if present
    pub lifetime: Option<u32>,
}

/// How data from a peer reaches the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRoute {
    /// No live permission; drop
    Denied,
    /// Live channel binding; frame as ChannelData
    Channel(ChannelNumber),
    /// Permission only; wrap in a Data indication
    Indication,
}

/// Minimum spacing of the sweeps an Allocate at a limit may trigger
const CAPACITY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Counts claimed allocation slots, in total and per username
#[derive(Debug)]
struct CapacityLedger {
    max_allocations: usize,
    user_quota: usize,
    total: AtomicUsize,
    per_user: DashMap<String, usize>,
}

impl CapacityLedger {
    fn new(max_allocations: usize, user_quota: usize) -> Self {
        Self {
            max_allocations,
            user_quota,
            total: AtomicUsize::new(0),
            per_user: DashMap::new(),
        }
    }

    /// Claims one server-wide slot and one of `username`'s slots
    ///
    /// # Returns
    /// * `Err(Error::InsufficientCapacity)` - `max_allocations` slots are claimed
    /// * `Err(Error::QuotaReached)` - `username` holds `user_quota` slots
    fn reserve(self: &Arc<Self>, username: &str) -> Result<CapacityReservation> {
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.max_allocations).then_some(total + 1)
            })
            .map_err(|total| {
                Error::InsufficientCapacity(format!("{} allocations active", total))
            })?;

        {
            let mut held = self.per_user.entry(username.to_owned()).or_insert(0);
            if *held >= self.user_quota {
                drop(held);
                self.total.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::QuotaReached(username.to_owned()));
            }
            *held += 1;
        }

        Ok(CapacityReservation {
            ledger: Arc::clone(self),
            username: username.to_owned(),
            released: AtomicBool::new(false),
        })
    }

    fn release(&self, username: &str) {
        if let Entry::Occupied(mut entry) = self.per_user.entry(username.to_owned()) {
            let held = entry.get_mut();
            *held = held.saturating_sub(1);
            if *held == 0 {
                entry.remove();
            }
        }
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    fn held_by(&self, username: &str) -> usize {
        self.per_user.get(username).map_or(0, |held| *held)
    }
}

/// A claimed slot, returned to the ledger exactly once
#[derive(Debug)]
struct CapacityReservation {
    ledger: Arc<CapacityLedger>,
    username: String,
    released: AtomicBool,
}

impl CapacityReservation {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.ledger.release(&self.username);
        }
    }
}

impl Drop for CapacityReservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Mutable allocation state, only touched under the allocation's lock
#[derive(Debug)]
struct AllocationState {
    expiration: Expiration,
    permissions: PermissionTable,
    channels: ChannelTable,
}

/// Represents a single TURN allocation
pub struct Allocation {
    /// Client's 5-tuple
    five_tuple: FiveTuple,

    /// Relay address advertised to the client
    relay_addr: RelayAddress,

    /// Exclusively owned relay socket
    relay_socket: Arc<UdpSocket>,

    /// Listener socket that reaches the client
    turn_socket: Arc<UdpSocket>,

    /// Username that created the allocation
    username: String,

    /// Parameters of the creating request
    request: AllocationRequest,

    /// Slot held against the server and user limits
    reservation: CapacityReservation,

    state: Mutex<AllocationState>,

    closed: AtomicBool,

    /// Peer-to-client relay task
    relay_task: OnceLock<AbortHandle>,
}

impl Allocation {
    fn new(
        five_tuple: FiveTuple,
        relay_addr: RelayAddress,
        relay_socket: UdpSocket,
        turn_socket: Arc<UdpSocket>,
        request: AllocationRequest,
        reservation: CapacityReservation,
        lifetime: Duration,
        config: &ServerConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            five_tuple,
            relay_addr,
            relay_socket: Arc::new(relay_socket),
            turn_socket,
            username: request.username.clone(),
            request,
            reservation,
            state: Mutex::new(AllocationState {
                expiration: Expiration::starting_at(now, lifetime),
                permissions: PermissionTable::new(config.get_permission_lifetime()),
                channels: ChannelTable::new(config.get_channel_lifetime()),
            }),
            closed: AtomicBool::new(false),
            relay_task: OnceLock::new(),
        }
    }

    pub fn five_tuple(&self) -> &FiveTuple {
        &self.five_tuple
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr.0
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn relay_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.relay_socket)
    }

    pub(crate) fn turn_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.turn_socket)
    }

    /// Whether a retransmitted Allocate carries the same parameters
    pub fn matches_request(&self, request: &AllocationRequest) -> bool {
        self.request.transport == request.transport && self.request.lifetime == request.lifetime
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Locks the state if the allocation is still usable at the current time
    async fn lock_live(&self) -> Result<(MutexGuard<'_, AllocationState>, Instant)> {
        let state = self.state.lock().await;
        let now = Instant::now();
        if self.is_closed() || state.expiration.is_expired_at(now) {
            return Err(Error::AllocationNotFound);
        }
        Ok((state, now))
    }

    /// Whether the deadline has passed or the allocation was torn down
    pub async fn is_expired(&self) -> bool {
        self.lock_live().await.is_err()
    }

    /// Time left before the allocation expires
    pub async fn remaining_lifetime(&self) -> Duration {
        match self.lock_live().await {
            Ok((state, now)) => state.expiration.remaining_at(now),
            Err(_) => Duration::ZERO,
        }
    }

    /// Replaces the deadline with now + `lifetime`
    pub async fn refresh(&self, lifetime: Duration) -> Result<()> {
        let (mut state, now) = self.lock_live().await?;
        state.expiration.refresh_at(now, lifetime);
        Ok(())
    }

    /// Creates or refreshes permissions for every IP in `peers` at once
    pub async fn grant_permissions(&self, peers: &[IpAddr]) -> Result<()> {
        let (mut state, now) = self.lock_live().await?;
        for &peer in peers {
            state.permissions.grant(peer, now);
        }
        Ok(())
    }

    /// Binds `number` to `peer` and refreshes the peer's permission
    pub async fn bind_channel(&self, number: ChannelNumber, peer: SocketAddr) -> Result<()> {
        let (mut state, now) = self.lock_live().await?;
        state.channels.bind(number, peer, now)?;
        state.permissions.grant(peer.ip(), now);
        Ok(())
    }

    /// Whether a live permission exists for `peer`
    pub async fn has_permission(&self, peer: IpAddr) -> bool {
        match self.lock_live().await {
            Ok((state, now)) => state.permissions.is_permitted(peer, now),
            Err(_) => false,
        }
    }

    /// Peer IPs with a live permission
    pub async fn permitted_peers(&self) -> Vec<IpAddr> {
        match self.lock_live().await {
            Ok((state, now)) => state.permissions.permitted_peers(now),
            Err(_) => Vec::new(),
        }
    }

    /// The live channel bound to `peer`, if any
    pub async fn channel_for_peer(&self, peer: SocketAddr) -> Option<ChannelNumber> {
        let (state, now) = self.lock_live().await.ok()?;
        state.channels.number_for(peer, now)
    }

    /// Relays a Send indication payload to `peer`, refreshing its permission
    pub async fn send_to_peer(&self, peer: SocketAddr, payload: &[u8]) -> Result<()> {
        {
            let (mut state, now) = self.lock_live().await?;
            if !state.permissions.refresh_if_permitted(peer.ip(), now) {
                return Err(Error::NoPermission(peer.ip()));
            }
        }
        self.relay_socket.send_to(payload, peer).await?;
        Ok(())
    }

    /// Relays a ChannelData payload to the peer bound to `number`
    pub async fn send_channel_data(&self, number: ChannelNumber, payload: &[u8]) -> Result<()> {
        let peer = {
            let (state, now) = self.lock_live().await?;
            let peer = state
                .channels
                .peer_for(number, now)
                .ok_or(Error::InvalidChannelNumber(number.value()))?;
            if !state.permissions.is_permitted(peer.ip(), now) {
                return Err(Error::NoPermission(peer.ip()));
            }
            peer
        };
        self.relay_socket.send_to(payload, peer).await?;
        Ok(())
    }

    /// Decides how data arriving from `peer` is framed for the client
    pub async fn route_from_peer(&self, peer: SocketAddr) -> PeerRoute {
        let Ok((state, now)) = self.lock_live().await else {
            return PeerRoute::Denied;
        };
        if !state.permissions.is_permitted(peer.ip(), now) {
            return PeerRoute::Denied;
        }
        match state.channels.number_for(peer, now) {
            Some(number) => PeerRoute::Channel(number),
            None => PeerRoute::Indication,
        }
    }

    /// Drops expired permissions and channel bindings
    async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let permissions = state.permissions.remove_expired(now);
        let channels = state.channels.remove_expired(now);
        if permissions + channels > 0 {
            log::debug!(
                "Expired {} permissions and {} channels on {}, {} and {} remain",
                permissions,
                channels,
                self.five_tuple,
                state.permissions.len(),
                state.channels.len()
            );
        }
    }

    pub(crate) fn set_relay_task(&self, handle: AbortHandle) {
        if self.relay_task.set(handle).is_err() {
            log::warn!("Relay task already running for {}", self.five_tuple);
            return;
        }
        // close() may have run before the handle was stored
        if self.is_closed() {
            if let Some(handle) = self.relay_task.get() {
                handle.abort();
            }
        }
    }

    /// Tears the allocation down. Only the first call has any effect.
    ///
    /// # Returns
    /// `true` if this call performed the teardown
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = self.relay_task.get() {
            handle.abort();
        }
        self.reservation.release();
        log::info!(
            "Closed allocation {} relayed at {} for {}",
            self.five_tuple,
            self.relay_addr.0,
            self.username
        );
        true
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("five_tuple", &self.five_tuple)
            .field("relay_addr", &self.relay_addr.0)
            .field("username", &self.username)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.close();
    }
}

/// Manages TURN allocations for the server
pub struct AllocationManager {
    /// Maps client 5-tuples to their allocations
    allocations: DashMap<FiveTuple, Arc<Allocation>>,
    /// Server configuration
    config: Arc<ServerConfig>,
    /// Peer networks that may not be granted permissions
    denied_peers: Vec<IpNetwork>,
    /// Claimed server-wide and per-user slots
    ledger: Arc<CapacityLedger>,
    /// When an Allocate at a limit last swept the store
    last_capacity_sweep: Mutex<Option<Instant>>,
}

impl AllocationManager {
    /// Creates a new allocation manager
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        let denied_peers = config.denied_peer_networks()?;
        let ledger = Arc::new(CapacityLedger::new(
            config.relay.max_allocations,
            config.relay.user_quota,
        ));
        Ok(Self {
            allocations: DashMap::new(),
            config,
            denied_peers,
            ledger,
            last_capacity_sweep: Mutex::new(None),
        })
    }

    /// Looks up the live allocation for a 5-tuple
    ///
    /// An allocation found past its deadline is removed and torn down here,
    /// so callers never observe an expired allocation.
    pub async fn get_allocation(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let allocation = self
            .allocations
            .get(five_tuple)
            .map(|entry| Arc::clone(entry.value()))?;

        if allocation.is_expired().await {
            self.remove_exact(&allocation);
            return None;
        }
        Some(allocation)
    }

    /// Creates an allocation, or returns the existing one for a retransmission
    ///
    /// # Arguments
    /// * `five_tuple` - The client's 5-tuple
    /// * `turn_socket` - Listener socket used to reach the client
    /// * `request` - Authenticated username and requested parameters
    ///
    /// # Returns
    /// * `Ok((allocation, lifetime))` - The allocation and its remaining lifetime
    /// * `Err(Error::AllocationMismatch)` - A different allocation exists for the 5-tuple
    /// * `Err(Error::UnsupportedTransport)` - Transport other than UDP requested
    /// * `Err(Error::QuotaReached)` - The user holds `user_quota` allocations
    /// * `Err(Error::InsufficientCapacity)` - Store full or port range exhausted
    pub async fn create_allocation(
        &self,
        five_tuple: FiveTuple,
        turn_socket: Arc<UdpSocket>,
        request: AllocationRequest,
    ) -> Result<(Arc<Allocation>, Duration)> {
        if let Some(existing) = self.get_allocation(&five_tuple).await {
            return self.retransmission(existing, &request).await;
        }

        if request.transport != PROTOCOL_UDP {
            return Err(Error::UnsupportedTransport(request.transport));
        }

        // Released on every early return below, or by close() once stored
        let reservation = self.reserve_capacity(&request.username).await?;

        let socket = self.bind_relay_socket()?;
        let relay_addr = self.advertised_relay_addr(&five_tuple, socket.local_addr()?);
        let lifetime = self.config.clamp_allocation_lifetime(request.lifetime);

        let allocation = Arc::new(Allocation::new(
            five_tuple,
            relay_addr,
            socket,
            turn_socket,
            request.clone(),
            reservation,
            lifetime,
            &self.config,
        ));

        let existing = match self.allocations.entry(five_tuple) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&allocation));
                None
            }
        };
        if let Some(existing) = existing {
            // Lost a race against a concurrent Allocate from the same 5-tuple
            allocation.close();
            return self.retransmission(existing, &request).await;
        }

        relay::spawn_peer_relay(&allocation, self.config.get_peer_buffer_size());

        log::info!(
            "Created allocation {} relayed at {} for {} ({:?})",
            five_tuple,
            relay_addr.0,
            request.username,
            lifetime
        );
        Ok((allocation, lifetime))
    }

    async fn retransmission(
        &self,
        existing: Arc<Allocation>,
        request: &AllocationRequest,
    ) -> Result<(Arc<Allocation>, Duration)> {
        if !existing.matches_request(request) {
            return Err(Error::AllocationMismatch);
        }
        let remaining = existing.remaining_lifetime().await;
        Ok((existing, remaining))
    }

    /// Claims a slot for `username`, sweeping expired allocations first when
    /// a limit is hit and no such sweep ran within `CAPACITY_SWEEP_INTERVAL`
    async fn reserve_capacity(&self, username: &str) -> Result<CapacityReservation> {
        match self.ledger.reserve(username) {
            Ok(reservation) => Ok(reservation),
            Err(e) => {
                if self.sweep_for_capacity().await == 0 {
                    return Err(e);
                }
                self.ledger.reserve(username)
            }
        }
    }

    async fn sweep_for_capacity(&self) -> usize {
        // A sweep already in flight will free what it can
        let Ok(mut last) = self.last_capacity_sweep.try_lock() else {
            return 0;
        };
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < CAPACITY_SWEEP_INTERVAL) {
            return 0;
        }
        *last = Some(now);
        drop(last);
        self.cleanup_expired().await
    }

    /// Number of allocation slots `username` currently holds
    pub fn user_allocation_count(&self, username: &str) -> usize {
        self.ledger.held_by(username)
    }

    /// Binds a relay socket on a free port of the configured range
    fn bind_relay_socket(&self) -> Result<UdpSocket> {
        let relay = &self.config.relay;
        let ip = relay.relay_address;

        let socket = if relay.min_port == 0 {
            std::net::UdpSocket::bind(SocketAddr::new(ip, 0))?
        } else {
            let span = u32::from(relay.max_port - relay.min_port) + 1;
            let start = rand::thread_rng().gen_range(0..span);
            (0..span)
                .find_map(|i| {
                    let port = relay.min_port + ((start + i) % span) as u16;
                    match std::net::UdpSocket::bind(SocketAddr::new(ip, port)) {
                        Ok(socket) => Some(Ok(socket)),
                        Err(e) if e.kind() == io::ErrorKind::AddrInUse => None,
                        Err(e) => Some(Err(e)),
                    }
                })
                .ok_or_else(|| {
                    Error::InsufficientCapacity(format!(
                        "no free relay port in {}-{}",
                        relay.min_port, relay.max_port
                    ))
                })??
        };

        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket)?)
    }

    fn advertised_relay_addr(&self, five_tuple: &FiveTuple, local: SocketAddr) -> RelayAddress {
        let relay = &self.config.relay;
        let ip = match relay.public_address {
            Some(public) => public,
            None if relay.relay_address.is_unspecified() => five_tuple.dst_addr.ip(),
            None => relay.relay_address,
        };
        RelayAddress::new(SocketAddr::new(ip, local.port()))
    }

    /// Applies a Refresh to `allocation`
    ///
    /// # Returns
    /// The granted lifetime; zero means the allocation was deleted
    pub async fn refresh_allocation(
        &self,
        allocation: &Arc<Allocation>,
        requested: Option<u32>,
    ) -> Result<Lifetime> {
        if requested == Some(0) {
            self.remove_exact(allocation);
            return Ok(Lifetime::new(Duration::ZERO));
        }

        let lifetime = self.config.clamp_allocation_lifetime(requested);
        allocation.refresh(lifetime).await?;
        log::debug!("Refreshed allocation {} for {:?}", allocation.five_tuple(), lifetime);
        Ok(Lifetime::new(lifetime))
    }

    /// Deletes and tears down the allocation for a 5-tuple
    pub fn delete_allocation(&self, five_tuple: &FiveTuple) -> bool {
        match self.allocations.remove(five_tuple) {
            Some((_, allocation)) => allocation.close(),
            None => false,
        }
    }

    /// Removes `allocation` only if it is still the one stored for its 5-tuple
    fn remove_exact(&self, allocation: &Arc<Allocation>) {
        let removed = self
            .allocations
            .remove_if(allocation.five_tuple(), |_, stored| Arc::ptr_eq(stored, allocation));
        if removed.is_some() {
            allocation.close();
        }
    }

    /// Whether `peer` lies in a denied peer range
    pub fn is_peer_denied(&self, peer: IpAddr) -> bool {
        self.denied_peers.iter().any(|net| net.contains(peer))
    }

    /// Removes expired allocations and sweeps the tables of the rest
    ///
    /// # Returns
    /// The number of allocations torn down
    pub async fn cleanup_expired(&self) -> usize {
        let snapshot: Vec<Arc<Allocation>> = self
            .allocations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut expired = 0;
        for allocation in snapshot {
            if allocation.is_expired().await {
                self.remove_exact(&allocation);
                expired += 1;
            } else {
                allocation.sweep().await;
            }
        }
        expired
    }

    /// Tears down every allocation
    pub fn close_all(&self) {
        let five_tuples: Vec<FiveTuple> = self.allocations.iter().map(|entry| *entry.key()).collect();
        for five_tuple in five_tuples {
            self.delete_allocation(&five_tuple);
        }
    }

    /// Number of stored allocations, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
