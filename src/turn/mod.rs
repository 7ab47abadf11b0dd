//! TURN Server Implementation (RFC 5766)
//!
//! This module implements the core TURN server functionality including:
//! - Datagram classification and routing
//! - Allocation management
//! - Permission handling
//! - Channel binding
//! - Peer-to-client relaying
//!
//! Every datagram is processed in its own task. Shared state lives in
//! [`ServerContext`]; the allocation store and each allocation carry their
//! own locks, so there is no server-wide lock.

use crate::auth::{Authenticator, CredentialStore, StaticCredentials};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::proto::{ChannelData, TurnMessage};
use crate::rate_limit::RateLimitStats;
use crate::types::FiveTuple;
use std::net::SocketAddr;
use std::sync::Arc;
use stun_rs::methods::{ALLOCATE, BINDING, CHANNEL_BIND, CREATE_PERMMISSION, REFRESH, SEND};
use stun_rs::{MessageClass, MessageMethod};
use tokio::net::UdpSocket;
use tokio::sync::watch;

mod allocation;
mod channel;
mod permission;
mod relay;
mod request;
#[cfg(test)]
pub(crate) mod testing;

pub use allocation::{Allocation, AllocationManager, AllocationRequest, PeerRoute};

/// Requests that must pass the long-term credential check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthenticatedMethod {
    Allocate,
    Refresh,
    CreatePermission,
    ChannelBind,
}

/// Handler selected for a STUN message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    SendIndication,
    Binding,
    Authenticated(AuthenticatedMethod),
}

static ROUTES: [(MessageClass, MessageMethod, Route); 6] = [
    (MessageClass::Indication, SEND, Route::SendIndication),
    (
        MessageClass::Request,
        ALLOCATE,
        Route::Authenticated(AuthenticatedMethod::Allocate),
    ),
    (
        MessageClass::Request,
        REFRESH,
        Route::Authenticated(AuthenticatedMethod::Refresh),
    ),
    (
        MessageClass::Request,
        CREATE_PERMMISSION,
        Route::Authenticated(AuthenticatedMethod::CreatePermission),
    ),
    (
        MessageClass::Request,
        CHANNEL_BIND,
        Route::Authenticated(AuthenticatedMethod::ChannelBind),
    ),
    (MessageClass::Request, BINDING, Route::Binding),
];

fn route_for(class: MessageClass, method: MessageMethod) -> Option<Route> {
    ROUTES
        .iter()
        .find(|(c, m, _)| *c == class && *m == method)
        .map(|(_, _, route)| *route)
}

/// State shared by every datagram task
pub struct ServerContext {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) allocations: AllocationManager,
    pub(crate) authenticator: Authenticator,
}

impl ServerContext {
    /// Builds the allocation store and authenticator for `config`
    pub fn new(config: Arc<ServerConfig>, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        Ok(Self {
            allocations: AllocationManager::new(Arc::clone(&config))?,
            authenticator: Authenticator::new(&config.auth, credentials)?,
            config,
        })
    }

    pub fn allocations(&self) -> &AllocationManager {
        &self.allocations
    }

    /// Processes one datagram received on `conn` from `src_addr`
    ///
    /// # Arguments
    /// * `conn` - Listener socket the datagram arrived on
    /// * `src_addr` - Source address of the datagram
    /// * `raw` - Datagram bytes
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - Response to send back to `src_addr`
    /// * `Ok(None)` - Nothing to send
    /// * `Err(Error)` - The datagram was dropped; logged by the caller
    pub async fn process(
        &self,
        conn: &Arc<UdpSocket>,
        src_addr: SocketAddr,
        raw: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let five_tuple = FiveTuple::udp(src_addr, conn.local_addr()?);

        if ChannelData::is_channel_data(raw) {
            let frame = ChannelData::decode(raw)?;
            request::handle_channel_data(self, &five_tuple, frame).await?;
            return Ok(None);
        }

        if !TurnMessage::is_stun(raw) {
            return Err(Error::MalformedMessage(format!(
                "{} byte datagram is neither STUN nor ChannelData",
                raw.len()
            )));
        }
        let msg = TurnMessage::decode(raw)?;

        let Some(route) = route_for(msg.class, msg.method) else {
            return Err(Error::UnhandledMessageKind {
                class: format!("{:?}", msg.class),
                method: format!("{:?}", msg.method),
            });
        };

        request::Request {
            ctx: self,
            conn,
            src_addr,
            five_tuple,
            msg,
        }
        .dispatch(route)
        .await
    }

    /// Tears down expired allocations and prunes rate limit state
    pub async fn cleanup(&self) {
        let expired = self.allocations.cleanup_expired().await;
        if expired > 0 {
            log::info!(
                "Cleaned up {} expired allocations, {} remain",
                expired,
                self.allocations.len()
            );
        }
        self.authenticator.cleanup().await;
    }
}

/// A TURN server implementation following RFC 5766.
pub struct TurnServer {
    socket: Arc<UdpSocket>,
    context: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
}

impl TurnServer {
    /// Creates a new TURN server with the users listed in the configuration
    ///
    /// # Errors
    /// Returns error if:
    /// - The configuration fails validation
    /// - Unable to bind to the configured listener address
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let credentials = StaticCredentials::from_config(&config.auth)?;
        Self::with_credentials(config, Arc::new(credentials)).await
    }

    /// Creates a new TURN server that looks keys up in `credentials`
    pub async fn with_credentials(
        config: &ServerConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config.clone());
        let socket = UdpSocket::bind(config.get_bind_address()).await?;
        let context = ServerContext::new(config, credentials)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            context: Arc::new(context),
            shutdown,
        })
    }

    /// Receives datagrams until [`TurnServer::shutdown`] is called.
    ///
    /// This method handles:
    /// - One spawned task per datagram
    /// - Periodic cleanup of expired allocations and rate limit state
    ///
    /// Receive errors are logged and never end the loop. Every allocation
    /// is torn down on shutdown.
    pub async fn run(&self) -> Result<()> {
        log::info!("TURN server running on {}", self.socket.local_addr()?);

        let mut shutdown = self.shutdown.subscribe();
        let mut cleanup_timer = tokio::time::interval(self.context.config.get_cleanup_interval());
        let mut buf = vec![0u8; self.context.config.get_buffer_size()];

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src_addr)) => self.spawn_datagram(buf[..len].to_vec(), src_addr),
                    Err(e) => log::warn!("UDP receive error: {}", e),
                },
                _ = cleanup_timer.tick() => {
                    self.context.cleanup().await;
                }
                _ = shutdown.changed() => {}
            }
        }

        log::info!(
            "TURN server shutting down, closing {} allocations",
            self.context.allocations.len()
        );
        self.context.allocations.close_all();
        Ok(())
    }

    fn spawn_datagram(&self, data: Vec<u8>, src_addr: SocketAddr) {
        let socket = Arc::clone(&self.socket);
        let context = Arc::clone(&self.context);

        tokio::spawn(async move {
            match context.process(&socket, src_addr, &data).await {
                Ok(Some(response)) => {
                    if let Err(e) = socket.send_to(&response, src_addr).await {
                        log::warn!("Failed to send response to {}: {}", src_addr, e);
                    }
                }
                Ok(None) => {}
                Err(e) => log::debug!("Dropped datagram from {}: {}", src_addr, e),
            }
        });
    }

    /// Stops [`TurnServer::run`]
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn allocation_count(&self) -> usize {
        self.context.allocations.len()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Gets statistics about authentication failures
    pub async fn get_rate_limit_stats(&self) -> RateLimitStats {
        self.context.authenticator.rate_limiter().get_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{test_config, Client, USERNAME};
    use super::*;
    use crate::proto::RESPONSE_CAPACITY;
    use crate::types::ChannelNumber;
    use std::time::Duration;
    use stun_rs::attributes::stun::XorMappedAddress;
    use stun_rs::attributes::turn::{
        ChannelNumber as ChannelNumberAttr, Data, LifeTime, XorPeerAddress, XorRelayedAddress,
    };
    use stun_rs::{MessageDecoderBuilder, StunMessageBuilder};

    fn relayed_address(raw: &[u8]) -> SocketAddr {
        let decoder = MessageDecoderBuilder::default().build();
        let (msg, _) = decoder.decode(raw).unwrap();
        *msg.get::<XorRelayedAddress>()
            .unwrap()
            .as_xor_relayed_address()
            .unwrap()
            .socket_address()
    }

    async fn allocated_client(config: ServerConfig) -> (Client, SocketAddr) {
        let mut client = Client::new(config).await;
        client.login().await;
        let response = client.allocate(None).await.unwrap();
        let relay = relayed_address(&response);
        (client, relay)
    }

    async fn permit(client: &Client, peer: SocketAddr) {
        let raw = client
            .signed(
                StunMessageBuilder::new(CREATE_PERMMISSION, MessageClass::Request)
                    .with_attribute(XorPeerAddress::from(peer)),
            )
            .await
            .unwrap();
        assert!(client.verify(&raw));
    }

    async fn bind(client: &Client, number: u16, peer: SocketAddr) {
        let raw = client
            .signed(
                StunMessageBuilder::new(CHANNEL_BIND, MessageClass::Request)
                    .with_attribute(ChannelNumberAttr::new(number))
                    .with_attribute(XorPeerAddress::from(peer)),
            )
            .await
            .unwrap();
        assert!(client.verify(&raw));
    }

    fn send_indication(peer: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let msg = StunMessageBuilder::new(SEND, MessageClass::Indication)
            .with_attribute(XorPeerAddress::from(peer))
            .with_attribute(Data::from(payload))
            .build();
        crate::proto::encode(&msg, RESPONSE_CAPACITY).unwrap()
    }

    async fn peer_recv(peer: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Some((buf, from))
            }
            _ => None,
        }
    }

    #[test]
    fn test_route_table() {
        assert_eq!(
            route_for(MessageClass::Request, ALLOCATE),
            Some(Route::Authenticated(AuthenticatedMethod::Allocate))
        );
        assert_eq!(
            route_for(MessageClass::Indication, SEND),
            Some(Route::SendIndication)
        );
        assert_eq!(route_for(MessageClass::Request, SEND), None);
        assert_eq!(route_for(MessageClass::Indication, ALLOCATE), None);
        assert_eq!(route_for(MessageClass::SuccessResponse, BINDING), None);
    }

    #[tokio::test]
    async fn test_malformed_and_unrouted_datagrams_dropped() {
        let client = Client::new(ServerConfig::default()).await;

        let err = client.deliver(&[0xFF; 30]).await.unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));

        let err = client.deliver(&[0x40, 0x01, 0x00, 0x10, 0xAA]).await.unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));

        let response = StunMessageBuilder::new(BINDING, MessageClass::SuccessResponse).build();
        let raw = crate::proto::encode(&response, RESPONSE_CAPACITY).unwrap();
        let err = client.deliver(&raw).await.unwrap_err();
        assert!(matches!(err, Error::UnhandledMessageKind { .. }));
    }

    #[tokio::test]
    async fn test_send_indication_and_data_indication_round_trip() {
        let (client, relay) = allocated_client(ServerConfig::default()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        permit(&client, peer_addr).await;

        assert_eq!(
            client
                .deliver(&send_indication(peer_addr, b"to peer"))
                .await
                .unwrap(),
            None
        );
        let (payload, from) = peer_recv(&peer).await.unwrap();
        assert_eq!(payload, b"to peer");
        assert_eq!(from.port(), relay.port());

        peer.send_to(b"to client", from).await.unwrap();
        let frame = client.recv().await.unwrap();
        let indication = TurnMessage::decode(&frame).unwrap();
        assert_eq!(indication.class, MessageClass::Indication);
        assert_eq!(indication.method, stun_rs::methods::DATA);
        assert_eq!(indication.peer_addresses, vec![peer_addr]);
        assert_eq!(indication.data.as_deref(), Some(&b"to client"[..]));
    }

    #[tokio::test]
    async fn test_channel_data_both_directions() {
        let (client, relay) = allocated_client(ServerConfig::default()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        bind(&client, 0x4001, peer_addr).await;

        let frame = ChannelData {
            number: ChannelNumber::new(0x4001).unwrap(),
            payload: bytes::Bytes::from_static(b"via channel"),
        };
        client.deliver(&frame.encode().unwrap()).await.unwrap();
        let (payload, _) = peer_recv(&peer).await.unwrap();
        assert_eq!(payload, b"via channel");

        peer.send_to(b"back", relay).await.unwrap();
        let raw = client.recv().await.unwrap();
        let frame = ChannelData::decode(&raw).unwrap();
        assert_eq!(frame.number.value(), 0x4001);
        assert_eq!(&frame.payload[..], b"back");
    }

    #[tokio::test]
    async fn test_unbound_channel_data_dropped() {
        let (client, _) = allocated_client(ServerConfig::default()).await;
        let frame = ChannelData {
            number: ChannelNumber::new(0x4002).unwrap(),
            payload: bytes::Bytes::from_static(b"nowhere"),
        };
        let err = client.deliver(&frame.encode().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidChannelNumber(0x4002)));
    }

    #[tokio::test]
    async fn test_peer_without_permission_dropped() {
        let (client, relay) = allocated_client(ServerConfig::default()).await;
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        permit(&client, "192.0.2.1:9000".parse().unwrap()).await;

        stranger.send_to(b"let me in", relay).await.unwrap();
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_framing_follows_channel_expiry() {
        let mut config = ServerConfig::default();
        config.timeouts.channel_lifetime = Duration::from_millis(200);
        let (client, relay) = allocated_client(config).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        bind(&client, 0x4001, peer.local_addr().unwrap()).await;

        peer.send_to(b"first", relay).await.unwrap();
        let raw = client.recv().await.unwrap();
        assert!(ChannelData::is_channel_data(&raw));

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Permission outlives the binding
        peer.send_to(b"second", relay).await.unwrap();
        let raw = client.recv().await.unwrap();
        let indication = TurnMessage::decode(&raw).unwrap();
        assert_eq!(indication.data.as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_permission_expiry_stops_relay() {
        let mut config = ServerConfig::default();
        config.timeouts.permission_lifetime = Duration::from_millis(200);
        let (client, relay) = allocated_client(config).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        permit(&client, peer_addr).await;

        peer.send_to(b"early", relay).await.unwrap();
        assert!(client.recv().await.is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;

        peer.send_to(b"late", relay).await.unwrap();
        assert!(client.recv().await.is_none());
        let err = client
            .deliver(&send_indication(peer_addr, b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPermission(_)));
    }

    #[tokio::test]
    async fn test_deleted_allocation_stops_relay() {
        let (client, relay) = allocated_client(ServerConfig::default()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        permit(&client, peer.local_addr().unwrap()).await;

        client
            .signed(
                StunMessageBuilder::new(REFRESH, MessageClass::Request)
                    .with_attribute(LifeTime::new(0)),
            )
            .await
            .unwrap();
        assert!(client.ctx.allocations().is_empty());

        peer.send_to(b"anyone?", relay).await.unwrap();
        assert!(client.recv().await.is_none());

        // The relay port is free again
        let rebound = UdpSocket::bind(relay).await.unwrap();
        assert_eq!(rebound.local_addr().unwrap(), relay);
        assert_eq!(client.ctx.allocations().user_allocation_count(USERNAME), 0);
    }

    #[tokio::test]
    async fn test_server_answers_over_udp_and_shuts_down() {
        let server = Arc::new(TurnServer::new(&test_config(ServerConfig::default())).await.unwrap());
        let server_addr = server.local_addr().unwrap();
        let runner = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = StunMessageBuilder::new(BINDING, MessageClass::Request).build();
        let raw = crate::proto::encode(&request, RESPONSE_CAPACITY).unwrap();
        client.send_to(&raw, server_addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let decoder = MessageDecoderBuilder::default().build();
        let (response, _) = decoder.decode(&buf[..len]).unwrap();
        let mapped = response
            .get::<XorMappedAddress>()
            .unwrap()
            .as_xor_mapped_address()
            .unwrap()
            .socket_address();
        assert_eq!(*mapped, client.local_addr().unwrap());

        // Garbage does not stop the listener
        client.send_to(&[0xFF; 8], server_addr).await.unwrap();

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config(ServerConfig::default());
        config.timeouts.min_allocation_lifetime = Duration::from_secs(7200);
        assert!(matches!(
            TurnServer::new(&config).await,
            Err(Error::Config(_))
        ));
    }
}
