//! Test client that drives a [`ServerContext`] with signed requests

use super::allocation::Allocation;
use super::ServerContext;
use crate::auth::StaticCredentials;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::proto;
use crate::types::FiveTuple;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stun_rs::attributes::stun::{MessageIntegrity, Nonce, Realm, UserName};
use stun_rs::attributes::turn::{LifeTime, RequestedTrasport};
use stun_rs::methods::ALLOCATE;
use stun_rs::protocols::UDP;
use stun_rs::{
    Algorithm, AlgorithmId, DecoderContextBuilder, HMACKey, MessageClass, MessageDecoderBuilder,
    StunMessage, StunMessageBuilder,
};
use tokio::net::UdpSocket;

pub(crate) const REALM: &str = "example.org";
pub(crate) const USERNAME: &str = "alice";
pub(crate) const PASSWORD: &str = "secret";

/// Local relay on loopback with an ephemeral port per allocation
pub(crate) fn test_config(mut config: ServerConfig) -> ServerConfig {
    config.transport.listen_address = "127.0.0.1".parse().unwrap();
    config.transport.port = 0;
    config.auth.realm = REALM.to_string();
    config
        .auth
        .users
        .insert(USERNAME.to_string(), PASSWORD.to_string());
    config.relay.relay_address = "127.0.0.1".parse().unwrap();
    config.relay.min_port = 0;
    config.relay.max_port = 0;
    config
}

/// A peer address nobody listens on
pub(crate) fn peer_addr() -> SocketAddr {
    "192.0.2.1:9000".parse().unwrap()
}

pub(crate) struct Client {
    pub ctx: Arc<ServerContext>,
    pub conn: Arc<UdpSocket>,
    pub socket: UdpSocket,
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
    pub nonce: String,
}

impl Client {
    pub async fn new(config: ServerConfig) -> Self {
        let config = Arc::new(test_config(config));
        let credentials = Arc::new(StaticCredentials::from_config(&config.auth).unwrap());
        let ctx = Arc::new(ServerContext::new(config, credentials).unwrap());
        let conn = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Self::attach(ctx, conn).await
    }

    async fn attach(ctx: Arc<ServerContext>, conn: Arc<UdpSocket>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        Self {
            ctx,
            conn,
            socket,
            addr,
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
            nonce: String::new(),
        }
    }

    /// Another client of the same server, on a new source port
    pub async fn with_new_source(&self) -> Self {
        Self::attach(Arc::clone(&self.ctx), Arc::clone(&self.conn)).await
    }

    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple::udp(self.addr, self.conn.local_addr().unwrap())
    }

    pub fn key(&self) -> HMACKey {
        HMACKey::new_long_term(
            self.username.as_str(),
            REALM,
            self.password.as_str(),
            Algorithm::from(AlgorithmId::MD5),
        )
        .unwrap()
    }

    /// Hands one encoded datagram to the server context
    pub async fn deliver(&self, raw: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ctx.process(&self.conn, self.addr, raw).await
    }

    /// Sends `msg` and returns the response it must produce
    pub async fn process(&self, msg: StunMessage) -> Result<Vec<u8>> {
        let raw = proto::encode(&msg, 2048).unwrap();
        self.deliver(&raw)
            .await
            .map(|response| response.expect("request got no response"))
    }

    /// Picks up a nonce from the 401 challenge to an unsigned Allocate
    pub async fn login(&mut self) {
        let challenge = self
            .process(StunMessageBuilder::new(ALLOCATE, MessageClass::Request).build())
            .await
            .unwrap();

        let decoder = MessageDecoderBuilder::default().build();
        let (msg, _) = decoder.decode(&challenge).unwrap();
        self.nonce = msg
            .get::<Nonce>()
            .unwrap()
            .as_nonce()
            .unwrap()
            .as_str()
            .to_owned();
    }

    /// Adds the long-term credential attributes and sends the request
    pub async fn signed(&self, builder: StunMessageBuilder) -> Result<Vec<u8>> {
        let msg = builder
            .with_attribute(UserName::new(self.username.as_str()).unwrap())
            .with_attribute(Realm::new(REALM).unwrap())
            .with_attribute(Nonce::new(self.nonce.as_str()).unwrap())
            .with_attribute(MessageIntegrity::new(self.key()))
            .build();
        self.process(msg).await
    }

    pub async fn allocate(&self, lifetime: Option<u32>) -> Result<Vec<u8>> {
        let mut builder = StunMessageBuilder::new(ALLOCATE, MessageClass::Request)
            .with_attribute(RequestedTrasport::new(UDP));
        if let Some(lifetime) = lifetime {
            builder = builder.with_attribute(LifeTime::new(lifetime));
        }
        self.signed(builder).await
    }

    /// Whether `raw` carries a MESSAGE-INTEGRITY valid under this client's key
    pub fn verify(&self, raw: &[u8]) -> bool {
        let ctx = DecoderContextBuilder::default()
            .with_key(self.key())
            .with_validation()
            .build();
        let decoder = MessageDecoderBuilder::default().with_context(ctx).build();
        decoder
            .decode(raw)
            .map(|(msg, _)| msg.get::<MessageIntegrity>().is_some())
            .unwrap_or(false)
    }

    pub async fn allocation(&self) -> Arc<Allocation> {
        self.ctx
            .allocations
            .get_allocation(&self.five_tuple())
            .await
            .expect("client has no allocation")
    }

    /// Next datagram relayed to this client, if one arrives within a second
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(Duration::from_secs(1), self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                buf.truncate(len);
                Some(buf)
            }
            _ => None,
        }
    }
}
