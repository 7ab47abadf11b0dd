//! TURN request handlers
//!
//! One handler per routed (class, method) pair plus the ChannelData fast
//! path. Handlers run inside the per-datagram task; responses are built and
//! encoded by the synchronous helpers at the bottom of this file so that no
//! `stun-rs` message is alive across an await point.

use super::allocation::{Allocation, AllocationRequest};
use super::{AuthenticatedMethod, Route, ServerContext};
use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::proto::{self, ChannelData, TurnMessage, RESPONSE_CAPACITY};
use crate::types::{ChannelNumber, FiveTuple, Lifetime};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use stun_rs::attributes::stun::{ErrorCode, Fingerprint, Nonce, Realm, XorMappedAddress};
use stun_rs::attributes::turn::{LifeTime, XorRelayedAddress};
use stun_rs::{
    ErrorCode as ErrorCodeType, MessageClass, MessageMethod, StunAttribute, StunMessageBuilder,
    TransactionId,
};
use tokio::net::UdpSocket;

/// A decoded STUN message together with where it came from
pub(crate) struct Request<'a> {
    pub ctx: &'a ServerContext,
    pub conn: &'a Arc<UdpSocket>,
    pub src_addr: SocketAddr,
    pub five_tuple: FiveTuple,
    pub msg: TurnMessage,
}

impl Request<'_> {
    /// Runs the handler for `route`
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - A success or error response for the client
    /// * `Ok(None)` - Indications, which never get a response
    /// * `Err(_)` - Errors without a STUN code; the datagram is dropped
    pub async fn dispatch(self, route: Route) -> Result<Option<Vec<u8>>> {
        match route {
            Route::Binding => self.handle_binding().map(Some),
            Route::SendIndication => {
                self.handle_send_indication().await?;
                Ok(None)
            }
            Route::Authenticated(method) => self.handle_authenticated(method).await,
        }
    }

    async fn handle_authenticated(&self, method: AuthenticatedMethod) -> Result<Option<Vec<u8>>> {
        let credentials = match self
            .ctx
            .authenticator
            .authenticate(&self.msg, self.src_addr)
            .await
        {
            Ok(credentials) => credentials,
            Err(e) => return self.reject(e, None),
        };

        let result = match method {
            AuthenticatedMethod::Allocate => self.handle_allocate(&credentials).await,
            AuthenticatedMethod::Refresh => self.handle_refresh(&credentials).await,
            AuthenticatedMethod::CreatePermission => {
                self.handle_create_permission(&credentials).await
            }
            AuthenticatedMethod::ChannelBind => self.handle_channel_bind(&credentials).await,
        };

        match result {
            Ok(response) => Ok(Some(response)),
            Err(e) => self.reject(e, Some(&credentials.key)),
        }
    }

    /// Translates a handler error into an error response
    ///
    /// Challenges carry a fresh NONCE and the REALM. Responses to an
    /// authenticated request are signed with the requester's key.
    fn reject(&self, err: Error, key: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let Some(code) = err.to_stun_error_code() else {
            return Err(err);
        };
        log::debug!(
            "{:?} from {} rejected with {}: {}",
            self.msg.method,
            self.src_addr,
            code,
            err
        );

        let nonce = if err.is_challenge() {
            Some(self.ctx.authenticator.issue_nonce()?)
        } else {
            None
        };
        let challenge = nonce
            .as_deref()
            .map(|nonce| (nonce, self.ctx.authenticator.realm()));

        error_response(
            self.msg.method,
            self.msg.transaction_id,
            code,
            err.to_stun_error_message(),
            challenge,
            key,
        )
        .map(Some)
    }

    /// The live allocation for this 5-tuple, checked against its owner
    async fn allocation_for(&self, credentials: &Credentials) -> Result<Arc<Allocation>> {
        let allocation = self
            .ctx
            .allocations
            .get_allocation(&self.five_tuple)
            .await
            .ok_or(Error::AllocationNotFound)?;

        if self.ctx.config.auth.enforce_allocation_owner
            && allocation.username() != credentials.username
        {
            return Err(Error::WrongCredentials(allocation.username().to_owned()));
        }
        Ok(allocation)
    }

    fn check_peer(&self, peer: IpAddr) -> Result<()> {
        if self.ctx.allocations.is_peer_denied(peer) {
            return Err(Error::Forbidden(peer));
        }
        Ok(())
    }

    /// Handles a STUN Binding request (RFC 5389 Section 7.3)
    ///
    /// Reports the source address as XOR-MAPPED-ADDRESS. The allocation
    /// store is not touched and no authentication is required.
    fn handle_binding(&self) -> Result<Vec<u8>> {
        binding_response(self.msg.method, self.msg.transaction_id, self.src_addr)
    }

    /// Handles an Allocate request (RFC 5766 Section 6.2)
    ///
    /// # Error Responses
    /// * 400 Bad Request - REQUESTED-TRANSPORT missing
    /// * 437 Allocation Mismatch - A different allocation exists for the 5-tuple
    /// * 442 Unsupported Transport Protocol - Transport other than UDP
    /// * 486 Allocation Quota Reached - Per-user limit hit
    /// * 508 Insufficient Capacity - Store full or no relay port free
    ///
    /// # Example Flow
    /// ```text
    /// Client                    Server
    ///   |                         |
    ///   |--- Allocate Request --->|
    ///   |<-- 401 + NONCE, REALM --|
    ///   |--- Allocate + MI ------>|
    ///   |<-- Success + RELAYED ---|
    /// ```
    async fn handle_allocate(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let transport = self
            .msg
            .requested_transport
            .ok_or_else(|| Error::BadRequest("missing REQUESTED-TRANSPORT".into()))?;

        let request = AllocationRequest {
            username: credentials.username.clone(),
            transport,
            lifetime: self.msg.lifetime,
        };
        let (allocation, lifetime) = self
            .ctx
            .allocations
            .create_allocation(self.five_tuple, Arc::clone(self.conn), request)
            .await?;

        success_response(
            self.msg.method,
            self.msg.transaction_id,
            vec![
                XorRelayedAddress::from(allocation.relay_addr()).into(),
                LifeTime::new(Lifetime::new(lifetime).get()).into(),
                XorMappedAddress::from(self.src_addr).into(),
            ],
            &credentials.key,
        )
    }

    /// Handles a Refresh request (RFC 5766 Section 7.2)
    ///
    /// A LIFETIME of zero deletes the allocation and answers with LIFETIME 0.
    ///
    /// # Error Responses
    /// * 437 Allocation Mismatch - No allocation for the 5-tuple
    /// * 441 Wrong Credentials - Owner check enabled and user differs
    async fn handle_refresh(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let allocation = self.allocation_for(credentials).await?;
        let lifetime = self
            .ctx
            .allocations
            .refresh_allocation(&allocation, self.msg.lifetime)
            .await?;

        success_response(
            self.msg.method,
            self.msg.transaction_id,
            vec![LifeTime::new(lifetime.get()).into()],
            &credentials.key,
        )
    }

    /// Handles a CreatePermission request (RFC 5766 Section 9.2)
    ///
    /// Every XOR-PEER-ADDRESS is installed, or none is.
    ///
    /// # Error Responses
    /// * 400 Bad Request - No XOR-PEER-ADDRESS
    /// * 403 Forbidden - A peer lies in a denied range
    /// * 437 Allocation Mismatch - No allocation for the 5-tuple
    async fn handle_create_permission(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let allocation = self.allocation_for(credentials).await?;

        if self.msg.peer_addresses.is_empty() {
            return Err(Error::BadRequest("missing XOR-PEER-ADDRESS".into()));
        }
        let peers: Vec<IpAddr> = self.msg.peer_addresses.iter().map(SocketAddr::ip).collect();
        for &peer in &peers {
            self.check_peer(peer)?;
        }

        allocation.grant_permissions(&peers).await?;
        log::debug!(
            "Installed permissions for {:?} on {}",
            peers,
            allocation.relay_addr()
        );

        success_response(self.msg.method, self.msg.transaction_id, Vec::new(), &credentials.key)
    }

    /// Handles a ChannelBind request (RFC 5766 Section 11.2)
    ///
    /// # Error Responses
    /// * 400 Bad Request - Attribute missing, number out of range, or a
    ///   conflicting live binding
    /// * 403 Forbidden - Peer lies in a denied range
    /// * 437 Allocation Mismatch - No allocation for the 5-tuple
    async fn handle_channel_bind(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let allocation = self.allocation_for(credentials).await?;

        let number = self
            .msg
            .channel_number
            .ok_or_else(|| Error::BadRequest("missing CHANNEL-NUMBER".into()))?;
        let number = ChannelNumber::new(number).ok_or(Error::InvalidChannelNumber(number))?;
        let peer = *self
            .msg
            .peer_addresses
            .first()
            .ok_or_else(|| Error::BadRequest("missing XOR-PEER-ADDRESS".into()))?;
        self.check_peer(peer.ip())?;

        allocation.bind_channel(number, peer).await?;
        log::debug!(
            "Bound channel {} to {} on {}",
            number,
            peer,
            allocation.relay_addr()
        );

        success_response(self.msg.method, self.msg.transaction_id, Vec::new(), &credentials.key)
    }

    /// Handles a Send indication (RFC 5766 Section 10.2)
    async fn handle_send_indication(&self) -> Result<()> {
        let allocation = self
            .ctx
            .allocations
            .get_allocation(&self.five_tuple)
            .await
            .ok_or(Error::AllocationNotFound)?;

        let peer = *self
            .msg
            .peer_addresses
            .first()
            .ok_or_else(|| Error::BadRequest("Send indication without XOR-PEER-ADDRESS".into()))?;
        let data = self
            .msg
            .data
            .as_ref()
            .ok_or_else(|| Error::BadRequest("Send indication without DATA".into()))?;

        allocation.send_to_peer(peer, data).await
    }
}

/// Relays a ChannelData frame from the client to its bound peer
pub(crate) async fn handle_channel_data(
    ctx: &ServerContext,
    five_tuple: &FiveTuple,
    frame: ChannelData,
) -> Result<()> {
    let allocation = ctx
        .allocations
        .get_allocation(five_tuple)
        .await
        .ok_or(Error::AllocationNotFound)?;
    allocation.send_channel_data(frame.number, &frame.payload).await
}

fn success_response(
    method: MessageMethod,
    transaction_id: TransactionId,
    attributes: Vec<StunAttribute>,
    key: &[u8],
) -> Result<Vec<u8>> {
    let mut builder = StunMessageBuilder::new(method, MessageClass::SuccessResponse)
        .with_transaction_id(transaction_id);
    for attribute in attributes {
        builder = builder.with_attribute(attribute);
    }

    let mut raw = proto::encode(&builder.build(), RESPONSE_CAPACITY)?;
    proto::append_integrity(&mut raw, key)?;
    Ok(raw)
}

fn error_response(
    method: MessageMethod,
    transaction_id: TransactionId,
    code: u16,
    reason: &str,
    challenge: Option<(&str, &str)>,
    key: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut builder = StunMessageBuilder::new(method, MessageClass::ErrorResponse)
        .with_transaction_id(transaction_id)
        .with_attribute(ErrorCode::new(ErrorCodeType::new(code, reason)?));
    if let Some((nonce, realm)) = challenge {
        builder = builder
            .with_attribute(Nonce::new(nonce)?)
            .with_attribute(Realm::new(realm)?);
    }

    let mut raw = proto::encode(&builder.build(), RESPONSE_CAPACITY)?;
    if let Some(key) = key {
        proto::append_integrity(&mut raw, key)?;
    }
    Ok(raw)
}

fn binding_response(
    method: MessageMethod,
    transaction_id: TransactionId,
    mapped: SocketAddr,
) -> Result<Vec<u8>> {
    let msg = StunMessageBuilder::new(method, MessageClass::SuccessResponse)
        .with_transaction_id(transaction_id)
        .with_attribute(XorMappedAddress::from(mapped))
        .with_attribute(Fingerprint::default())
        .build();
    proto::encode(&msg, RESPONSE_CAPACITY)
}
