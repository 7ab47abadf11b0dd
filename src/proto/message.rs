//! STUN message adapter
//!
//! `stun-rs` messages share attribute buffers through `Rc` and so cannot be
//! held by a spawned task across an await point. Requests are decoded once
//! into [`TurnMessage`], an owned view of the attributes the relay acts on,
//! and responses are built and encoded synchronously into plain bytes.

use crate::auth::new_mac;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use hmac::Mac;
use std::net::SocketAddr;
use stun_rs::attributes::stun::MessageIntegrity;
use stun_rs::{
    MessageClass, MessageDecoderBuilder, MessageEncoderBuilder, MessageMethod, StunAttribute,
    StunMessage, TransactionId, MESSAGE_HEADER_SIZE,
};

const MESSAGE_INTEGRITY_TYPE: u16 = 0x0008;
const ATTRIBUTE_HEADER_SIZE: usize = 4;
const HMAC_SHA1_SIZE: usize = 20;

/// Room for the header and the handful of attributes a response carries
pub const RESPONSE_CAPACITY: usize = 512;

/// The bytes covered by MESSAGE-INTEGRITY and the MAC the sender computed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityCheck {
    input: Vec<u8>,
    mac: [u8; HMAC_SHA1_SIZE],
}

impl IntegrityCheck {
    /// Locates MESSAGE-INTEGRITY in a raw message
    fn extract(raw: &[u8]) -> Option<Self> {
        let input = stun_rs::get_input_text::<MessageIntegrity>(raw)?;
        let start = input.len() + ATTRIBUTE_HEADER_SIZE;
        let mac = raw.get(start..start + HMAC_SHA1_SIZE)?.try_into().ok()?;
        Some(Self { input, mac })
    }

    /// Recomputes HMAC-SHA1 with `key` and compares in constant time
    pub fn verify(&self, key: &[u8]) -> Result<bool> {
        let mut mac = new_mac(key)?;
        mac.update(&self.input);
        Ok(mac.verify_slice(&self.mac).is_ok())
    }
}

/// A decoded STUN/TURN message with owned attribute values
#[derive(Debug, Clone)]
pub struct TurnMessage {
    pub class: MessageClass,
    pub method: MessageMethod,
    pub transaction_id: TransactionId,
    pub username: Option<String>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub integrity: Option<IntegrityCheck>,
    pub lifetime: Option<u32>,
    pub requested_transport: Option<u8>,
    pub peer_addresses: Vec<SocketAddr>,
    pub channel_number: Option<u16>,
    pub data: Option<Bytes>,
}

impl TurnMessage {
    /// Decodes a STUN datagram
    ///
    /// Only the first occurrence of each single-valued attribute is kept.
    /// Every XOR-PEER-ADDRESS is kept, in order. Attributes after
    /// MESSAGE-INTEGRITY are ignored by the decoder.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let decoder = MessageDecoderBuilder::default().build();
        let (msg, _) = decoder.decode(raw)?;

        let mut decoded = Self::from_header(&msg);
        for attr in msg.attributes() {
            match attr {
                StunAttribute::UserName(attr) if decoded.username.is_none() => {
                    decoded.username = Some(attr.as_str().to_owned());
                }
                StunAttribute::Realm(attr) if decoded.realm.is_none() => {
                    decoded.realm = Some(attr.as_str().to_owned());
                }
                StunAttribute::Nonce(attr) if decoded.nonce.is_none() => {
                    decoded.nonce = Some(attr.as_str().to_owned());
                }
                StunAttribute::LifeTime(attr) if decoded.lifetime.is_none() => {
                    decoded.lifetime = Some(attr.as_u32());
                }
                StunAttribute::RequestedTrasport(attr) if decoded.requested_transport.is_none() => {
                    decoded.requested_transport = Some(attr.protocol().as_u8());
                }
                StunAttribute::ChannelNumber(attr) if decoded.channel_number.is_none() => {
                    decoded.channel_number = Some(attr.number());
                }
                StunAttribute::Data(attr) if decoded.data.is_none() => {
                    decoded.data = Some(Bytes::copy_from_slice(attr.as_bytes()));
                }
                StunAttribute::XorPeerAddress(attr) => {
                    decoded.peer_addresses.push(*attr.socket_address());
                }
                _ => {}
            }
        }
        decoded.integrity = IntegrityCheck::extract(raw);

        Ok(decoded)
    }

    fn from_header(msg: &StunMessage) -> Self {
        Self {
            class: msg.class(),
            method: msg.method(),
            transaction_id: *msg.transaction_id(),
            username: None,
            realm: None,
            nonce: None,
            integrity: None,
            lifetime: None,
            requested_transport: None,
            peer_addresses: Vec::new(),
            channel_number: None,
            data: None,
        }
    }

    /// Whether the datagram's leading bits allow it to be STUN
    pub fn is_stun(raw: &[u8]) -> bool {
        raw.len() >= MESSAGE_HEADER_SIZE && (raw[0] & 0xC0) == 0
    }
}

/// Encodes `msg` into a buffer of at most `capacity` bytes
pub fn encode(msg: &StunMessage, capacity: usize) -> Result<Vec<u8>> {
    let encoder = MessageEncoderBuilder::default().build();
    let mut buffer = vec![0u8; capacity];
    let size = encoder.encode(&mut buffer, msg)?;
    buffer.truncate(size);
    Ok(buffer)
}

/// Appends MESSAGE-INTEGRITY computed with `key` to an encoded message.
///
/// The header length is extended to cover the new attribute before the MAC
/// is computed, as the receiver will do when checking it.
pub fn append_integrity(buffer: &mut Vec<u8>, key: &[u8]) -> Result<()> {
    if buffer.len() < MESSAGE_HEADER_SIZE {
        return Err(Error::Stun(format!(
            "cannot sign a {} byte message",
            buffer.len()
        )));
    }

    let length = BigEndian::read_u16(&buffer[2..4]) as usize
        + ATTRIBUTE_HEADER_SIZE
        + HMAC_SHA1_SIZE;
    let length = u16::try_from(length)
        .map_err(|_| Error::Stun("message too long for MESSAGE-INTEGRITY".into()))?;
    BigEndian::write_u16(&mut buffer[2..4], length);

    let mut mac = new_mac(key)?;
    mac.update(buffer);
    let tag = mac.finalize().into_bytes();

    buffer.write_u16::<BigEndian>(MESSAGE_INTEGRITY_TYPE)?;
    buffer.write_u16::<BigEndian>(HMAC_SHA1_SIZE as u16)?;
    buffer.extend_from_slice(&tag);
    Ok(())
}
