//! ChannelData framing
//!
//! ```text
//!  0                   1                   2                   3
//! +-------------------------------+-------------------------------+
//! |         Channel Number        |            Length             |
//! +-------------------------------+-------------------------------+
//! /                       Application Data                        /
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames are padded to a multiple of four bytes. Over UDP the padding may be
//! absent, so decoding only requires `Length` bytes after the header.

use crate::error::{Error, Result};
use crate::types::ChannelNumber;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

pub const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// A decoded ChannelData frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub number: ChannelNumber,
    pub payload: Bytes,
}

impl ChannelData {
    /// Whether the datagram's leading bits mark it as ChannelData
    pub fn is_channel_data(raw: &[u8]) -> bool {
        raw.len() >= CHANNEL_DATA_HEADER_SIZE && (raw[0] & 0xC0) == 0x40
    }

    /// Decodes a ChannelData frame
    ///
    /// # Arguments
    /// * `raw` - The datagram as received
    ///
    /// # Returns
    /// * `Ok(ChannelData)` with the payload trimmed to the declared length
    /// * `Err(Error::MalformedMessage)` on a short frame or bad channel number
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::MalformedMessage(format!(
                "ChannelData frame of {} bytes is shorter than its header",
                raw.len()
            )));
        }

        let number = BigEndian::read_u16(&raw[0..2]);
        let number = ChannelNumber::new(number).ok_or_else(|| {
            Error::MalformedMessage(format!("channel number {:#06x} out of range", number))
        })?;

        let length = BigEndian::read_u16(&raw[2..4]) as usize;
        let body = &raw[CHANNEL_DATA_HEADER_SIZE..];
        if length > body.len() {
            return Err(Error::MalformedMessage(format!(
                "ChannelData length {} exceeds {} available bytes",
                length,
                body.len()
            )));
        }

        Ok(Self {
            number,
            payload: Bytes::copy_from_slice(&body[..length]),
        })
    }

    /// Encodes the frame, padded to a four byte boundary
    pub fn encode(&self) -> Result<Bytes> {
        let length = u16::try_from(self.payload.len()).map_err(|_| {
            Error::BadRequest(format!(
                "payload of {} bytes does not fit a ChannelData frame",
                self.payload.len()
            ))
        })?;

        let padded = (self.payload.len() + 3) & !3;
        let mut frame = BytesMut::with_capacity(CHANNEL_DATA_HEADER_SIZE + padded);
        frame.put_u16(self.number.value());
        frame.put_u16(length);
        frame.put_slice(&self.payload);
        frame.put_bytes(0, padded - self.payload.len());
        Ok(frame.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(value: u16) -> ChannelNumber {
        ChannelNumber::new(value).unwrap()
    }

    #[test]
    fn test_encode_pads_to_four_bytes() {
        let frame = ChannelData {
            number: channel(0x4001),
            payload: Bytes::from_static(b"hello"),
        }
        .encode()
        .unwrap();

        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[..4], &[0x40, 0x01, 0x00, 0x05]);
        assert_eq!(&frame[4..9], b"hello");
        assert_eq!(&frame[9..], &[0, 0, 0]);
    }

    #[test]
    fn test_encode_aligned_payload_has_no_padding() {
        let frame = ChannelData {
            number: channel(0x7FFF),
            payload: Bytes::from_static(b"abcd"),
        }
        .encode()
        .unwrap();

        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_decode_padded_and_unpadded() {
        let padded = [0x40, 0x02, 0x00, 0x03, b'a', b'b', b'c', 0x00];
        let unpadded = [0x40, 0x02, 0x00, 0x03, b'a', b'b', b'c'];

        let a = ChannelData::decode(&padded).unwrap();
        let b = ChannelData::decode(&unpadded).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.number.value(), 0x4002);
        assert_eq!(&a.payload[..], b"abc");
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(
            ChannelData::decode(&[0x40, 0x01]),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            ChannelData::decode(&[0x40, 0x01, 0x00, 0x08, 1, 2, 3]),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            ChannelData::decode(&[0x80, 0x01, 0x00, 0x00]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_is_channel_data() {
        assert!(ChannelData::is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(ChannelData::is_channel_data(&[0x7F, 0xFF, 0x00, 0x00]));
        // STUN messages start with two zero bits
        assert!(!ChannelData::is_channel_data(&[0x00, 0x01, 0x00, 0x00]));
        assert!(!ChannelData::is_channel_data(&[0x40, 0x00]));
    }
}
