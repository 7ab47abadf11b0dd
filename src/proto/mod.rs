//! Wire codecs: STUN messages through `stun-rs` and ChannelData framing

mod channel_data;
mod message;

pub use channel_data::{ChannelData, CHANNEL_DATA_HEADER_SIZE};
pub use message::{append_integrity, encode, IntegrityCheck, TurnMessage, RESPONSE_CAPACITY};
