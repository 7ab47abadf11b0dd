//! Peer-to-client relay
//!
//! Each allocation owns one task that reads its relay socket and forwards
//! permitted datagrams to the client, framed as ChannelData when the peer
//! has a live channel and as a Data indication otherwise. The task holds a
//! weak reference so it never keeps a deleted allocation alive.

use crate::error::Result;
use crate::proto::{self, ChannelData};
use crate::turn::allocation::{Allocation, PeerRoute};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use stun_rs::attributes::turn::{Data, XorPeerAddress};
use stun_rs::methods::DATA;
use stun_rs::{MessageClass, StunMessageBuilder};

/// STUN header plus XOR-PEER-ADDRESS and the DATA attribute header
const DATA_INDICATION_OVERHEAD: usize = 64;

/// Pause after a transient receive error before reading again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Starts the relay task for `allocation`
///
/// # Arguments
/// * `allocation` - The allocation whose relay socket is read
/// * `buffer_size` - Largest datagram accepted from a peer
pub(crate) fn spawn_peer_relay(allocation: &Arc<Allocation>, buffer_size: usize) {
    let weak = Arc::downgrade(allocation);
    let socket = allocation.relay_socket();
    let turn_socket = allocation.turn_socket();
    let client = allocation.five_tuple().src_addr;

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    log::debug!("Transient relay socket error for {}: {}", client, e);
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    log::warn!("Relay socket for {} failed: {}", client, e);
                    break;
                }
            };

            let Some(allocation) = upgrade(&weak) else {
                break;
            };

            let frame = match frame_for_client(&allocation, peer, &buf[..len]).await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Failed to frame data from {} for {}: {}", peer, client, e);
                    continue;
                }
            };
            drop(allocation);

            if let Err(e) = turn_socket.send_to(&frame, client).await {
                log::warn!("Failed to relay data from {} to {}: {}", peer, client, e);
            }
        }
        log::debug!("Relay task for {} stopped", client);
    });

    allocation.set_relay_task(task.abort_handle());
}

/// Errors a UDP socket reports for a single datagram, such as ICMP
/// unreachable feedback, after which the socket is still usable
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn upgrade(weak: &Weak<Allocation>) -> Option<Arc<Allocation>> {
    weak.upgrade().filter(|allocation| !allocation.is_closed())
}

async fn frame_for_client(
    allocation: &Allocation,
    peer: SocketAddr,
    payload: &[u8],
) -> Result<Option<Vec<u8>>> {
    match allocation.route_from_peer(peer).await {
        PeerRoute::Denied => {
            log::debug!(
                "Dropped {} bytes from {} without permission on {}",
                payload.len(),
                peer,
                allocation.relay_addr()
            );
            Ok(None)
        }
        PeerRoute::Channel(number) => {
            let frame = ChannelData {
                number,
                payload: Bytes::copy_from_slice(payload),
            };
            Ok(Some(frame.encode()?.to_vec()))
        }
        PeerRoute::Indication => data_indication(peer, payload).map(Some),
    }
}

/// Builds a Data indication carrying `payload` from `peer`
pub(crate) fn data_indication(peer: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let msg = StunMessageBuilder::new(DATA, MessageClass::Indication)
        .with_attribute(XorPeerAddress::from(peer))
        .with_attribute(Data::from(payload))
        .build();
    proto::encode(&msg, payload.len() + DATA_INDICATION_OVERHEAD)
}
