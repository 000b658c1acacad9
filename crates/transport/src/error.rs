use libp2p_identity::PeerId;
use nymlink_primitives::{AddrError, NymAddr};
use thiserror::Error;

use crate::mixnet::MixnetError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed address: {0}")]
    MalformedAddress(#[from] AddrError),

    #[error("connection id collision")]
    ConnectionIdCollision,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("remote peer mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    #[error("can only listen on {local}, not {requested}")]
    ListenAddrMismatch { requested: NymAddr, local: NymAddr },

    #[error("listener closed")]
    ListenerClosed,

    #[error("connection reset")]
    ConnectionReset,

    #[error("substream closed")]
    StreamClosed,

    #[error("transport closed")]
    Closed,

    #[error("mixnet session: {0}")]
    Mixnet(#[from] MixnetError),
}
