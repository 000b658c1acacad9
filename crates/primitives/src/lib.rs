//! Wire-level primitives for the nymlink transport: the mixnet recipient
//! triple, the `/nym` address component and the binary message family
//! exchanged between two transports.
//!
//! Everything here is pure data: no I/O, no tasks. The codec is total and
//! deterministic: `decode(encode(m)) == m` for every well-formed message.

pub mod addr;
pub mod message;
pub mod recipient;

pub use addr::{AddrError, NymAddr, NYM_PROTOCOL_CODE, NYM_PROTOCOL_NAME};
pub use message::{
    CodecError, ConnectionId, ConnectionMessage, Message, SubstreamId, SubstreamKind,
    SubstreamMessage, TransportMessage, CONNECTION_ID_LENGTH, SUBSTREAM_ID_LENGTH,
};
pub use recipient::{Recipient, RecipientError, RECIPIENT_LENGTH};
