use core::fmt;

use bytes::{Buf, BufMut};
use libp2p_identity::PeerId;
use rand::RngCore;
use thiserror::Error;

use crate::recipient::{Recipient, RecipientError, RECIPIENT_LENGTH};

pub const CONNECTION_ID_LENGTH: usize = 32;
pub const SUBSTREAM_ID_LENGTH: usize = 32;

const MESSAGE_TYPE_CONNECTION_REQUEST: u8 = 0;
const MESSAGE_TYPE_CONNECTION_RESPONSE: u8 = 1;
const MESSAGE_TYPE_TRANSPORT: u8 = 2;

const SUBSTREAM_TYPE_OPEN_REQUEST: u8 = 0;
const SUBSTREAM_TYPE_OPEN_RESPONSE: u8 = 1;
const SUBSTREAM_TYPE_CLOSE: u8 = 2;
const SUBSTREAM_TYPE_DATA: u8 = 3;

/// Identifies a logical connection. Minted at random by the dialer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; CONNECTION_ID_LENGTH]);

/// Identifies a substream within a connection. Minted at random by the opener.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubstreamId([u8; SUBSTREAM_ID_LENGTH]);

macro_rules! impl_id {
    ($name:ident, $len:expr) => {
        impl $name {
            pub fn random() -> Self {
                let mut id = [0; $len];
                rand::thread_rng().fill_bytes(&mut id);
                Self(id)
            }

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

impl_id!(ConnectionId, CONNECTION_ID_LENGTH);
impl_id!(SubstreamId, SUBSTREAM_ID_LENGTH);

/// Top-level message exchanged between two transports over the mixnet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ConnectionRequest(ConnectionMessage),
    ConnectionResponse(ConnectionMessage),
    Transport(TransportMessage),
}

/// Handshake payload. A request carries the dialer's own recipient so the
/// listener knows where to reply; a response carries none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionMessage {
    pub id: ConnectionId,
    pub recipient: Option<Recipient>,
    pub peer: PeerId,
}

/// Substream payload with the per-connection ordering nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportMessage {
    pub id: ConnectionId,
    pub nonce: u64,
    pub message: SubstreamMessage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubstreamMessage {
    pub id: SubstreamId,
    pub kind: SubstreamKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubstreamKind {
    OpenRequest,
    OpenResponse,
    Close,
    Data(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("connection payload too short")]
    ShortConnectionMessage,
    #[error("connection recipient truncated")]
    TruncatedRecipient,
    #[error("invalid recipient flag {0}")]
    InvalidRecipientFlag(u8),
    #[error("missing peer identity bytes")]
    MissingPeerId,
    #[error("malformed peer identity: {0}")]
    PeerId(#[from] libp2p_identity::ParseError),
    #[error("transport payload too short")]
    ShortTransportMessage,
    #[error("substream payload too short")]
    ShortSubstreamMessage,
    #[error("unknown substream message type {0}")]
    UnknownSubstreamType(u8),
    #[error("unexpected payload on substream control message")]
    ControlPayload,
    #[error(transparent)]
    Recipient(#[from] RecipientError),
}

impl SubstreamMessage {
    pub const fn open_request(id: SubstreamId) -> Self {
        Self {
            id,
            kind: SubstreamKind::OpenRequest,
        }
    }

    pub const fn open_response(id: SubstreamId) -> Self {
        Self {
            id,
            kind: SubstreamKind::OpenResponse,
        }
    }

    pub const fn close(id: SubstreamId) -> Self {
        Self {
            id,
            kind: SubstreamKind::Close,
        }
    }

    pub const fn data(id: SubstreamId, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: SubstreamKind::Data(payload),
        }
    }
}

impl Message {
    /// Serializes the message to its on-wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ConnectionRequest(cm) => encode_connection_message(MESSAGE_TYPE_CONNECTION_REQUEST, cm),
            Self::ConnectionResponse(cm) => {
                encode_connection_message(MESSAGE_TYPE_CONNECTION_RESPONSE, cm)
            }
            Self::Transport(tm) => encode_transport_message(tm),
        }
    }

    /// Parses an on-wire message.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let Some((&tag, payload)) = data.split_first() else {
            return Err(CodecError::Empty);
        };

        match tag {
            MESSAGE_TYPE_CONNECTION_REQUEST => {
                Ok(Self::ConnectionRequest(decode_connection_message(payload)?))
            }
            MESSAGE_TYPE_CONNECTION_RESPONSE => {
                Ok(Self::ConnectionResponse(decode_connection_message(payload)?))
            }
            MESSAGE_TYPE_TRANSPORT => Ok(Self::Transport(decode_transport_message(payload)?)),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

fn encode_connection_message(tag: u8, cm: &ConnectionMessage) -> Vec<u8> {
    let peer = cm.peer.to_bytes();
    let recipient_len = cm.recipient.map_or(0, |_| RECIPIENT_LENGTH);

    let mut out = Vec::with_capacity(1 + CONNECTION_ID_LENGTH + 1 + recipient_len + peer.len());
    out.put_u8(tag);
    out.put_slice(cm.id.as_bytes());
    match &cm.recipient {
        Some(recipient) => {
            out.put_u8(1);
            out.put_slice(&recipient.to_bytes());
        }
        None => out.put_u8(0),
    }
    out.put_slice(&peer);
    out
}

fn decode_connection_message(mut data: &[u8]) -> Result<ConnectionMessage, CodecError> {
    if data.remaining() < CONNECTION_ID_LENGTH + 1 {
        return Err(CodecError::ShortConnectionMessage);
    }

    let mut id = [0; CONNECTION_ID_LENGTH];
    data.copy_to_slice(&mut id);
    let flag = data.get_u8();

    let recipient = match flag {
        0 => None,
        1 => {
            if data.remaining() < RECIPIENT_LENGTH {
                return Err(CodecError::TruncatedRecipient);
            }
            let mut raw = [0; RECIPIENT_LENGTH];
            data.copy_to_slice(&mut raw);
            Some(Recipient::from_bytes(&raw)?)
        }
        other => return Err(CodecError::InvalidRecipientFlag(other)),
    };

    if data.is_empty() {
        return Err(CodecError::MissingPeerId);
    }

    Ok(ConnectionMessage {
        id: ConnectionId::from_bytes(id),
        recipient,
        peer: PeerId::from_bytes(data)?,
    })
}

fn encode_transport_message(tm: &TransportMessage) -> Vec<u8> {
    let payload = match &tm.message.kind {
        SubstreamKind::Data(data) => data.as_slice(),
        _ => &[],
    };

    let mut out =
        Vec::with_capacity(1 + 8 + CONNECTION_ID_LENGTH + SUBSTREAM_ID_LENGTH + 1 + payload.len());
    out.put_u8(MESSAGE_TYPE_TRANSPORT);
    out.put_u64(tm.nonce);
    out.put_slice(tm.id.as_bytes());
    out.put_slice(tm.message.id.as_bytes());
    out.put_u8(substream_tag(&tm.message.kind));
    out.put_slice(payload);
    out
}

fn decode_transport_message(mut data: &[u8]) -> Result<TransportMessage, CodecError> {
    if data.remaining() < 8 + CONNECTION_ID_LENGTH + SUBSTREAM_ID_LENGTH + 1 {
        return Err(CodecError::ShortTransportMessage);
    }

    let nonce = data.get_u64();
    let mut id = [0; CONNECTION_ID_LENGTH];
    data.copy_to_slice(&mut id);

    Ok(TransportMessage {
        id: ConnectionId::from_bytes(id),
        nonce,
        message: decode_substream_message(data)?,
    })
}

fn decode_substream_message(mut data: &[u8]) -> Result<SubstreamMessage, CodecError> {
    if data.remaining() < SUBSTREAM_ID_LENGTH + 1 {
        return Err(CodecError::ShortSubstreamMessage);
    }

    let mut id = [0; SUBSTREAM_ID_LENGTH];
    data.copy_to_slice(&mut id);
    let tag = data.get_u8();

    let kind = match tag {
        SUBSTREAM_TYPE_DATA => SubstreamKind::Data(data.to_vec()),
        SUBSTREAM_TYPE_OPEN_REQUEST | SUBSTREAM_TYPE_OPEN_RESPONSE | SUBSTREAM_TYPE_CLOSE => {
            if !data.is_empty() {
                return Err(CodecError::ControlPayload);
            }
            match tag {
                SUBSTREAM_TYPE_OPEN_REQUEST => SubstreamKind::OpenRequest,
                SUBSTREAM_TYPE_OPEN_RESPONSE => SubstreamKind::OpenResponse,
                _ => SubstreamKind::Close,
            }
        }
        other => return Err(CodecError::UnknownSubstreamType(other)),
    };

    Ok(SubstreamMessage {
        id: SubstreamId::from_bytes(id),
        kind,
    })
}

const fn substream_tag(kind: &SubstreamKind) -> u8 {
    match kind {
        SubstreamKind::OpenRequest => SUBSTREAM_TYPE_OPEN_REQUEST,
        SubstreamKind::OpenResponse => SUBSTREAM_TYPE_OPEN_RESPONSE,
        SubstreamKind::Close => SUBSTREAM_TYPE_CLOSE,
        SubstreamKind::Data(_) => SUBSTREAM_TYPE_DATA,
    }
}

#[cfg(test)]
mod tests {
    use libp2p_identity::Keypair;

    use super::*;

    fn test_peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    fn test_recipient() -> Recipient {
        Recipient::new([0x11; 32], [0x22; 32], [0x33; 32])
    }

    #[test]
    fn connection_request_round_trip() {
        let message = Message::ConnectionRequest(ConnectionMessage {
            id: ConnectionId::random(),
            recipient: Some(test_recipient()),
            peer: test_peer(),
        });

        let encoded = message.encode();
        assert_eq!(encoded[0], MESSAGE_TYPE_CONNECTION_REQUEST);
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn connection_response_round_trip() {
        let message = Message::ConnectionResponse(ConnectionMessage {
            id: ConnectionId::random(),
            recipient: None,
            peer: test_peer(),
        });

        let encoded = message.encode();
        assert_eq!(encoded[0], MESSAGE_TYPE_CONNECTION_RESPONSE);
        // id (32) + flag (1) + peer identity, no recipient bytes
        assert!(encoded.len() > 1 + CONNECTION_ID_LENGTH + 1);
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn transport_round_trip() {
        let messages = [
            SubstreamMessage::open_request(SubstreamId::random()),
            SubstreamMessage::open_response(SubstreamId::random()),
            SubstreamMessage::close(SubstreamId::random()),
            SubstreamMessage::data(SubstreamId::random(), b"hello over nym".to_vec()),
            SubstreamMessage::data(SubstreamId::random(), Vec::new()),
        ];

        for (nonce, substream) in messages.into_iter().enumerate() {
            let message = Message::Transport(TransportMessage {
                id: ConnectionId::random(),
                nonce: nonce as u64 + 1,
                message: substream,
            });
            let encoded = message.encode();
            assert_eq!(Message::decode(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn decode_rejects_malformed() {
        // empty input
        assert!(matches!(Message::decode(&[]), Err(CodecError::Empty)));

        // unknown top-level tag
        assert!(matches!(
            Message::decode(&[9]),
            Err(CodecError::UnknownMessageType(9))
        ));

        // truncated connection payload
        assert!(Message::decode(&[MESSAGE_TYPE_CONNECTION_REQUEST, 1, 2, 3]).is_err());

        // invalid recipient flag
        let mut frame = vec![MESSAGE_TYPE_CONNECTION_REQUEST];
        frame.extend_from_slice(&[0; CONNECTION_ID_LENGTH]);
        frame.push(7);
        frame.extend_from_slice(&test_peer().to_bytes());
        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::InvalidRecipientFlag(7))
        ));

        // recipient flag set but recipient bytes truncated
        let mut frame = vec![MESSAGE_TYPE_CONNECTION_REQUEST];
        frame.extend_from_slice(&[0; CONNECTION_ID_LENGTH]);
        frame.push(1);
        frame.extend_from_slice(&[0xAA; 40]);
        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::TruncatedRecipient)
        ));

        // missing peer identity
        let mut frame = vec![MESSAGE_TYPE_CONNECTION_RESPONSE];
        frame.extend_from_slice(&[0; CONNECTION_ID_LENGTH]);
        frame.push(0);
        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::MissingPeerId)
        ));

        // garbage peer identity
        let mut frame = vec![MESSAGE_TYPE_CONNECTION_RESPONSE];
        frame.extend_from_slice(&[0; CONNECTION_ID_LENGTH]);
        frame.push(0);
        frame.extend_from_slice(&[0xFF; 4]);
        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::PeerId(_))
        ));

        // truncated transport payload
        assert!(matches!(
            Message::decode(&[MESSAGE_TYPE_TRANSPORT, 0, 0, 0]),
            Err(CodecError::ShortTransportMessage)
        ));

        // unknown substream tag
        let message = Message::Transport(TransportMessage {
            id: ConnectionId::random(),
            nonce: 1,
            message: SubstreamMessage::close(SubstreamId::random()),
        });
        let mut encoded = message.encode();
        let tag_offset = 1 + 8 + CONNECTION_ID_LENGTH + SUBSTREAM_ID_LENGTH;
        encoded[tag_offset] = 42;
        assert!(matches!(
            Message::decode(&encoded),
            Err(CodecError::UnknownSubstreamType(42))
        ));

        // payload on a control message
        let mut encoded = message.encode();
        encoded.push(0xAB);
        assert!(matches!(
            Message::decode(&encoded),
            Err(CodecError::ControlPayload)
        ));
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(ConnectionId::random(), ConnectionId::random());
        assert_ne!(SubstreamId::random(), SubstreamId::random());
    }
}
