//! Binary framing of the local mixnet client's websocket protocol.

use bytes::BufMut;
use nymlink_primitives::{Recipient, RECIPIENT_LENGTH};

use super::MixnetError;

const REQUEST_TAG_SEND: u8 = 0x00;
const REQUEST_TAG_SELF_ADDRESS: u8 = 0x03;

const RESPONSE_TAG_ERROR: u8 = 0x00;
const RESPONSE_TAG_RECEIVED: u8 = 0x01;
const RESPONSE_TAG_SELF_ADDRESS: u8 = 0x02;

/// Length of the reply-SURB sender tag. Anonymous replies are not supported;
/// frames carrying the tag are rejected rather than mis-parsed.
const SENDER_TAG_LENGTH: usize = 32;

/// Bytes of the legacy per-request connection-id field, always zero.
const LEGACY_CONNECTION_ID_LENGTH: usize = 8;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ServerResponse {
    Received(Vec<u8>),
    SelfAddress(Recipient),
    Error { code: u8, message: String },
}

pub(crate) fn self_address_request() -> Vec<u8> {
    vec![REQUEST_TAG_SELF_ADDRESS]
}

pub(crate) fn send_request(recipient: &Recipient, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        1 + RECIPIENT_LENGTH + LEGACY_CONNECTION_ID_LENGTH + 8 + payload.len(),
    );
    out.put_u8(REQUEST_TAG_SEND);
    out.put_slice(&recipient.to_bytes());
    out.put_bytes(0, LEGACY_CONNECTION_ID_LENGTH);
    out.put_u64(payload.len() as u64);
    out.put_slice(payload);
    out
}

pub(crate) fn decode_server_response(data: &[u8]) -> Result<ServerResponse, MixnetError> {
    let Some((&tag, body)) = data.split_first() else {
        return Err(MixnetError::EmptyResponse);
    };

    match tag {
        RESPONSE_TAG_RECEIVED => decode_received(body),
        RESPONSE_TAG_SELF_ADDRESS => {
            if body.len() != RECIPIENT_LENGTH {
                return Err(MixnetError::TruncatedResponse);
            }
            Ok(ServerResponse::SelfAddress(Recipient::from_bytes(body)?))
        }
        RESPONSE_TAG_ERROR => {
            if body.len() < 1 + 8 {
                return Err(MixnetError::TruncatedResponse);
            }
            let code = body[0];
            let expected = u64::from_be_bytes(body[1..9].try_into().expect("slice of length 8"));
            let message = &body[9..];
            if expected != message.len() as u64 {
                return Err(MixnetError::LengthMismatch {
                    expected,
                    actual: message.len(),
                });
            }
            Ok(ServerResponse::Error {
                code,
                message: String::from_utf8_lossy(message).into_owned(),
            })
        }
        other => Err(MixnetError::UnknownResponseTag(other)),
    }
}

fn decode_received(body: &[u8]) -> Result<ServerResponse, MixnetError> {
    let Some((&has_sender_tag, body)) = body.split_first() else {
        return Err(MixnetError::TruncatedResponse);
    };

    match has_sender_tag {
        0 => {}
        1 => {
            if body.len() < SENDER_TAG_LENGTH + 8 {
                return Err(MixnetError::TruncatedResponse);
            }
            return Err(MixnetError::UnsupportedSenderTag);
        }
        other => return Err(MixnetError::InvalidSenderTagMarker(other)),
    }

    if body.len() < 8 {
        return Err(MixnetError::TruncatedResponse);
    }
    let expected = u64::from_be_bytes(body[..8].try_into().expect("slice of length 8"));
    let payload = &body[8..];
    if expected != payload.len() as u64 {
        return Err(MixnetError::LengthMismatch {
            expected,
            actual: payload.len(),
        });
    }

    Ok(ServerResponse::Received(payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_recipient() -> Recipient {
        Recipient::new([0x11; 32], [0x22; 32], [0x33; 32])
    }

    #[test]
    fn send_request_layout() {
        let payload = b"payload bytes";
        let frame = send_request(&test_recipient(), payload);

        assert_eq!(frame[0], REQUEST_TAG_SEND);
        assert_eq!(frame[1..97], test_recipient().to_bytes());
        // legacy connection id is zeroed
        assert_eq!(frame[97..105], [0; 8]);
        assert_eq!(frame[105..113], (payload.len() as u64).to_be_bytes());
        assert_eq!(&frame[113..], payload);
    }

    #[test]
    fn self_address_request_is_a_single_tag() {
        assert_eq!(self_address_request(), vec![REQUEST_TAG_SELF_ADDRESS]);
    }

    #[test]
    fn decodes_self_address() {
        let recipient = test_recipient();
        let mut frame = vec![RESPONSE_TAG_SELF_ADDRESS];
        frame.extend_from_slice(&recipient.to_bytes());

        assert_eq!(
            decode_server_response(&frame).unwrap(),
            ServerResponse::SelfAddress(recipient)
        );
    }

    #[test]
    fn decodes_received_without_sender_tag() {
        let payload = b"inner message";
        let mut frame = vec![RESPONSE_TAG_RECEIVED, 0];
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(payload);

        assert_eq!(
            decode_server_response(&frame).unwrap(),
            ServerResponse::Received(payload.to_vec())
        );
    }

    #[test]
    fn rejects_received_with_sender_tag() {
        let mut frame = vec![RESPONSE_TAG_RECEIVED, 1];
        frame.extend_from_slice(&[0xCC; SENDER_TAG_LENGTH]);
        frame.extend_from_slice(&0u64.to_be_bytes());

        assert!(matches!(
            decode_server_response(&frame),
            Err(MixnetError::UnsupportedSenderTag)
        ));
    }

    #[test]
    fn decodes_error_response() {
        let text = b"no route to gateway";
        let mut frame = vec![RESPONSE_TAG_ERROR, 4];
        frame.extend_from_slice(&(text.len() as u64).to_be_bytes());
        frame.extend_from_slice(text);

        assert_eq!(
            decode_server_response(&frame).unwrap(),
            ServerResponse::Error {
                code: 4,
                message: "no route to gateway".to_owned(),
            }
        );
    }

    #[test]
    fn rejects_malformed_responses() {
        // empty
        assert!(matches!(
            decode_server_response(&[]),
            Err(MixnetError::EmptyResponse)
        ));

        // unknown tag
        assert!(matches!(
            decode_server_response(&[0x09]),
            Err(MixnetError::UnknownResponseTag(0x09))
        ));

        // self address of the wrong size
        assert!(decode_server_response(&[RESPONSE_TAG_SELF_ADDRESS, 1, 2]).is_err());

        // invalid sender tag marker
        assert!(matches!(
            decode_server_response(&[RESPONSE_TAG_RECEIVED, 7]),
            Err(MixnetError::InvalidSenderTagMarker(7))
        ));

        // declared length disagrees with the payload
        let mut frame = vec![RESPONSE_TAG_RECEIVED, 0];
        frame.extend_from_slice(&9u64.to_be_bytes());
        frame.extend_from_slice(b"abc");
        assert!(matches!(
            decode_server_response(&frame),
            Err(MixnetError::LengthMismatch {
                expected: 9,
                actual: 3
            })
        ));
    }
}
