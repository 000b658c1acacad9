use core::fmt;
use core::str::FromStr;

use thiserror::Error;
use unsigned_varint::{decode, encode};

use crate::recipient::{Recipient, RecipientError};

/// Multiaddr protocol name for the mixnet transport.
pub const NYM_PROTOCOL_NAME: &str = "nym";

/// Multiaddr protocol code for the mixnet transport. Length-prefixed
/// component body on the wire.
pub const NYM_PROTOCOL_CODE: u32 = 999;

/// A `/nym/<recipient>` address.
///
/// The wire representation follows the multiaddr component layout: the
/// varint protocol code, a varint length prefix and the textual recipient.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NymAddr {
    recipient: Recipient,
}

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("address must be of the form /{NYM_PROTOCOL_NAME}/<recipient>")]
    UnsupportedProtocol,
    #[error("unexpected protocol code {0}")]
    UnexpectedCode(u64),
    #[error("truncated address payload")]
    Truncated,
    #[error("malformed varint: {0}")]
    Varint(#[from] decode::Error),
    #[error("address component is not valid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Recipient(#[from] RecipientError),
}

impl NymAddr {
    pub const fn new(recipient: Recipient) -> Self {
        Self { recipient }
    }

    pub const fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    /// Encodes the address as a single length-prefixed multiaddr component.
    pub fn to_bytes(&self) -> Vec<u8> {
        let text = self.recipient.to_string();

        let mut code_buf = encode::u32_buffer();
        let code = encode::u32(NYM_PROTOCOL_CODE, &mut code_buf);
        let mut len_buf = encode::u64_buffer();
        let len = encode::u64(text.len() as u64, &mut len_buf);

        let mut out = Vec::with_capacity(code.len() + len.len() + text.len());
        out.extend_from_slice(code);
        out.extend_from_slice(len);
        out.extend_from_slice(text.as_bytes());
        out
    }

    /// Decodes the leading `nym` component of a binary multiaddr. Trailing
    /// components are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, AddrError> {
        let (code, rest) = decode::u64(data)?;
        if code != u64::from(NYM_PROTOCOL_CODE) {
            return Err(AddrError::UnexpectedCode(code));
        }

        let (len, rest) = decode::u64(rest)?;
        let len = usize::try_from(len).map_err(|_| AddrError::Truncated)?;
        if rest.len() < len {
            return Err(AddrError::Truncated);
        }

        let text = core::str::from_utf8(&rest[..len]).map_err(|_| AddrError::InvalidUtf8)?;
        Ok(Self::new(text.parse()?))
    }
}

impl From<Recipient> for NymAddr {
    fn from(recipient: Recipient) -> Self {
        Self::new(recipient)
    }
}

impl fmt::Display for NymAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{NYM_PROTOCOL_NAME}/{}", self.recipient)
    }
}

impl fmt::Debug for NymAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for NymAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('/')
            .and_then(|s| s.strip_prefix(NYM_PROTOCOL_NAME))
            .and_then(|s| s.strip_prefix('/'))
            .ok_or(AddrError::UnsupportedProtocol)?;

        Ok(Self::new(body.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> NymAddr {
        NymAddr::new(Recipient::new([0x11; 32], [0x22; 32], [0x33; 32]))
    }

    #[test]
    fn text_round_trip() {
        let addr = test_addr();
        let text = addr.to_string();
        assert!(text.starts_with("/nym/"));
        assert_eq!(text.parse::<NymAddr>().unwrap(), addr);
    }

    #[test]
    fn parse_rejects_other_protocols() {
        assert!("/ip4/127.0.0.1/tcp/4001".parse::<NymAddr>().is_err());
        assert!("nym/abc".parse::<NymAddr>().is_err());
        assert!("/nym".parse::<NymAddr>().is_err());
        assert!("/nym/not-base58!".parse::<NymAddr>().is_err());
    }

    #[test]
    fn binary_round_trip() {
        let addr = test_addr();
        let bytes = addr.to_bytes();

        // 999 needs two varint bytes, the recipient text one length byte
        assert_eq!(bytes[..2], [0xE7, 0x07]);
        assert_eq!(NymAddr::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn from_bytes_ignores_trailing_components() {
        let addr = test_addr();
        let mut bytes = addr.to_bytes();
        bytes.extend_from_slice(&[0x06, 0x01, 0x02]);
        assert_eq!(NymAddr::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn from_bytes_rejects_malformed() {
        assert!(NymAddr::from_bytes(&[]).is_err());

        // wrong protocol code (tcp = 6)
        assert!(matches!(
            NymAddr::from_bytes(&[0x06, 0x00]),
            Err(AddrError::UnexpectedCode(6))
        ));

        // length prefix longer than the payload
        let addr = test_addr();
        let mut bytes = addr.to_bytes();
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            NymAddr::from_bytes(&bytes),
            Err(AddrError::Truncated)
        ));
    }
}
