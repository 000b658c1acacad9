use core::fmt;
use core::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Byte length of a serialized [`Recipient`].
pub const RECIPIENT_LENGTH: usize = 96;

const KEY_LENGTH: usize = 32;

/// A mixnet recipient: the identity and encryption keys of a client plus the
/// identity key of the gateway it is registered with.
///
/// The canonical textual form is `<identity>.<encryption>@<gateway>` with
/// each key base58-encoded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub identity: [u8; KEY_LENGTH],
    pub encryption_key: [u8; KEY_LENGTH],
    pub gateway: [u8; KEY_LENGTH],
}

#[derive(Debug, Error)]
pub enum RecipientError {
    #[error("invalid recipient length {0}, expected {RECIPIENT_LENGTH}")]
    InvalidLength(usize),
    #[error("expected a single '@' separator")]
    MissingAt,
    #[error("expected a single '.' separator in the client half")]
    MissingDot,
    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("expected 32 decoded key bytes, got {0}")]
    InvalidKeyLength(usize),
}

impl Recipient {
    pub const fn new(
        identity: [u8; KEY_LENGTH],
        encryption_key: [u8; KEY_LENGTH],
        gateway: [u8; KEY_LENGTH],
    ) -> Self {
        Self {
            identity,
            encryption_key,
            gateway,
        }
    }

    /// Parses the raw 96-byte layout: identity, encryption key, gateway.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecipientError> {
        if bytes.len() != RECIPIENT_LENGTH {
            return Err(RecipientError::InvalidLength(bytes.len()));
        }

        let mut recipient = Self::new([0; KEY_LENGTH], [0; KEY_LENGTH], [0; KEY_LENGTH]);
        recipient.identity.copy_from_slice(&bytes[..32]);
        recipient.encryption_key.copy_from_slice(&bytes[32..64]);
        recipient.gateway.copy_from_slice(&bytes[64..]);
        Ok(recipient)
    }

    /// Returns the canonical 96-byte representation.
    pub fn to_bytes(&self) -> [u8; RECIPIENT_LENGTH] {
        let mut out = [0; RECIPIENT_LENGTH];
        out[..32].copy_from_slice(&self.identity);
        out[32..64].copy_from_slice(&self.encryption_key);
        out[64..].copy_from_slice(&self.gateway);
        out
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}@{}",
            bs58::encode(self.identity).into_string(),
            bs58::encode(self.encryption_key).into_string(),
            bs58::encode(self.gateway).into_string(),
        )
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recipient({self})")
    }
}

impl FromStr for Recipient {
    type Err = RecipientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut halves = s.split('@');
        let (client, gateway) = match (halves.next(), halves.next(), halves.next()) {
            (Some(client), Some(gateway), None) => (client, gateway),
            _ => return Err(RecipientError::MissingAt),
        };

        let mut keys = client.split('.');
        let (identity, encryption) = match (keys.next(), keys.next(), keys.next()) {
            (Some(identity), Some(encryption), None) => (identity, encryption),
            _ => return Err(RecipientError::MissingDot),
        };

        Ok(Self::new(
            decode_base58_key(identity)?,
            decode_base58_key(encryption)?,
            decode_base58_key(gateway)?,
        ))
    }
}

fn decode_base58_key(s: &str) -> Result<[u8; KEY_LENGTH], RecipientError> {
    let decoded = bs58::decode(s).into_vec()?;
    if decoded.len() != KEY_LENGTH {
        return Err(RecipientError::InvalidKeyLength(decoded.len()));
    }
    let mut key = [0; KEY_LENGTH];
    key.copy_from_slice(&decoded);
    Ok(key)
}

impl Serialize for Recipient {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RecipientVisitor;

        impl Visitor<'_> for RecipientVisitor {
            type Value = Recipient;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base58 recipient of the form ident.enc@gateway")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(RecipientVisitor)
    }
}
