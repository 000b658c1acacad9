use std::collections::BTreeMap;

use nymlink_primitives::TransportMessage;

/// Reorders transport frames by nonce for one connection.
///
/// Starts unarmed: everything is buffered until the handshake completes and
/// [`arm`](Self::arm) declares nonce 1 the next expected frame. From then on
/// frames are released strictly in nonce order with duplicates and stale
/// nonces dropped.
#[derive(Debug, Default)]
pub struct MessageQueue {
    /// 0 while the handshake is outstanding, otherwise the next nonce to
    /// release.
    next_expected: u64,
    pending: BTreeMap<u64, TransportMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the handshake complete. Panics when armed twice.
    pub fn arm(&mut self) {
        assert_eq!(self.next_expected, 0, "reorder queue armed twice");
        self.next_expected = 1;
    }

    /// Drops all buffered frames and returns to the unarmed state.
    pub fn reset(&mut self) {
        self.next_expected = 0;
        self.pending.clear();
    }

    /// Inserts a frame, returning it when it is the next expected one and can
    /// be processed immediately. Frames from the future are buffered
    /// (duplicates coalesce), stale frames are dropped.
    pub fn try_push(&mut self, message: TransportMessage) -> Option<TransportMessage> {
        if self.next_expected == 0 {
            self.insert(message);
            return None;
        }

        if message.nonce == self.next_expected {
            self.next_expected += 1;
            return Some(message);
        }

        if message.nonce > self.next_expected {
            self.insert(message);
        }
        None
    }

    /// Releases the next buffered in-order frame, if present.
    pub fn pop(&mut self) -> Option<TransportMessage> {
        if self.next_expected == 0 {
            return None;
        }

        let (&smallest, _) = self.pending.first_key_value()?;
        if smallest != self.next_expected {
            return None;
        }

        let message = self.pending.remove(&smallest);
        self.next_expected += 1;
        message
    }

    /// Sorted snapshot of the buffered nonces.
    pub fn pending_nonces(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    fn insert(&mut self, message: TransportMessage) {
        let _existing = self.pending.entry(message.nonce).or_insert(message);
    }
}
