use std::sync::Weak;

use nymlink_primitives::NymAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::TransportInner;

/// Surfaces inbound connections, one at a time.
///
/// Registered with the transport on creation; closing (or dropping) the
/// listener de-registers it and wakes a pending [`accept`](Self::accept)
/// with [`TransportError::ListenerClosed`].
pub struct Listener {
    id: u64,
    local_addr: NymAddr,
    incoming: mpsc::Receiver<Connection>,
    transport: Weak<TransportInner>,
    shutdown: CancellationToken,
}

impl Listener {
    pub(crate) fn new(
        id: u64,
        local_addr: NymAddr,
        incoming: mpsc::Receiver<Connection>,
        transport: Weak<TransportInner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            local_addr,
            incoming,
            transport,
            shutdown,
        }
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&mut self) -> Result<Connection, TransportError> {
        tokio::select! {
            connection = self.incoming.recv() => {
                connection.ok_or(TransportError::ListenerClosed)
            }
            () = self.shutdown.cancelled() => Err(TransportError::ListenerClosed),
        }
    }

    pub fn local_addr(&self) -> &NymAddr {
        &self.local_addr
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_listener(self.id);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
