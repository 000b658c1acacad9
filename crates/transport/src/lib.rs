//! A stream-multiplexed, peer-authenticated transport over the Nym mixnet.
//!
//! The mixnet delivers opaque payloads between long-lived recipient
//! addresses: best-effort, unordered, with the recipient address as the only
//! routing identifier. On top of that this crate presents reliable-order,
//! bidirectional, multiplexed connections between named peers:
//!
//! - a [`NymTransport`] owns the gateway session and dispatches every
//!   inbound message to a handshake slot or a live connection,
//! - a [`Connection`] restores frame order with a per-connection nonce
//!   [`queue`](queue::MessageQueue) and multiplexes [`Substream`]s,
//! - a [`Substream`] is a plain `AsyncRead + AsyncWrite` byte stream.
//!
//! Ordering holds within a substream; nothing is asserted across substreams
//! or connections, and delivery is never confirmed; the substrate does not
//! retransmit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use libp2p_identity::{Keypair, PeerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod mixnet;
pub mod queue;
pub mod substream;

pub use config::{MixnetConfig, TransportConfig};
pub use connection::Connection;
pub use error::TransportError;
pub use listener::Listener;
pub use nymlink_primitives::{
    ConnectionId, ConnectionMessage, Message, NymAddr, Recipient, SubstreamId, SubstreamKind,
    SubstreamMessage, TransportMessage, NYM_PROTOCOL_CODE, NYM_PROTOCOL_NAME,
};
pub use substream::Substream;

use mixnet::{InboundMessage, OutboundMessage};

/// The transport: owns the gateway session, all live connections and all
/// pending dials. Cheap to clone.
#[derive(Clone)]
pub struct NymTransport {
    inner: Arc<TransportInner>,
}

pub(crate) struct TransportInner {
    pub(crate) local_peer: PeerId,
    pub(crate) self_recipient: Recipient,
    pub(crate) listen_addr: NymAddr,
    pub(crate) config: TransportConfig,
    pub(crate) outbound: mpsc::Sender<OutboundMessage>,
    pub(crate) shutdown: CancellationToken,

    closed: AtomicBool,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    listeners: RwLock<HashMap<u64, mpsc::Sender<Connection>>>,
    pending_dials: Mutex<HashMap<ConnectionId, PendingDial>>,
    next_listener_id: AtomicU64,
}

struct PendingDial {
    remote: Recipient,
    result: oneshot::Sender<Connection>,
}

/// Removes a registered pending dial when the dial is abandoned (timed out,
/// cancelled, or failed to send). Disarmed once the slot has been consumed.
struct PendingDialGuard<'a> {
    inner: &'a TransportInner,
    id: ConnectionId,
    armed: bool,
}

impl Drop for PendingDialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.remove_pending_dial(&self.id);
        }
    }
}

impl NymTransport {
    /// Opens a gateway session against the mixnet client at `gateway_url`
    /// and starts the transport. The local peer identity is derived from
    /// `keypair`; the listen address is `/nym/<own recipient>`.
    pub async fn new(
        gateway_url: &str,
        keypair: &Keypair,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let session = mixnet::connect(gateway_url, &config.mixnet).await?;
        Ok(Self::with_mixnet(
            keypair,
            session.local_recipient,
            session.inbound,
            session.outbound,
            config,
        ))
    }

    /// Starts the transport over externally supplied mixnet channels.
    /// Useful for custom gateway sessions and for tests, which wire two
    /// transports together in memory.
    pub fn with_mixnet(
        keypair: &Keypair,
        self_recipient: Recipient,
        inbound: mpsc::Receiver<InboundMessage>,
        outbound: mpsc::Sender<OutboundMessage>,
        config: TransportConfig,
    ) -> Self {
        let inner = Arc::new(TransportInner {
            local_peer: keypair.public().to_peer_id(),
            self_recipient,
            listen_addr: NymAddr::new(self_recipient),
            config,
            outbound,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            connections: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            pending_dials: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
        });

        drop(tokio::spawn(run_dispatcher(Arc::clone(&inner), inbound)));

        Self { inner }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local_peer
    }

    /// The only address this transport can listen on.
    pub fn listen_addr(&self) -> &NymAddr {
        &self.inner.listen_addr
    }

    /// Whether `addr` is an address this transport can dial.
    pub fn can_dial(&self, addr: &str) -> bool {
        addr.parse::<NymAddr>().is_ok()
    }

    /// Multiaddr protocol codes handled by this transport.
    pub fn protocols(&self) -> &'static [u32] {
        &[NYM_PROTOCOL_CODE]
    }

    /// Dials the peer listening on `addr` and waits for the handshake to
    /// complete. When `expected_peer` is given, a connection answered by a
    /// different peer identity is closed and the dial fails with
    /// [`TransportError::PeerMismatch`].
    ///
    /// Dropping the returned future abandons the dial; a late
    /// ConnectionResponse is then silently discarded.
    pub async fn dial(
        &self,
        addr: &NymAddr,
        expected_peer: Option<PeerId>,
    ) -> Result<Connection, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let recipient = *addr.recipient();
        let id = ConnectionId::random();
        let (result_tx, result_rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending_dials.lock();
            if pending.contains_key(&id) {
                return Err(TransportError::ConnectionIdCollision);
            }
            let _slot = pending.insert(
                id,
                PendingDial {
                    remote: recipient,
                    result: result_tx,
                },
            );
        }
        let mut guard = PendingDialGuard {
            inner: &*self.inner,
            id,
            armed: true,
        };

        let request = Message::ConnectionRequest(ConnectionMessage {
            id,
            recipient: Some(self.inner.self_recipient),
            peer: self.inner.local_peer,
        });
        self.inner.send_message(recipient, request).await?;

        let timeout = self.inner.config.handshake_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, result_rx) => match result {
                Ok(Ok(connection)) => {
                    // the dispatcher consumed the slot
                    guard.armed = false;

                    if let Some(expected) = expected_peer {
                        if connection.remote_peer_id() != &expected {
                            let actual = *connection.remote_peer_id();
                            connection.close();
                            return Err(TransportError::PeerMismatch { expected, actual });
                        }
                    }
                    Ok(connection)
                }
                // the slot was dropped: the transport shut down underneath us
                Ok(Err(_)) => {
                    guard.armed = false;
                    Err(TransportError::Closed)
                }
                Err(_) => Err(TransportError::HandshakeTimeout),
            },
            () = self.inner.shutdown.cancelled() => Err(TransportError::Closed),
        }
    }

    /// Registers a listener for inbound connections. Only the transport's
    /// own listen address is accepted.
    pub fn listen(&self, addr: &NymAddr) -> Result<Listener, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if addr != &self.inner.listen_addr {
            return Err(TransportError::ListenAddrMismatch {
                requested: *addr,
                local: self.inner.listen_addr,
            });
        }

        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.config.listener_backlog);
        let _previous = self.inner.listeners.write().insert(id, tx);

        Ok(Listener::new(
            id,
            self.inner.listen_addr,
            rx,
            Arc::downgrade(&self.inner),
            self.inner.shutdown.child_token(),
        ))
    }

    /// Shuts the transport down: stops the dispatcher, wakes pending
    /// acceptors and dials, and closes every live connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl TransportInner {
    pub(crate) async fn send_message(
        &self,
        recipient: Recipient,
        message: Message,
    ) -> Result<(), TransportError> {
        tokio::select! {
            result = self.outbound.send(OutboundMessage { recipient, message }) => {
                result.map_err(|_| TransportError::Closed)
            }
            () = self.shutdown.cancelled() => Err(TransportError::Closed),
        }
    }

    pub(crate) fn remove_connection(&self, id: &ConnectionId) {
        let connection = self.connections.write().remove(id);
        drop(connection);
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        let listener = self.listeners.write().remove(&id);
        drop(listener);
    }

    fn remove_pending_dial(&self, id: &ConnectionId) {
        // dropping the slot wakes the dialer with an error
        let pending = self.pending_dials.lock().remove(id);
        drop(pending);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // stop producing work first, then close the sinks
        self.shutdown.cancel();

        self.listeners.write().clear();

        let pending: Vec<PendingDial> = self
            .pending_dials
            .lock()
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        drop(pending);

        let connections: Vec<Connection> = self
            .connections
            .write()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in &connections {
            connection.close();
        }
    }
}

impl std::fmt::Debug for NymTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NymTransport")
            .field("local_peer", &self.inner.local_peer)
            .field("listen_addr", &self.inner.listen_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn run_dispatcher(inner: Arc<TransportInner>, mut inbound: mpsc::Receiver<InboundMessage>) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(InboundMessage { message }) => handle_message(&inner, message).await,
                None => {
                    // the gateway session died underneath us
                    debug!("mixnet inbound channel closed, shutting transport down");
                    inner.close();
                    break;
                }
            },
        }
    }
}

async fn handle_message(inner: &Arc<TransportInner>, message: Message) {
    match message {
        Message::ConnectionRequest(cm) => handle_connection_request(inner, cm).await,
        Message::ConnectionResponse(cm) => handle_connection_response(inner, cm).await,
        Message::Transport(tm) => handle_transport_message(inner, tm).await,
    }
}

async fn handle_connection_request(inner: &Arc<TransportInner>, cm: ConnectionMessage) {
    let Some(recipient) = cm.recipient else {
        warn!(connection = %cm.id, "connection request without reply recipient");
        return;
    };

    let connection = {
        let mut connections = inner.connections.write();
        if connections.contains_key(&cm.id) {
            debug!(connection = %cm.id, "discarding duplicate connection request");
            return;
        }
        let connection = Connection::new(inner, cm.id, cm.peer, recipient);
        let _previous = connections.insert(cm.id, connection.clone());
        connection
    };

    let response = Message::ConnectionResponse(ConnectionMessage {
        id: cm.id,
        recipient: None,
        peer: inner.local_peer,
    });
    if let Err(err) = inner.send_message(recipient, response).await {
        warn!(%err, connection = %cm.id, "failed to answer connection request");
        connection.close();
        return;
    }

    info!(connection = %cm.id, peer = %cm.peer, "accepted inbound connection");
    notify_listeners(inner, connection);
}

async fn handle_connection_response(inner: &Arc<TransportInner>, cm: ConnectionMessage) {
    let Some(pending) = inner.pending_dials.lock().remove(&cm.id) else {
        debug!(connection = %cm.id, "discarding connection response without pending dial");
        return;
    };

    let connection = {
        let mut connections = inner.connections.write();
        let connection = Connection::new(inner, cm.id, cm.peer, pending.remote);
        let _previous = connections.insert(cm.id, connection.clone());
        connection
    };

    info!(connection = %cm.id, peer = %cm.peer, "connection established");
    if let Err(connection) = pending.result.send(connection) {
        // the dialer gave up in the meantime
        connection.close();
    }
}

async fn handle_transport_message(inner: &Arc<TransportInner>, tm: TransportMessage) {
    let connection = inner.connections.read().get(&tm.id).cloned();
    match connection {
        Some(connection) => connection.handle_transport_message(tm).await,
        None => debug!(connection = %tm.id, "discarding transport frame for unknown connection"),
    }
}

/// Hands an established inbound connection to every registered listener
/// without stalling the dispatcher.
fn notify_listeners(inner: &TransportInner, connection: Connection) {
    let listeners = inner.listeners.read();
    for incoming in listeners.values() {
        match incoming.try_send(connection.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(connection)) => {
                let incoming = incoming.clone();
                let token = inner.shutdown.clone();
                drop(tokio::spawn(async move {
                    tokio::select! {
                        _sent = incoming.send(connection) => {}
                        () = token.cancelled() => {}
                    }
                }));
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
