use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use libp2p_identity::PeerId;
use nymlink_primitives::{
    ConnectionId, Message, NymAddr, Recipient, SubstreamId, SubstreamKind, SubstreamMessage,
    TransportMessage,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::mixnet::OutboundMessage;
use crate::queue::MessageQueue;
use crate::substream::{Substream, SubstreamShared};
use crate::TransportInner;

/// A peer-to-peer connection over the mixnet, multiplexing substreams on top
/// of the per-connection reordering queue.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    local_peer: PeerId,
    remote_peer: PeerId,
    local_addr: NymAddr,
    remote_addr: NymAddr,

    transport: Weak<TransportInner>,
    outbound: mpsc::Sender<OutboundMessage>,

    queue: Mutex<MessageQueue>,
    nonce: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,

    streams: Mutex<HashMap<SubstreamId, StreamEntry>>,
    pending_streams: Mutex<HashMap<SubstreamId, PendingStream>>,

    incoming_tx: Mutex<Option<mpsc::Sender<Substream>>>,
    incoming_rx: AsyncMutex<mpsc::Receiver<Substream>>,

    substream_buffer: usize,
}

/// Dispatcher-side handle to an indexed substream.
struct StreamEntry {
    data_tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<SubstreamShared>,
}

struct PendingStream {
    entry: StreamEntry,
    ready: oneshot::Sender<()>,
}

impl Connection {
    /// Builds a connection whose handshake has completed: the reorder queue
    /// is armed and expects nonce 1 next.
    pub(crate) fn new(
        transport: &Arc<TransportInner>,
        id: ConnectionId,
        remote_peer: PeerId,
        remote_recipient: Recipient,
    ) -> Self {
        let mut queue = MessageQueue::new();
        queue.arm();

        let (incoming_tx, incoming_rx) = mpsc::channel(transport.config.inbound_substreams);

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                local_peer: transport.local_peer,
                remote_peer,
                local_addr: transport.listen_addr,
                remote_addr: NymAddr::new(remote_recipient),
                transport: Arc::downgrade(transport),
                outbound: transport.outbound.clone(),
                queue: Mutex::new(queue),
                nonce: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown: transport.shutdown.child_token(),
                streams: Mutex::new(HashMap::new()),
                pending_streams: Mutex::new(HashMap::new()),
                incoming_tx: Mutex::new(Some(incoming_tx)),
                incoming_rx: AsyncMutex::new(incoming_rx),
                substream_buffer: transport.config.substream_buffer,
            }),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn remote_peer_id(&self) -> &PeerId {
        &self.inner.remote_peer
    }

    pub fn local_addr(&self) -> &NymAddr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &NymAddr {
        &self.inner.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Opens a substream towards the remote peer, resolving once the remote
    /// acknowledged it. Dropping the returned future abandons the open; a
    /// late acknowledgement is then discarded.
    pub async fn open_stream(&self) -> Result<Substream, TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::ConnectionReset);
        }

        let id = SubstreamId::random();
        let (substream, entry) = self.inner.new_substream(id);
        let (ready_tx, ready_rx) = oneshot::channel();

        let _previous = self.inner.pending_streams.lock().insert(
            id,
            PendingStream {
                entry,
                ready: ready_tx,
            },
        );

        if let Err(err) = self
            .inner
            .send_substream_message(SubstreamMessage::open_request(id))
            .await
        {
            let _pending = self.inner.pending_streams.lock().remove(&id);
            return Err(err);
        }

        tokio::select! {
            result = ready_rx => match result {
                Ok(()) => Ok(substream),
                Err(_) => Err(TransportError::ConnectionReset),
            },
            () = self.inner.shutdown.cancelled() => Err(TransportError::ConnectionReset),
        }
    }

    /// Waits for the next substream opened by the remote peer.
    pub async fn accept_stream(&self) -> Result<Substream, TransportError> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        tokio::select! {
            substream = incoming.recv() => substream.ok_or(TransportError::ConnectionReset),
            () = self.inner.shutdown.cancelled() => Err(TransportError::ConnectionReset),
        }
    }

    /// Closes the connection: idempotent, local-only (no frame is sent).
    /// Pending opens fail, open substreams see end-of-stream, and the
    /// connection is removed from the transport index.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Feeds an inbound transport frame through the reordering queue and
    /// dispatches every frame it releases, in nonce order.
    pub(crate) async fn handle_transport_message(&self, message: TransportMessage) {
        let released = self.inner.queue.lock().try_push(message);
        if let Some(message) = released {
            self.process_ordered(message.message).await;
        }

        loop {
            let next = self.inner.queue.lock().pop();
            match next {
                Some(message) => self.process_ordered(message.message).await,
                None => break,
            }
        }
    }

    async fn process_ordered(&self, message: SubstreamMessage) {
        match message.kind {
            SubstreamKind::OpenRequest => self.handle_open_request(message.id).await,
            SubstreamKind::OpenResponse => self.handle_open_response(message.id),
            SubstreamKind::Data(payload) => self.handle_data(message.id, payload).await,
            SubstreamKind::Close => self.handle_close(message.id),
        }
    }

    async fn handle_open_request(&self, id: SubstreamId) {
        let (substream, entry) = self.inner.new_substream(id);
        let _previous = self.inner.streams.lock().insert(id, entry);

        if let Err(err) = self
            .inner
            .send_substream_message(SubstreamMessage::open_response(id))
            .await
        {
            debug!(%err, substream = %id, "failed to acknowledge substream open");
        }

        self.inner.enqueue_incoming(substream);
    }

    fn handle_open_response(&self, id: SubstreamId) {
        let Some(pending) = self.inner.pending_streams.lock().remove(&id) else {
            debug!(substream = %id, "discarding open response without pending open");
            return;
        };

        match pending.ready.send(()) {
            Ok(()) => {
                let _previous = self.inner.streams.lock().insert(id, pending.entry);
            }
            // opener abandoned the open in the meantime
            Err(()) => debug!(substream = %id, "discarding open response, opener went away"),
        }
    }

    async fn handle_data(&self, id: SubstreamId, payload: Vec<u8>) {
        let entry = {
            let streams = self.inner.streams.lock();
            let Some(entry) = streams.get(&id) else {
                debug!(substream = %id, "discarding data for unknown substream");
                return;
            };
            (entry.data_tx.clone(), Arc::clone(&entry.shared))
        };
        let (data_tx, shared) = entry;

        if shared.local_closed() || shared.remote_closed() {
            return;
        }

        tokio::select! {
            result = data_tx.send(payload) => {
                if result.is_err() {
                    debug!(substream = %id, "substream reader went away");
                }
            }
            () = self.inner.shutdown.cancelled() => {}
        }
    }

    fn handle_close(&self, id: SubstreamId) {
        // dropping the entry drops the data sender, which ends the read side
        let entry = self.inner.streams.lock().remove(&id);
        let pending = self.inner.pending_streams.lock().remove(&id);

        if let Some(entry) = entry {
            entry.shared.set_remote_closed();
        }
        drop(pending);
    }
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn new_substream(self: &Arc<Self>, id: SubstreamId) -> (Substream, StreamEntry) {
        let (data_tx, data_rx) = mpsc::channel(self.substream_buffer);
        let shared = Arc::new(SubstreamShared::new());
        let substream = Substream::new(
            id,
            Arc::downgrade(self),
            Arc::clone(&shared),
            data_rx,
            self.outbound.clone(),
        );
        (substream, StreamEntry { data_tx, shared })
    }

    /// Stamps the next nonce onto a substream message. Exactly one nonce is
    /// consumed per outbound transport frame.
    pub(crate) fn outbound_message(&self, message: SubstreamMessage) -> OutboundMessage {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
        OutboundMessage {
            recipient: *self.remote_addr.recipient(),
            message: Message::Transport(TransportMessage {
                id: self.id,
                nonce,
                message,
            }),
        }
    }

    async fn send_substream_message(
        &self,
        message: SubstreamMessage,
    ) -> Result<(), TransportError> {
        let outbound = self.outbound_message(message);
        tokio::select! {
            result = self.outbound.send(outbound) => result.map_err(|_| TransportError::Closed),
            () = self.shutdown.cancelled() => Err(TransportError::ConnectionReset),
        }
    }

    pub(crate) fn remove_stream(&self, id: &SubstreamId) {
        let entry = self.streams.lock().remove(id);
        drop(entry);
    }

    /// Hands an inbound substream to `accept_stream` without stalling the
    /// dispatcher: a full backlog falls back to a detached send.
    fn enqueue_incoming(&self, substream: Substream) {
        let Some(incoming) = self.incoming_tx.lock().clone() else {
            return;
        };

        match incoming.try_send(substream) {
            Ok(()) => {}
            Err(TrySendError::Full(substream)) => {
                let token = self.shutdown.clone();
                drop(tokio::spawn(async move {
                    tokio::select! {
                        _sent = incoming.send(substream) => {}
                        () = token.cancelled() => {}
                    }
                }));
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        drop(self.incoming_tx.lock().take());

        if let Some(transport) = self.transport.upgrade() {
            transport.remove_connection(&self.id);
        }

        // wake pending opens with an error
        let pending: Vec<PendingStream> = self.pending_streams.lock().drain().map(|(_, p)| p).collect();
        drop(pending);

        // end every open substream
        let streams: Vec<StreamEntry> = self.streams.lock().drain().map(|(_, e)| e).collect();
        for entry in &streams {
            entry.shared.set_remote_closed();
        }
        drop(streams);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(connection = %self.id, "connection dropped without close");
        }
    }
}
