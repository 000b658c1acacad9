use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use nymlink_primitives::{SubstreamId, SubstreamMessage};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::connection::ConnectionInner;
use crate::error::TransportError;
use crate::mixnet::OutboundMessage;

/// Flags shared between a [`Substream`] and the connection's dispatch path.
#[derive(Debug)]
pub(crate) struct SubstreamShared {
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl SubstreamShared {
    pub(crate) fn new() -> Self {
        Self {
            local_closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn local_closed(&self) -> bool {
        self.local_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::SeqCst)
    }

    fn set_local_closed(&self) {
        self.local_closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_remote_closed(&self) {
        self.remote_closed.store(true, Ordering::SeqCst);
    }
}

/// A logical bidirectional byte stream multiplexed inside a connection.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Reads drain data frames in
/// the order the remote wrote them; a read returns 0 once the stream has
/// been closed and the buffered bytes are consumed. Every write becomes one
/// data frame carrying a copy of the caller's bytes. `shutdown` closes both
/// directions; the substrate has no half-close.
pub struct Substream {
    id: SubstreamId,
    conn: Weak<ConnectionInner>,
    shared: Arc<SubstreamShared>,
    data_rx: mpsc::Receiver<Vec<u8>>,
    read_buf: Vec<u8>,
    outbound: PollSender<OutboundMessage>,
}

impl Substream {
    pub(crate) fn new(
        id: SubstreamId,
        conn: Weak<ConnectionInner>,
        shared: Arc<SubstreamShared>,
        data_rx: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            id,
            conn,
            shared,
            data_rx,
            read_buf: Vec::new(),
            outbound: PollSender::new(outbound),
        }
    }

    pub fn id(&self) -> &SubstreamId {
        &self.id
    }

    /// Aborts the stream. The substrate carries no error codes, so this is
    /// the same full close `shutdown` performs.
    pub async fn reset(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    fn finish_close(&mut self) {
        self.shared.set_local_closed();
        self.shared.set_remote_closed();
        self.data_rx.close();
        if let Some(conn) = self.conn.upgrade() {
            if !conn.is_closed() {
                conn.remove_stream(&self.id);
            }
        }
    }
}

impl AsyncRead for Substream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                let _consumed = this.read_buf.drain(..n);
                return Poll::Ready(Ok(()));
            }

            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(data)) if data.is_empty() => {}
                Poll::Ready(Some(data)) => this.read_buf = data,
                // queue closed and drained: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Substream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.shared.local_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                TransportError::StreamClosed,
            )));
        }

        let Some(conn) = this.conn.upgrade() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                TransportError::ConnectionReset,
            )));
        };
        if conn.is_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                TransportError::ConnectionReset,
            )));
        }

        match this.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    TransportError::Closed,
                )));
            }
            Poll::Pending => return Poll::Pending,
        }

        // the frame owns a copy: the session queue outlives the caller's buffer
        let message = conn.outbound_message(SubstreamMessage::data(this.id, data.to_vec()));
        if this.outbound.send_item(message).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                TransportError::Closed,
            )));
        }

        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are handed to the session whole; nothing is buffered here
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.shared.local_closed() {
            return Poll::Ready(Ok(()));
        }

        if let Some(conn) = this.conn.upgrade().filter(|conn| !conn.is_closed()) {
            match this.outbound.poll_reserve(cx) {
                Poll::Ready(Ok(())) => {
                    let message = conn.outbound_message(SubstreamMessage::close(this.id));
                    let _sent = this.outbound.send_item(message);
                }
                // session already torn down; finish the close locally
                Poll::Ready(Err(_)) => {}
                Poll::Pending => return Poll::Pending,
            }
        }

        this.finish_close();
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for Substream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substream")
            .field("id", &self.id)
            .field("local_closed", &self.shared.local_closed())
            .field("remote_closed", &self.shared.remote_closed())
            .finish_non_exhaustive()
    }
}
