//! Session with the local mixnet client.
//!
//! The gateway speaks a small binary protocol over a websocket. The session
//! asks for the client's own recipient address on startup, then turns into a
//! pair of pumps: outbound messages are wrapped into send requests, inbound
//! `Received` frames are decoded into transport messages and published on a
//! bounded queue.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nymlink_primitives::{Message, Recipient, RecipientError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

mod proto;

use proto::ServerResponse;

use crate::config::MixnetConfig;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A decoded message delivered by the mixnet.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: Message,
}

/// A message to be sent through the mixnet.
#[derive(Debug)]
pub struct OutboundMessage {
    pub recipient: Recipient,
    pub message: Message,
}

/// Live gateway session: the local recipient plus the two message queues.
#[derive(Debug)]
pub struct MixnetSession {
    pub local_recipient: Recipient,
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub outbound: mpsc::Sender<OutboundMessage>,
}

#[derive(Debug, Error)]
pub enum MixnetError {
    #[error("empty gateway response")]
    EmptyResponse,
    #[error("gateway response too short")]
    TruncatedResponse,
    #[error("gateway response length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: u64, actual: usize },
    #[error("unknown gateway response tag {0}")]
    UnknownResponseTag(u8),
    #[error("received message carries an unsupported sender tag")]
    UnsupportedSenderTag,
    #[error("invalid sender tag marker {0}")]
    InvalidSenderTagMarker(u8),
    #[error("malformed self address: {0}")]
    SelfAddress(#[from] RecipientError),
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),
    #[error("gateway closed the connection during startup")]
    StartupClosed,
}

/// Connects to the mixnet client at `url` and completes the startup protocol:
/// a `SelfAddressRequest` is sent and the call resolves once the gateway has
/// answered with the local recipient. `Received` frames observed in between
/// are genuine traffic and are queued rather than dropped.
pub async fn connect(url: &str, config: &MixnetConfig) -> Result<MixnetSession, MixnetError> {
    let (socket, _response) = connect_async(url).await?;
    let (mut sink, mut source) = socket.split();

    sink.send(WsMessage::binary(proto::self_address_request()))
        .await?;

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);

    let local_recipient = loop {
        let frame = match source.next().await {
            Some(frame) => frame?,
            None => return Err(MixnetError::StartupClosed),
        };
        let WsMessage::Binary(data) = frame else {
            continue;
        };

        match proto::decode_server_response(&data) {
            Ok(ServerResponse::SelfAddress(recipient)) => break recipient,
            Ok(ServerResponse::Received(payload)) => enqueue_received(&inbound_tx, &payload),
            Ok(ServerResponse::Error { code, message }) => {
                warn!(code, %message, "gateway error during startup");
            }
            Err(err) => warn!(%err, "undecodable gateway response during startup"),
        }
    };

    let token = CancellationToken::new();
    drop(tokio::spawn(run_writer(token.clone(), outbound_rx, sink)));
    drop(tokio::spawn(run_reader(token, source, inbound_tx)));

    Ok(MixnetSession {
        local_recipient,
        inbound: inbound_rx,
        outbound: outbound_tx,
    })
}

/// Pulls outbound messages, wraps them into send requests and writes them to
/// the socket in dequeue order. A write failure is fatal to the session.
async fn run_writer(
    token: CancellationToken,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut sink: WsSink,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            message = outbound.recv() => {
                let Some(OutboundMessage { recipient, message }) = message else {
                    break;
                };
                let frame = proto::send_request(&recipient, &message.encode());
                if let Err(err) = sink.send(WsMessage::binary(frame)).await {
                    error!(%err, "failed to write to the gateway");
                    break;
                }
            }
        }
    }

    token.cancel();
    let _closed = sink.close().await;
}

/// Reads gateway frames, decodes `Received` payloads into transport messages
/// and publishes them inbound. Per-frame decode failures are dropped; a read
/// failure is fatal to the session.
async fn run_reader(
    token: CancellationToken,
    mut source: WsSource,
    inbound: mpsc::Sender<InboundMessage>,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            frame = source.next() => {
                let data = match frame {
                    None => break,
                    Some(Ok(WsMessage::Binary(data))) => data,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        error!(%err, "gateway read error");
                        break;
                    }
                };

                match proto::decode_server_response(&data) {
                    Ok(ServerResponse::Received(payload)) => enqueue_received(&inbound, &payload),
                    Ok(ServerResponse::SelfAddress(_)) => {
                        debug!("ignoring duplicate self address response");
                    }
                    Ok(ServerResponse::Error { code, message }) => {
                        warn!(code, %message, "gateway error");
                    }
                    Err(err) => warn!(%err, "undecodable gateway response"),
                }
            }
        }
    }

    token.cancel();
    // dropping `inbound` ends the transport's receive stream
}

/// Decodes a received payload and queues it without blocking the reader. The
/// substrate has no retransmit, so a full queue honestly drops the frame.
fn enqueue_received(inbound: &mpsc::Sender<InboundMessage>, payload: &[u8]) {
    let message = match Message::decode(payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(%err, "dropping undecodable mixnet payload");
            return;
        }
    };

    match inbound.try_send(InboundMessage { message }) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("inbound queue full, dropping mixnet message"),
        Err(TrySendError::Closed(_)) => {}
    }
}
