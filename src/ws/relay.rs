//! Full-duplex byte relay between an upgraded WebSocket and a backend TCP
//! stream.
//!
//! One loop per connection waits on readiness of both sides:
//!
//! - client readable → decode frames, append payloads to the backend queue
//! - backend writable (queue non-empty) → one write of the head chunk; a
//!   partial write puts the remainder back at the head
//! - backend readable → one read of up to `buffer_size` bytes, queued as one
//!   frame for the client; a zero-length read means the backend closed
//! - client writable (queue non-empty) → send every queued frame, then flush
//!
//! Each direction preserves byte order. `Interrupted` I/O errors are retried,
//! any other error ends the connection. On the way out both sides are closed
//! once, after whatever is still queued toward the surviving side is flushed.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::task::{ready, Context, Poll};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{
    tungstenite::{self, Message},
    WebSocketStream,
};
use tracing::{debug, warn};

use super::handshake::Subprotocol;

/// Backend read size per readiness event.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Fatal fault on a relayed connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid base64 frame: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("backend accepted zero bytes")]
    WriteZero,
}

// ─── Connection state ────────────────────────────────────────────────────────

/// Lifecycle of one accepted upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, token not yet checked.
    Pending,
    /// Token valid, backend socket open.
    Validated,
    /// `101` sent and the connection handed over.
    Upgraded,
    /// Byte pump running.
    Relaying,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Upgraded => "upgraded",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        }
    }

    fn successor(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Validated),
            Self::Validated => Some(Self::Upgraded),
            Self::Upgraded => Some(Self::Relaying),
            Self::Relaying => Some(Self::Closed),
            Self::Closed => None,
        }
    }

    /// Forward one step, or straight to `Closed` from any live state.
    pub fn can_advance_to(self, next: Self) -> bool {
        self != Self::Closed && (next == Self::Closed || self.successor() == Some(next))
    }
}

/// Bookkeeping for one upgrade request from accept to close.
#[derive(Debug)]
pub struct RelayConnection {
    pub id: String,
    state: ConnectionState,
}

impl RelayConnection {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            state: ConnectionState::Pending,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Invalid transitions are refused and logged.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(
                connection = %self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Refused invalid connection state transition"
            );
            return false;
        }
        debug!(connection = %self.id, from = self.state.as_str(), to = next.as_str(), "Connection state");
        self.state = next;
        true
    }

    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.advance(ConnectionState::Closed);
        }
    }
}

impl Default for RelayConnection {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Queues ──────────────────────────────────────────────────────────────────

/// Ordered chunks waiting to be written to the backend.
#[derive(Debug, Default)]
struct BackendQueue {
    chunks: VecDeque<Bytes>,
}

impl BackendQueue {
    fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn head(&self) -> &[u8] {
        self.chunks.front().map_or(&[], |c| c.as_ref())
    }

    /// Account for `n` bytes of the head chunk having been written.
    fn consume(&mut self, n: usize) {
        if let Some(chunk) = self.chunks.pop_front() {
            if n < chunk.len() {
                self.chunks.push_front(chunk.slice(n..));
            }
        }
    }

    /// Write everything still queued. Returns the byte count.
    async fn drain_into<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<u64, RelayError> {
        let mut total = 0u64;
        while !self.is_empty() {
            if let Some(n) = check_write(writer.write(self.head()).await)? {
                self.consume(n);
                total += n as u64;
            }
        }
        retry_interrupted(writer.flush().await)?;
        Ok(total)
    }
}

/// Frames waiting to be sent to the client.
struct ClientQueue {
    framing: Subprotocol,
    chunks: VecDeque<Bytes>,
    /// Frames handed to the sink but not yet flushed.
    unflushed: bool,
}

impl ClientQueue {
    fn new(framing: Subprotocol) -> Self {
        Self {
            framing,
            chunks: VecDeque::new(),
            unflushed: false,
        }
    }

    fn push(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
    }

    fn has_pending(&self) -> bool {
        !self.chunks.is_empty() || self.unflushed
    }

    /// Send every queued frame and flush. A chunk leaves the queue only once
    /// the sink has accepted it, so dropping this future loses nothing.
    fn poll_drain<S>(&mut self, cx: &mut Context<'_>, sink: &mut S) -> Poll<Result<(), RelayError>>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        while !self.chunks.is_empty() {
            ready!(sink.poll_ready_unpin(cx))?;
            let Some(chunk) = self.chunks.pop_front() else {
                break;
            };
            sink.start_send_unpin(encode(self.framing, chunk))?;
            self.unflushed = true;
        }
        if self.unflushed {
            ready!(sink.poll_flush_unpin(cx))?;
            self.unflushed = false;
        }
        Poll::Ready(Ok(()))
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

enum Inbound {
    Data(Bytes),
    Close,
    Control,
}

fn encode(framing: Subprotocol, chunk: Bytes) -> Message {
    match framing {
        Subprotocol::Binary => Message::Binary(chunk),
        Subprotocol::Base64 => Message::text(STANDARD.encode(&chunk)),
    }
}

fn decode(framing: Subprotocol, msg: Message) -> Result<Inbound, RelayError> {
    Ok(match msg {
        Message::Binary(data) => Inbound::Data(data),
        Message::Text(text) => match framing {
            Subprotocol::Base64 => Inbound::Data(Bytes::from(STANDARD.decode(text.as_str().trim())?)),
            Subprotocol::Binary => Inbound::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
        },
        Message::Close(_) => Inbound::Close,
        _ => Inbound::Control,
    })
}

/// `Ok(None)` for an interrupted call that should simply be retried.
fn retry_interrupted<T>(result: io::Result<T>) -> Result<Option<T>, RelayError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn check_write(result: io::Result<usize>) -> Result<Option<usize>, RelayError> {
    match retry_interrupted(result)? {
        Some(0) => Err(RelayError::WriteZero),
        other => Ok(other),
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Which side ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Client,
    Backend,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client closed",
            Self::Backend => "backend closed",
        }
    }
}

/// Summary of a finished relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayOutcome {
    pub reason: CloseReason,
    /// Bytes written to the backend.
    pub to_backend: u64,
    /// Bytes read from the backend and queued for the client.
    pub to_client: u64,
}

/// Relays one connection. Cheap to construct per connection.
#[derive(Debug, Clone, Copy)]
pub struct RelayEngine {
    framing: Subprotocol,
    buffer_size: usize,
}

impl RelayEngine {
    pub fn new(framing: Subprotocol, buffer_size: usize) -> Self {
        Self {
            framing,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Run until either side closes or fails, then close both.
    pub async fn run<C, B>(
        &self,
        client: WebSocketStream<C>,
        backend: B,
    ) -> Result<RelayOutcome, RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = client.split();
        let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);
        let mut counts = ByteCounts::default();

        let result = self
            .pump(&mut ws_tx, &mut ws_rx, &mut backend_rd, &mut backend_wr, &mut counts)
            .await;

        // Teardown: each side exactly once, whichever one failed.
        if let Err(e) = ws_tx.close().await {
            debug!("Client close: {e}");
        }
        if let Err(e) = backend_wr.shutdown().await {
            debug!("Backend shutdown: {e}");
        }

        result.map(|reason| RelayOutcome {
            reason,
            to_backend: counts.to_backend,
            to_client: counts.to_client,
        })
    }

    async fn pump<C, R, W>(
        &self,
        ws_tx: &mut SplitSink<WebSocketStream<C>, Message>,
        ws_rx: &mut SplitStream<WebSocketStream<C>>,
        backend_rd: &mut R,
        backend_wr: &mut W,
        counts: &mut ByteCounts,
    ) -> Result<CloseReason, RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut to_backend = BackendQueue::default();
        let mut to_client = ClientQueue::new(self.framing);
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    let inbound = match frame {
                        None => Inbound::Close,
                        Some(frame) => decode(self.framing, frame?)?,
                    };
                    match inbound {
                        Inbound::Data(data) => to_backend.push(data),
                        Inbound::Close => {
                            counts.to_backend += to_backend.drain_into(backend_wr).await?;
                            return Ok(CloseReason::Client);
                        }
                        Inbound::Control => {}
                    }
                }
                res = backend_wr.write(to_backend.head()), if !to_backend.is_empty() => {
                    if let Some(n) = check_write(res)? {
                        to_backend.consume(n);
                        counts.to_backend += n as u64;
                    }
                }
                res = backend_rd.read(&mut buf) => {
                    match retry_interrupted(res)? {
                        Some(0) => {
                            poll_fn(|cx| to_client.poll_drain(cx, &mut *ws_tx)).await?;
                            return Ok(CloseReason::Backend);
                        }
                        Some(n) => {
                            to_client.push(Bytes::copy_from_slice(&buf[..n]));
                            counts.to_client += n as u64;
                        }
                        None => {}
                    }
                }
                res = poll_fn(|cx| to_client.poll_drain(cx, &mut *ws_tx)), if to_client.has_pending() => {
                    res?;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ByteCounts {
    to_backend: u64,
    to_client: u64,
}
