// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::network::codec::{CodecParams, FrameCodec, FrameDecoder};
use crate::network::events::{ConnectionEvent, EventHandler, EventHandlers};
use crate::network::Attributes;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One TCP stream plus the codec that frames it.
///
/// Cloning is cheap and every clone refers to the same socket. Incoming frames
/// are pushed to the handlers registered with [`Connection::on_data`],
/// [`Connection::on_close`] and [`Connection::on_error`] by the connection's
/// [`ReceiveLoop`]; handlers may be replaced at any time.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    connected_at: DateTime<Local>,
    codec: Arc<dyn FrameCodec>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    close_signal: CancellationToken,
    read_deadline: AtomicCell<Option<Instant>>,
    read_timeout: AtomicCell<Option<Duration>>,
    deadline_changed: Notify,
    handlers: RwLock<EventHandlers>,
    attributes: Attributes,
}

impl Connection {
    /// Wraps `stream`, returning the connection and the receive loop that
    /// must be driven (usually spawned) for frames to arrive.
    ///
    /// Register handlers before starting the loop to see every frame.
    pub fn new(stream: TcpStream, codec: Arc<dyn FrameCodec>) -> AppResult<(Connection, ReceiveLoop)> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let decoder = codec.decoder();

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                local_addr,
                connected_at: Local::now(),
                codec,
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                close_signal: CancellationToken::new(),
                read_deadline: AtomicCell::new(None),
                read_timeout: AtomicCell::new(None),
                deadline_changed: Notify::new(),
                handlers: RwLock::new(EventHandlers::default()),
                attributes: Attributes::default(),
            }),
        };
        let receive_loop = ReceiveLoop {
            connection: connection.clone(),
            reader,
            decoder,
        };
        Ok((connection, receive_loop))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.inner.peer_addr.ip()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.inner.connected_at
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.inner.codec
    }

    pub fn attributes(&self) -> &Attributes {
        &self.inner.attributes
    }

    pub fn on_data(&self, f: impl Fn(Bytes) + Send + Sync + 'static) {
        self.on(EventHandler::data(f));
    }

    pub fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
        self.on(EventHandler::close(f));
    }

    pub fn on_error(&self, f: impl Fn(&AppError) + Send + Sync + 'static) {
        self.on(EventHandler::error(f));
    }

    /// Installs `handler` in the slot of the event it belongs to.
    pub fn on(&self, handler: EventHandler) {
        trace!(connection_id = self.id(), event = %handler.event(), "bind handler");
        self.inner.handlers.write().install(handler);
    }

    /// Binds `handler` to the event called `event`, failing when the name is
    /// unknown or names another event than the handler is built for.
    pub fn bind(&self, event: &str, handler: EventHandler) -> AppResult<()> {
        let event: ConnectionEvent = event.parse()?;
        if handler.event() != event {
            return Err(AppError::InvalidValue(format!(
                "{} handler cannot be bound to the {} event",
                handler.event(),
                event
            )));
        }
        self.on(handler);
        Ok(())
    }

    /// Fails every read that is still pending at `deadline`; `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read_deadline.store(deadline);
        self.inner.deadline_changed.notify_waiters();
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.inner.read_deadline.load()
    }

    /// Limits how long a single read may wait for data; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.read_timeout.store(timeout);
        self.inner.deadline_changed.notify_waiters();
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.inner.read_timeout.load()
    }

    /// The earlier of the read deadline and the read timeout counted from now.
    fn next_read_deadline(&self) -> Option<Instant> {
        let timeout = self.read_timeout().map(|timeout| Instant::now() + timeout);
        match (self.read_deadline(), timeout) {
            (Some(deadline), Some(timeout)) => Some(deadline.min(timeout)),
            (deadline, None) => deadline,
            (None, timeout) => timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Completes once the connection is closed, locally or by its receive loop.
    pub async fn closed(&self) {
        self.inner.close_signal.cancelled().await
    }

    /// Closes the connection. Calling it again, or after the peer went away,
    /// does nothing.
    ///
    /// No event is reported for a local close. The receive loop stops before
    /// its next read.
    pub fn close(&self) {
        if self.mark_closed() {
            debug!(connection_id = self.id(), peer = %self.peer_addr(), "close connection");
        }
        // an in-flight write keeps the lock until the close signal aborts it,
        // the receive loop then releases the writer
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
    }

    /// Writes already framed bytes straight to the socket.
    ///
    /// A [`Connection::close`] while the write is pending aborts it with
    /// `NotConnected`.
    pub async fn write(&self, data: &[u8]) -> AppResult<usize> {
        let close_signal = self.inner.close_signal.clone();
        tokio::select! {
            biased;
            _ = close_signal.cancelled() => Err(not_connected()),
            written = self.write_locked(data) => written,
        }
    }

    async fn write_locked(&self, data: &[u8]) -> AppResult<usize> {
        let mut writer = self.inner.writer.lock().await;
        let writer = writer
            .as_mut()
            .filter(|_| !self.is_closed())
            .ok_or_else(not_connected)?;
        writer.write_all(data).await?;
        Ok(data.len())
    }

    /// Frames `payload` with the connection's codec and writes it.
    pub async fn send(&self, payload: &[u8], params: &CodecParams) -> AppResult<usize> {
        let frame = self.inner.codec.encode(payload, params)?;
        self.write(&frame).await
    }

    /// Flips the closed flag and wakes the receive loop; true only for the
    /// call that actually closed.
    fn mark_closed(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        self.inner.close_signal.cancel();
        first
    }

    async fn release_writer(&self) {
        self.inner.writer.lock().await.take();
    }

    fn emit_data(&self, frame: Bytes) {
        let handler = self.inner.handlers.read().data.clone();
        handler(frame);
    }

    fn emit_close(&self) {
        let handler = self.inner.handlers.read().close.clone();
        handler();
    }

    pub(crate) fn emit_error(&self, err: &AppError) {
        let handler = self.inner.handlers.read().error.clone();
        handler(err);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("codec", &self.inner.codec.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum ReadEnd {
    /// the peer closed its side
    Eof,
    /// closed locally
    Closed,
}

/// The read half of a [`Connection`] and its codec state.
///
/// Its termination is how a connection's loss is detected.
#[derive(Debug)]
pub struct ReceiveLoop {
    connection: Connection,
    reader: OwnedReadHalf,
    decoder: Box<dyn FrameDecoder>,
}

impl ReceiveLoop {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Reads until the stream ends, delivering frames in arrival order.
    ///
    /// A graceful end of stream closes the connection and reports the close
    /// event, returning `Ok`. Any other failure closes the connection, is
    /// reported once through the error event and returned. A local
    /// [`Connection::close`] ends the loop silently.
    pub async fn run(self) -> AppResult<()> {
        let ReceiveLoop {
            connection,
            mut reader,
            mut decoder,
        } = self;
        debug!(
            connection_id = connection.id(),
            peer = %connection.peer_addr(),
            codec = connection.codec().name(),
            "receive loop started"
        );

        let result = read_frames(&connection, &mut reader, decoder.as_mut()).await;
        drop(reader);
        let first_close = connection.mark_closed();
        connection.release_writer().await;

        match result {
            Ok(ReadEnd::Eof) => {
                debug!(connection_id = connection.id(), "peer closed connection");
                if first_close {
                    connection.emit_close();
                }
                Ok(())
            }
            Ok(ReadEnd::Closed) => {
                debug!(connection_id = connection.id(), "receive loop stopped by close");
                Ok(())
            }
            Err(err) => {
                if first_close {
                    warn!(
                        connection_id = connection.id(),
                        peer = %connection.peer_addr(),
                        "connection failed: {}",
                        err
                    );
                    connection.emit_error(&err);
                }
                Err(err)
            }
        }
    }
}

async fn read_frames(
    connection: &Connection,
    reader: &mut OwnedReadHalf,
    decoder: &mut dyn FrameDecoder,
) -> AppResult<ReadEnd> {
    let close_signal = connection.inner.close_signal.clone();
    loop {
        // registered before the deadline is read so no change slips through
        let deadline_changed = connection.inner.deadline_changed.notified();
        let buf = decoder.read_buf()?;
        let deadline = connection.next_read_deadline();
        let n = tokio::select! {
            biased;
            _ = close_signal.cancelled() => return Ok(ReadEnd::Closed),
            // reads are cancel safe, start over with the new deadline
            _ = deadline_changed => continue,
            read = read_before(reader, buf, deadline) => read?,
        };
        if n == 0 {
            return Ok(ReadEnd::Eof);
        }
        trace!(connection_id = connection.id(), bytes = n, "read");
        decoder.advance(n, &mut |frame| connection.emit_data(frame))?;
    }
}

fn not_connected() -> AppError {
    AppError::IoError(io::Error::new(ErrorKind::NotConnected, "connection closed"))
}

async fn read_before(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> io::Result<usize> {
    match deadline {
        None => reader.read(buf).await,
        Some(deadline) => timeout_at(deadline, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "read deadline elapsed"))?,
    }
}
