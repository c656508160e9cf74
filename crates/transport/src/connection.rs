//! Per-socket connection state

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::pool::BufferPool;
use edgews_index::TimeoutIndex;
use edgews_protocol::{CloseInfo, Opcode, compress, encode_frame};
use mio::Token;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

/// Attempts made on a full socket send buffer before giving up
const WRITE_RETRY_LIMIT: usize = 200;

/// Pause between attempts on a full socket send buffer
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Connection identifier, also the connection's poll token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub fn from_token(token: Token) -> Self {
        ConnId(token.0 as u64)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Socket accepted, handshake not yet complete
    Accepted = 0,
    /// Registered, readable, eligible for eviction
    Open = 1,
    /// Teardown in progress
    Closing = 2,
    /// Deregistered and released
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Accepted,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Current wall clock in UNIX seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// An upgraded WebSocket connection
pub struct Connection {
    id: ConnId,
    peer_addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    /// Serializes frames; held across write back-off, unlike `stream`
    write_lock: tokio::sync::Mutex<()>,
    /// Bytes of a frame that spilled past an earlier read, still to drop
    discard: AtomicU64,
    state: AtomicU8,
    last_active: AtomicI64,
    compression: AtomicBool,
    compression_level: u32,
    close_info: Mutex<Option<CloseInfo>>,
    buffers: Arc<BufferPool>,
    metrics: Arc<EngineMetrics>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnId,
        peer_addr: SocketAddr,
        stream: TcpStream,
        now: i64,
        compression: bool,
        compression_level: u32,
        buffers: Arc<BufferPool>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            stream: Mutex::new(Some(stream)),
            write_lock: tokio::sync::Mutex::new(()),
            discard: AtomicU64::new(0),
            state: AtomicU8::new(ConnState::Open as u8),
            last_active: AtomicI64::new(now),
            compression: AtomicBool::new(compression),
            compression_level,
            close_info: Mutex::new(None),
            buffers,
            metrics,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Last data-frame activity, UNIX seconds
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Acquire)
    }

    pub fn compression_negotiated(&self) -> bool {
        self.compression.load(Ordering::Relaxed)
    }

    /// Code and reason of the close frame, if one was received
    pub fn close_info(&self) -> Option<CloseInfo> {
        self.close_info.lock().clone()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Send a text message
    pub async fn write(&self, payload: &[u8]) -> Result<(), EngineError> {
        self.send(Opcode::Text, payload).await
    }

    /// Send a binary message
    pub async fn write_binary(&self, payload: &[u8]) -> Result<(), EngineError> {
        self.send(Opcode::Binary, payload).await
    }

    /// Encode one unmasked frame and write it to the socket.
    ///
    /// Data frames are deflated when compression was negotiated. A full send
    /// buffer is retried with async back-off; reads on this connection are
    /// not blocked meanwhile.
    pub async fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<(), EngineError> {
        if !self.is_open() {
            return Err(EngineError::ConnectionClosed(self.id.0));
        }

        let mut frame = self.buffers.acquire();
        if opcode.is_data() && self.compression_negotiated() {
            let compressed = compress(payload, self.compression_level)?;
            encode_frame(&mut frame, opcode, &compressed, true);
        } else {
            encode_frame(&mut frame, opcode, payload, false);
        }

        let _writer = self.write_lock.lock().await;
        write_with_backoff(&self.stream, &frame)
            .await
            .map_err(|e| match e {
                EngineError::ConnectionClosed(_) => EngineError::ConnectionClosed(self.id.0),
                e => e,
            })?;

        self.metrics.frames_sent.inc();
        trace!(conn = %self.id, len = frame.len(), "Frame written");
        Ok(())
    }

    /// One non-blocking read; `Ok(0)` once the stream is gone
    pub(crate) fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.lock().as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }

    /// Note that the next `len` bytes read belong to a frame already dropped
    pub(crate) fn set_discard(&self, len: u64) {
        self.discard.store(len, Ordering::Relaxed);
    }

    /// Consume owed discard bytes from a read of `available` bytes.
    ///
    /// Returns how many leading bytes of that read to drop.
    pub(crate) fn take_discard(&self, available: usize) -> usize {
        let owed = self.discard.load(Ordering::Relaxed);
        let dropped = owed.min(available as u64);
        self.discard.store(owed - dropped, Ordering::Relaxed);
        dropped as usize
    }

    pub(crate) fn set_close_info(&self, info: CloseInfo) {
        *self.close_info.lock() = Some(info);
    }

    /// Move this connection to a newer timestamp in the index.
    ///
    /// The state check and the rekey happen under the index lock, so a
    /// concurrent close cannot leave a stale entry behind.
    pub(crate) fn touch(&self, index: &TimeoutIndex<ConnId>, now: i64) {
        let mut tree = index.lock();
        if !self.is_open() {
            return;
        }

        let old = self.last_active();
        if old != now {
            tree.rekey(old, now, self.id);
            self.last_active.store(now, Ordering::Release);
        }
    }

    /// Drop this connection from the index; must follow [`begin_close`](Self::begin_close)
    pub(crate) fn remove_from_index(&self, index: &TimeoutIndex<ConnId>) {
        let mut tree = index.lock();
        if tree.remove_value(self.last_active(), &self.id).is_err() {
            trace!(conn = %self.id, "Connection already absent from index");
        }
    }

    /// OPEN -> CLOSING; false if someone else got there first
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                ConnState::Open as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().take()
    }

    pub(crate) fn finish_close(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("last_active", &self.last_active())
            .finish()
    }
}

/// Write all of `buf` to a shared non-blocking writer.
///
/// The lock is taken per attempt and released while backing off.
/// `ConnectionClosed(0)` once the writer has been taken away.
pub(crate) async fn write_with_backoff<W: Write>(
    writer: &Mutex<Option<W>>,
    buf: &[u8],
) -> Result<(), EngineError> {
    let mut written = 0;
    let mut retries = 0;

    while written < buf.len() {
        let attempt = match writer.lock().as_mut() {
            Some(w) => w.write(&buf[written..]),
            None => return Err(EngineError::ConnectionClosed(0)),
        };

        match attempt {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > WRITE_RETRY_LIMIT {
                    warn!("Socket send buffer full, dropping write");
                    return Err(EngineError::WriteStalled(written));
                }
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Write all of `buf` to a non-blocking writer, retrying briefly on `WouldBlock`.
///
/// Only for the handshake response on a fresh socket.
pub(crate) fn write_fully<W: Write>(writer: &mut W, buf: &[u8]) -> Result<(), EngineError> {
    let mut written = 0;
    let mut retries = 0;

    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > WRITE_RETRY_LIMIT {
                    warn!("Socket send buffer full, dropping write");
                    return Err(EngineError::WriteStalled(written));
                }
                std::thread::sleep(WRITE_RETRY_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
