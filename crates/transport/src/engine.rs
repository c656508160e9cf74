//! WebSocket reactor
//!
//! One OS thread blocks in the poller and turns readiness into queue
//! signals. Tokio tasks drain those queues:
//! - read: handshakes for pending sockets, frame decoding for open ones
//! - message: application `on_message` callbacks
//! - close: teardown and `on_close`
//! - sweep: periodic eviction of idle connections
//!
//! Each read yields at most one frame. Frames split across reads are not
//! reassembled: the bytes they spill into later reads are skipped so the
//! next frame header is found again. Ping/pong/continuation frames are
//! ignored.

use crate::config::EngineConfig;
use crate::connection::{ConnId, Connection, unix_now};
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::negotiator::{Negotiation, negotiate};
use crate::poller::{FIRST_CONN_TOKEN, Poller, PollerHandle, Readiness};
use crate::pool::BufferPool;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use edgews_index::TimeoutIndex;
use edgews_protocol::{
    CloseInfo, Frame, FrameError, Opcode, close_code, decompress_with_limit, spilled_len,
};
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Application callbacks
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    /// Handshake finished and the connection is registered
    async fn on_connect(&self, conn: &Arc<Connection>);

    /// A text or binary message arrived (already inflated)
    async fn on_message(&self, conn: &Arc<Connection>, opcode: Opcode, payload: Bytes);

    /// The connection is gone; fires exactly once per connection.
    ///
    /// `code` is 1006 when no close frame was received.
    async fn on_close(&self, conn: &Arc<Connection>, code: u16, reason: &[u8]);
}

pub type SharedHandler = Arc<dyn WebSocketHandler>;

/// Decoded message on its way to the application
struct Message {
    conn: Arc<Connection>,
    opcode: Opcode,
    payload: Bytes,
}

/// Accepted socket waiting for its upgrade request
struct PendingSocket {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

struct EngineInner {
    config: EngineConfig,
    handler: SharedHandler,
    registry: ConnectionRegistry,
    pending: DashMap<ConnId, PendingSocket>,
    index: TimeoutIndex<ConnId>,
    buffers: Arc<BufferPool>,
    metrics: Arc<EngineMetrics>,
    poller: PollerHandle,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    message_tx: mpsc::Sender<Message>,
    close_tx: mpsc::Sender<ConnId>,
}

/// A running WebSocket engine
pub struct Engine {
    inner: Arc<EngineInner>,
    local_addr: SocketAddr,
    event_loop: Mutex<Option<thread::JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Bind `addr` and start the poll thread and drain tasks.
    ///
    /// A bind failure is returned to the caller, which has no degraded mode
    /// to fall back to.
    pub async fn start(
        addr: SocketAddr,
        config: EngineConfig,
        handler: SharedHandler,
    ) -> Result<Self, EngineError> {
        let poller = Poller::open(addr, config.max_events)?;
        let local_addr = poller.local_addr()?;
        let poller_handle = poller.handle()?;

        let capacity = config.queue_capacity.max(1);
        let (read_tx, read_rx) = mpsc::channel(capacity);
        let (message_tx, message_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = mpsc::channel(capacity);

        let buffer_size = config.read_buffer_size.max(config.write_buffer_size);
        let inner = Arc::new(EngineInner {
            buffers: Arc::new(BufferPool::new(config.buffer_pool_size, buffer_size)),
            metrics: Arc::new(EngineMetrics::new()?),
            config,
            handler,
            registry: ConnectionRegistry::new(),
            pending: DashMap::new(),
            index: TimeoutIndex::new(),
            poller: poller_handle,
            next_id: AtomicU64::new(FIRST_CONN_TOKEN as u64),
            shutdown: AtomicBool::new(false),
            message_tx,
            close_tx,
        });

        let tasks = vec![
            tokio::spawn(read_drain(inner.clone(), read_rx)),
            tokio::spawn(message_drain(inner.clone(), message_rx)),
            tokio::spawn(close_drain(inner.clone(), close_rx)),
            tokio::spawn(sweep_loop(inner.clone())),
        ];

        let loop_inner = inner.clone();
        let event_loop = thread::Builder::new()
            .name("edgews-poll".to_string())
            .spawn(move || run_event_loop(loop_inner, poller, read_tx));

        let event_loop = match event_loop {
            Ok(handle) => handle,
            Err(e) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(e.into());
            }
        };

        info!("Engine started on {}", local_addr);

        Ok(Self {
            inner,
            local_addr,
            event_loop: Mutex::new(Some(event_loop)),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.inner.metrics.clone()
    }

    pub fn connection(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.inner.registry.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Sockets accepted but not yet upgraded
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close one connection; `false` if it was already closed
    pub async fn close_connection(&self, id: ConnId) -> bool {
        self.inner.close_connection(id).await
    }

    /// Run one eviction sweep now; returns the number of connections closed
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Close every connection and stop the poll thread
    pub async fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.inner.poller.wake() {
            warn!("Failed to wake poll thread: {}", e);
        }

        let event_loop = self.event_loop.lock().take();
        if let Some(handle) = event_loop {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                _ => warn!("Poll thread did not exit cleanly"),
            }
        }

        for id in self.inner.registry.ids() {
            self.inner.close_connection(id).await;
        }

        let pending: Vec<ConnId> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, socket)) = self.inner.pending.remove(&id) {
                self.inner.discard(id, socket);
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        info!("Engine closed");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.inner.poller.wake();
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }
}

impl EngineInner {
    /// Accept until the backlog is empty; each socket is parked as pending
    fn accept_all(&self, poller: &Poller) {
        loop {
            let (stream, peer_addr) = match poller.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                trace!("set_nodelay failed: {}", e);
            }

            let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.pending.insert(id, PendingSocket { stream, peer_addr });

            // Registered after insertion so the first readiness finds it
            let registered = match self.pending.get_mut(&id) {
                Some(mut socket) => self.poller.register(&mut socket.stream, id.token()),
                None => continue,
            };

            if let Err(e) = registered {
                warn!(conn = %id, "Failed to register socket: {}", e);
                self.pending.remove(&id);
                continue;
            }

            debug!(conn = %id, peer = %peer_addr, "Accepted connection");
        }
    }

    async fn handle_readable(&self, id: ConnId) {
        if let Some((_, socket)) = self.pending.remove(&id) {
            self.complete_handshake(id, socket).await;
            return;
        }

        match self.registry.get(id) {
            Some(conn) => self.read_frames(&conn).await,
            None => debug!(conn = %id, "Readiness for unknown connection dropped"),
        }
    }

    async fn complete_handshake(&self, id: ConnId, mut socket: PendingSocket) {
        let outcome = {
            let mut buf = self.buffers.acquire_zeroed(self.config.read_buffer_size);
            negotiate(&mut socket.stream, &mut buf, self.config.compression_enabled)
        };

        let compression = match outcome {
            Ok(Negotiation::Accepted { compression }) => compression,
            Ok(Negotiation::Pending) => {
                self.pending.insert(id, socket);
                return;
            }
            Ok(Negotiation::Closed) => {
                debug!(conn = %id, "Peer closed before handshake");
                self.discard(id, socket);
                return;
            }
            Ok(Negotiation::Rejected(_)) => {
                self.metrics.handshake_failures.inc();
                self.discard(id, socket);
                return;
            }
            Err(e) => {
                warn!(conn = %id, "Handshake I/O failed: {}", e);
                self.metrics.handshake_failures.inc();
                self.discard(id, socket);
                return;
            }
        };

        let conn = Arc::new(Connection::new(
            id,
            socket.peer_addr,
            socket.stream,
            unix_now(),
            compression,
            self.config.compression_level(),
            self.buffers.clone(),
            self.metrics.clone(),
        ));

        self.registry.register(conn.clone());
        self.index.insert(conn.last_active(), id);
        self.metrics.handshakes.inc();
        self.metrics.active_connections.inc();

        info!(conn = %id, peer = %conn.peer_addr(), compression, "Connection open");
        self.handler.on_connect(&conn).await;
    }

    /// Deregister and drop a socket that never became a connection
    fn discard(&self, id: ConnId, mut socket: PendingSocket) {
        if let Err(e) = self.poller.deregister(&mut socket.stream) {
            debug!(conn = %id, "Deregister failed: {}", e);
        }
    }

    /// Read until the socket would block, decoding one frame per read
    async fn read_frames(&self, conn: &Arc<Connection>) {
        let mut buf = self.buffers.acquire_zeroed(self.config.read_buffer_size);

        loop {
            let n = match conn.read_into(&mut buf) {
                Ok(0) => {
                    debug!(conn = %conn.id(), "Peer closed connection");
                    self.request_close(conn.id()).await;
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn = %conn.id(), "Read failed: {}", e);
                    self.request_close(conn.id()).await;
                    return;
                }
            };

            let skipped = conn.take_discard(n);
            if skipped == n {
                trace!(conn = %conn.id(), skipped, "Read consumed by spilled frame");
                continue;
            }

            if !self.process_frame(conn, &buf[skipped..n]).await {
                return;
            }
        }
    }

    /// Decode and route one frame; `false` once the connection is closing
    async fn process_frame(&self, conn: &Arc<Connection>, data: &[u8]) -> bool {
        match spilled_len(data) {
            Some(0) => {}
            Some(spill) => {
                debug!(conn = %conn.id(), spill, "Frame runs past read, skipping remainder");
                conn.set_discard(spill);
            }
            None => debug!(conn = %conn.id(), "Read ends inside a frame header"),
        }

        let frame = match Frame::decode(data) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(conn = %conn.id(), "Unmasked frame dropped");
                return true;
            }
            Err(FrameError::Incomplete { needed, available }) => {
                debug!(conn = %conn.id(), needed, available, "Truncated frame dropped");
                return true;
            }
            Err(e) => {
                debug!(conn = %conn.id(), "Frame dropped: {}", e);
                return true;
            }
        };

        self.metrics.frames_received.inc();
        self.metrics.frame_size.observe(frame.payload.len() as f64);

        match frame.opcode {
            Opcode::Close => {
                let info = CloseInfo::parse(&frame.payload);
                debug!(conn = %conn.id(), code = info.code, "Close frame received");
                conn.set_close_info(info);
                self.request_close(conn.id()).await;
                false
            }
            Opcode::Text | Opcode::Binary => {
                conn.touch(&self.index, unix_now());

                let payload = if frame.compressed && conn.compression_negotiated() {
                    match decompress_with_limit(&frame.payload, self.config.max_message_size) {
                        Ok(inflated) => Bytes::from(inflated),
                        Err(e) => {
                            error!(conn = %conn.id(), "Decompression failed: {}", e);
                            return true;
                        }
                    }
                } else {
                    frame.payload
                };

                let message = Message {
                    conn: conn.clone(),
                    opcode: frame.opcode,
                    payload,
                };
                if self.message_tx.send(message).await.is_err() {
                    debug!("Message queue closed");
                }
                true
            }
            other => {
                trace!(conn = %conn.id(), opcode = ?other, "Control frame ignored");
                true
            }
        }
    }

    async fn request_close(&self, id: ConnId) {
        if self.close_tx.send(id).await.is_err() {
            debug!(conn = %id, "Close queue closed");
        }
    }

    /// Tear a connection down and fire `on_close`; idempotent
    async fn close_connection(&self, id: ConnId) -> bool {
        let Some(conn) = self.registry.unregister(id) else {
            trace!(conn = %id, "Close for unknown connection");
            return false;
        };

        if !conn.begin_close() {
            return false;
        }

        self.teardown(conn).await;
        true
    }

    /// Close every connection idle since before `now - timeout`
    async fn sweep(&self) -> usize {
        let deadline = unix_now() - self.config.connection_timeout_secs as i64;
        let mut evicted = 0;

        for (last_active, id) in self.index.expired(deadline) {
            debug!(conn = %id, last_active, "Evicting idle connection");
            if self.evict_if_idle(id, deadline).await {
                self.metrics.evictions.inc();
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} idle connections", evicted);
        }
        evicted
    }

    /// Close `id` if it is still idle since before `deadline`.
    ///
    /// The activity check and OPEN -> CLOSING share the index lock with
    /// `Connection::touch`, so a frame read after the sweep's snapshot
    /// keeps the connection alive.
    async fn evict_if_idle(&self, id: ConnId, deadline: i64) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };

        let claimed = {
            let _tree = self.index.lock();
            conn.last_active() < deadline && conn.begin_close()
        };
        if !claimed {
            trace!(conn = %id, "Connection active again, eviction skipped");
            return false;
        }

        self.registry.unregister(id);
        self.teardown(conn).await;
        true
    }

    /// Release a connection that has won OPEN -> CLOSING and fire `on_close`
    async fn teardown(&self, conn: Arc<Connection>) {
        let id = conn.id();
        conn.remove_from_index(&self.index);

        if let Some(mut stream) = conn.take_stream() {
            if let Err(e) = self.poller.deregister(&mut stream) {
                debug!(conn = %id, "Deregister failed: {}", e);
            }
        }

        conn.finish_close();
        self.metrics.active_connections.dec();

        let (code, reason) = match conn.close_info() {
            Some(info) => (info.code, info.reason),
            None => (close_code::ABNORMAL_CLOSURE, Bytes::new()),
        };

        info!(conn = %id, code, "Connection closed");
        self.handler.on_close(&conn, code, &reason).await;
    }
}

fn run_event_loop(inner: Arc<EngineInner>, mut poller: Poller, read_tx: mpsc::Sender<ConnId>) {
    debug!("Poll thread started");

    while !inner.shutdown.load(Ordering::Acquire) {
        let mut accept_ready = false;

        let result = poller.wait(|readiness| match readiness {
            Readiness::New => accept_ready = true,
            Readiness::Message(token) => {
                if read_tx.blocking_send(ConnId::from_token(token)).is_err() {
                    debug!("Read queue closed");
                }
            }
        });

        match result {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                error!("Poll wait failed: {}", e);
                continue;
            }
        }

        if accept_ready {
            inner.accept_all(&poller);
        }
    }

    debug!("Poll thread stopped");
}

async fn read_drain(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<ConnId>) {
    while let Some(id) = rx.recv().await {
        inner.handle_readable(id).await;
    }
}

async fn message_drain(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if !message.conn.is_open() {
            trace!(conn = %message.conn.id(), "Message for closed connection dropped");
            continue;
        }
        inner
            .handler
            .on_message(&message.conn, message.opcode, message.payload)
            .await;
    }
}

async fn close_drain(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<ConnId>) {
    while let Some(id) = rx.recv().await {
        inner.close_connection(id).await;
    }
}

async fn sweep_loop(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        inner.sweep().await;
    }
}
