//! Edge-triggered readiness multiplexer
//!
//! The listening socket and the shutdown waker sit on reserved tokens; every
//! other token is a connection id.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Token of the listening socket
pub const LISTENER_TOKEN: Token = Token(0);

/// Token of the shutdown waker
pub const WAKER_TOKEN: Token = Token(1);

/// First token handed out to connections
pub const FIRST_CONN_TOKEN: usize = 2;

#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Poll create failed: {0}")]
    CreateFailed(io::Error),

    #[error("Bind failed on {addr}: {source}")]
    BindFailed { addr: SocketAddr, source: io::Error },

    #[error("Register failed: {0}")]
    RegisterFailed(io::Error),

    #[error("Deregister failed: {0}")]
    DeregisterFailed(io::Error),

    #[error("Wake failed: {0}")]
    WakeFailed(io::Error),
}

/// What a ready descriptor means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The listener has pending connections
    New,
    /// A registered connection has data, hung up, or errored
    Message(Token),
}

/// Owns the OS poll handle and the listener; driven by one thread
pub struct Poller {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    waker: Arc<Waker>,
}

/// Cloneable side of the poller used from other threads
pub struct PollerHandle {
    registry: Registry,
    waker: Arc<Waker>,
}

impl Poller {
    /// Bind a non-blocking listener (address reuse on) and register it
    pub fn open(addr: SocketAddr, max_events: usize) -> Result<Self, PollerError> {
        let poll = Poll::new().map_err(PollerError::CreateFailed)?;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| PollerError::BindFailed { addr, source })?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(PollerError::RegisterFailed)?;

        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN).map_err(PollerError::CreateFailed)?,
        );

        if let Ok(local) = listener.local_addr() {
            info!("Listening on {}", local);
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(max_events.max(1)),
            listener,
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registration handle usable while this poller blocks in [`wait`](Self::wait)
    pub fn handle(&self) -> Result<PollerHandle, PollerError> {
        let registry = self
            .poll
            .registry()
            .try_clone()
            .map_err(PollerError::CreateFailed)?;

        Ok(PollerHandle {
            registry,
            waker: self.waker.clone(),
        })
    }

    /// Accept one pending connection; `WouldBlock` once the backlog is empty
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept()
    }

    /// Block until something is ready and report each descriptor.
    ///
    /// Returns `Ok(true)` when the shutdown waker fired. `EINTR` is retried
    /// here; other errors go back to the caller, which logs and re-enters.
    pub fn wait<F>(&mut self, mut callback: F) -> io::Result<bool>
    where
        F: FnMut(Readiness),
    {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut woken = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => callback(Readiness::New),
                WAKER_TOKEN => woken = true,
                token => {
                    trace!(
                        token = token.0,
                        readable = event.is_readable(),
                        closed = event.is_read_closed(),
                        error = event.is_error(),
                        "Connection ready"
                    );
                    callback(Readiness::Message(token));
                }
            }
        }

        Ok(woken)
    }
}

impl PollerHandle {
    /// Edge-triggered readable interest; hangup and error are always reported
    pub fn register(&self, stream: &mut TcpStream, token: Token) -> Result<(), PollerError> {
        self.registry
            .register(stream, token, Interest::READABLE)
            .map_err(PollerError::RegisterFailed)
    }

    pub fn deregister(&self, stream: &mut TcpStream) -> Result<(), PollerError> {
        self.registry
            .deregister(stream)
            .map_err(PollerError::DeregisterFailed)
    }

    /// Interrupt a blocked [`Poller::wait`]
    pub fn wake(&self) -> Result<(), PollerError> {
        debug!("Waking poller");
        self.waker.wake().map_err(PollerError::WakeFailed)
    }
}
