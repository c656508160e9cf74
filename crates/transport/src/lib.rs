//! edgews Transport - edge-triggered WebSocket engine
//!
//! This crate provides:
//! - `Poller`: mio listener and readiness multiplexer
//! - `BufferPool`: fixed-size buffer arena with scoped loans
//! - `Connection` and `ConnectionRegistry`
//! - `negotiate`: handshake I/O over any `Read + Write`
//! - `Engine`: the reactor wiring readiness to the `WebSocketHandler` callbacks
//! - `EngineMetrics`: per-engine Prometheus series

mod config;
mod connection;
mod engine;
mod error;
mod metrics;
mod negotiator;
mod poller;
mod pool;
mod registry;

pub use config::*;
pub use connection::*;
pub use engine::*;
pub use error::*;
pub use metrics::*;
pub use negotiator::*;
pub use poller::*;
pub use pool::*;
pub use registry::*;
