//! Engine error type

use crate::poller::PollerError;
use edgews_protocol::CompressionError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("Write stalled after {0} bytes")]
    WriteStalled(usize),
}
