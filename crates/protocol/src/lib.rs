//! edgews Protocol - RFC 6455 wire format
//!
//! This crate provides:
//! - `Frame`: decoding of masked client frames and encoding of server frames
//! - `MaskKey`: the 4-byte XOR payload mask
//! - `HeaderMap` and the upgrade validation / accept-token helpers
//! - permessage-deflate compress/decompress with the fixed trailer contract
//!
//! Nothing here performs I/O; the transport crate owns the sockets.

mod compression;
mod frame;
mod handshake;
mod mask;

pub use compression::*;
pub use frame::*;
pub use handshake::*;
pub use mask::*;
