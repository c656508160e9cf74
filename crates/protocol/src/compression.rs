//! permessage-deflate payload transform (no context takeover)
//!
//! Outbound payloads are raw-deflated with a sync flush and the trailing
//! `00 00 FF FF` marker is stripped. Inbound payloads get [`INFLATE_SUFFIX`]
//! appended before inflating: the sync marker plus an empty final stored
//! block, so the decoder sees a complete stream.

use flate2::{Compress, Compression, FlushCompress, Status};
use std::io::Read;
use thiserror::Error;

/// Marker emitted by a deflate sync flush
pub const SYNC_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Suffix appended to every inbound compressed payload before inflating
pub const INFLATE_SUFFIX: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

/// Default compression level when compression is on and no level is configured
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Decompressed size exceeds limit of {0} bytes")]
    TooLarge(usize),
}

/// Deflate `data` at `level` (0-9) and strip the sync marker
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, CompressionError> {
    let mut compressor = Compress::new(Compression::new(level.min(9)), false);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);

    loop {
        let consumed = compressor.total_in() as usize;
        if out.capacity() - out.len() < 64 {
            out.reserve(out.capacity().max(64));
        }

        let status = compressor
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;

        let all_in = compressor.total_in() as usize == data.len();
        let has_room = out.len() < out.capacity();
        match status {
            Status::Ok | Status::BufError if all_in && has_room => break,
            Status::StreamEnd => break,
            _ => {}
        }
    }

    if out.ends_with(&SYNC_MARKER) {
        out.truncate(out.len() - SYNC_MARKER.len());
    }

    Ok(out)
}

/// Inflate a payload produced by a peer's [`compress`]-compatible writer
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    decompress_with_limit(data, usize::MAX)
}

/// Inflate with a maximum output size
pub fn decompress_with_limit(data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    let mut input = Vec::with_capacity(data.len() + INFLATE_SUFFIX.len());
    input.extend_from_slice(data);
    input.extend_from_slice(&INFLATE_SUFFIX);

    let mut decoder = flate2::read::DeflateDecoder::new(input.as_slice());
    let mut result = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        if n == 0 {
            break;
        }

        if result.len() + n > max_size {
            return Err(CompressionError::TooLarge(max_size));
        }

        result.extend_from_slice(&buf[..n]);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let data = b"Hello, edgews! This is a test message that should be compressed.";
        let compressed = compress(data, DEFAULT_COMPRESSION_LEVEL).unwrap();
        let decompressed = decompress(&compressed).unwrap();

        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_sync_marker_stripped() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let compressed = compress(data, DEFAULT_COMPRESSION_LEVEL).unwrap();

        assert!(!compressed.ends_with(&SYNC_MARKER));
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn test_rfc7692_hello() {
        // RFC 7692 Section 7.2.3.1: "Hello" compressed without context takeover
        let wire = [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00];
        assert_eq!(decompress(&wire).unwrap(), b"Hello");
    }

    #[test]
    fn test_large_payload() {
        let data: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&data, 6).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_decompress_with_limit() {
        let data: Vec<u8> = (0..10000).map(|i| (i % 256) as u8).collect();
        let compressed = compress(&data, DEFAULT_COMPRESSION_LEVEL).unwrap();

        let result = decompress_with_limit(&compressed, 1000);
        assert!(matches!(result, Err(CompressionError::TooLarge(1000))));

        let result = decompress_with_limit(&compressed, 100000);
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_empty_payload() {
        let compressed = compress(&[], DEFAULT_COMPRESSION_LEVEL).unwrap();
        assert!(decompress(&compressed).unwrap().is_empty());
    }
}
