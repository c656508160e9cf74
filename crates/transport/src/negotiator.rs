//! Handshake I/O: read the upgrade request, answer 101 or an error status

use crate::connection::write_fully;
use crate::error::EngineError;
use edgews_protocol::{
    HandshakeError, HeaderMap, accept_response, compute_accept_key, reject_response,
    validate_upgrade,
};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// Result of one negotiation attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// No bytes available yet
    Pending,
    /// Peer closed before sending a request
    Closed,
    /// 101 written
    Accepted { compression: bool },
    /// Error response written (best effort)
    Rejected(HandshakeError),
}

/// Read the request from `stream` and write the response.
///
/// `buf` is the read window; the request must fit in one read. Compression
/// is negotiated only when `compression_enabled` and the client offers
/// permessage-deflate.
pub fn negotiate<S: Read + Write>(
    stream: &mut S,
    buf: &mut [u8],
    compression_enabled: bool,
) -> Result<Negotiation, EngineError> {
    let n = loop {
        match stream.read(buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Negotiation::Pending),
            Err(e) => return Err(e.into()),
        }
    };

    if n == 0 {
        return Ok(Negotiation::Closed);
    }

    let headers = HeaderMap::parse(&buf[..n]);
    debug!(method = headers.method(), headers = headers.len(), "Upgrade request");

    let key = match validate_upgrade(&headers) {
        Ok(key) => key,
        Err(err) => {
            warn!("Handshake rejected: {}", err);
            if let Err(e) = write_fully(stream, &reject_response(&err)) {
                debug!("Failed to send rejection: {}", e);
            }
            return Ok(Negotiation::Rejected(err));
        }
    };

    let compression = compression_enabled && headers.offers_deflate();
    let response = accept_response(&compute_accept_key(key), compression);
    write_fully(stream, &response)?;

    Ok(Negotiation::Accepted { compression })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, records writes
    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        would_block: bool,
    }

    impl MockStream {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
                would_block: false,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.would_block {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_accept() {
        let mut stream = MockStream::new(REQUEST.as_bytes());
        let mut buf = [0u8; 1024];

        let result = negotiate(&mut stream, &mut buf, false).unwrap();
        assert_eq!(result, Negotiation::Accepted { compression: false });

        let response = String::from_utf8(stream.output).unwrap();
        assert_eq!(
            response,
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_deflate_negotiated_only_when_enabled() {
        let request = REQUEST.replace(
            "\r\n\r\n",
            "\r\nSec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
        );
        let mut buf = [0u8; 1024];

        let mut stream = MockStream::new(request.as_bytes());
        let result = negotiate(&mut stream, &mut buf, true).unwrap();
        assert_eq!(result, Negotiation::Accepted { compression: true });
        assert!(String::from_utf8_lossy(&stream.output).contains("permessage-deflate"));

        let mut stream = MockStream::new(request.as_bytes());
        let result = negotiate(&mut stream, &mut buf, false).unwrap();
        assert_eq!(result, Negotiation::Accepted { compression: false });
    }

    #[test]
    fn test_reject_writes_status() {
        let request = REQUEST.replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8");
        let mut stream = MockStream::new(request.as_bytes());
        let mut buf = [0u8; 1024];

        let result = negotiate(&mut stream, &mut buf, false).unwrap();
        assert_eq!(result, Negotiation::Rejected(HandshakeError::UnsupportedVersion));
        assert!(stream.output.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_pending_and_closed() {
        let mut buf = [0u8; 64];

        let mut stream = MockStream::new(b"");
        stream.would_block = true;
        assert_eq!(negotiate(&mut stream, &mut buf, false).unwrap(), Negotiation::Pending);

        let mut stream = MockStream::new(b"");
        assert_eq!(negotiate(&mut stream, &mut buf, false).unwrap(), Negotiation::Closed);
        assert!(stream.output.is_empty());
    }
}
