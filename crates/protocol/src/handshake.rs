//! Opening handshake (RFC 6455 Section 4.2)
//!
//! Header names are matched exactly as the client sent them; no case
//! folding is done.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;

/// GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Extension response sent when permessage-deflate is negotiated
pub const DEFLATE_EXTENSION_RESPONSE: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

/// Rejected upgrade request, carrying the HTTP status to answer with
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("websocket: the client is not using the websocket protocol: 'upgrade' token not found in 'Connection' header")]
    MissingConnectionUpgrade,

    #[error("websocket: the client is not using the websocket protocol: 'websocket' token not found in 'Upgrade' header")]
    MissingUpgradeWebsocket,

    #[error("websocket: the client is not using the websocket protocol: request method is not GET")]
    MethodNotGet,

    #[error("websocket: unsupported version: 13 not found in 'Sec-Websocket-Version' header")]
    UnsupportedVersion,

    #[error("websocket: not a websocket handshake: 'Sec-WebSocket-Key' header is missing or blank")]
    MissingKey,
}

impl HandshakeError {
    /// HTTP status code for the rejection response
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::MethodNotGet => 405,
            _ => 400,
        }
    }

    /// HTTP reason phrase matching [`status`](Self::status)
    pub fn reason_phrase(&self) -> &'static str {
        match self.status() {
            405 => "Method Not Allowed",
            _ => "Bad Request",
        }
    }
}

/// Request line method plus `Key: Value` header lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    method: String,
    headers: HashMap<String, String>,
}

impl HeaderMap {
    /// Parse raw request bytes.
    ///
    /// Lines end at CR (LF is skipped). The first line is split on spaces
    /// and its first token is the method; later lines are split on the first
    /// `": "`. Lines without a separator are ignored and parsing stops at the
    /// first blank line.
    pub fn parse(buf: &[u8]) -> Self {
        let mut map = HeaderMap::default();
        let mut line = Vec::new();
        let mut first = true;

        for &byte in buf {
            match byte {
                b'\r' => {
                    let text = String::from_utf8_lossy(&line);
                    if first {
                        map.method = text.split(' ').next().unwrap_or_default().to_string();
                        first = false;
                    } else if text.is_empty() {
                        break;
                    } else if let Some((key, value)) = text.split_once(": ") {
                        map.headers.insert(key.to_string(), value.to_string());
                    }
                    line.clear();
                }
                b'\n' => {}
                other => line.push(other),
            }
        }

        map
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Exact-case header lookup
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Whether the client offered permessage-deflate
    pub fn offers_deflate(&self) -> bool {
        self.get("Sec-WebSocket-Extensions")
            .map(|v| v.split([',', ';']).any(|t| t.trim() == "permessage-deflate"))
            .unwrap_or(false)
    }
}

/// Check the upgrade preconditions in order and return the challenge key
pub fn validate_upgrade(headers: &HeaderMap) -> Result<&str, HandshakeError> {
    match headers.get("Connection") {
        Some("Upgrade") | Some("upgrade") => {}
        _ => return Err(HandshakeError::MissingConnectionUpgrade),
    }

    if headers.get("Upgrade") != Some("websocket") {
        return Err(HandshakeError::MissingUpgradeWebsocket);
    }

    if headers.method() != "GET" {
        return Err(HandshakeError::MethodNotGet);
    }

    if headers.get("Sec-WebSocket-Version") != Some("13") {
        return Err(HandshakeError::UnsupportedVersion);
    }

    match headers.get("Sec-WebSocket-Key") {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(HandshakeError::MissingKey),
    }
}

/// base64(SHA-1(key ++ GUID))
pub fn compute_accept_key(challenge_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(challenge_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// `101 Switching Protocols` response bytes
pub fn accept_response(accept_key: &str, deflate: bool) -> Vec<u8> {
    let mut response = String::with_capacity(160);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ");
    response.push_str(accept_key);
    response.push_str("\r\n");
    if deflate {
        response.push_str("Sec-WebSocket-Extensions: ");
        response.push_str(DEFLATE_EXTENSION_RESPONSE);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.into_bytes()
}

/// Plain-text error response for a rejected upgrade
pub fn reject_response(err: &HandshakeError) -> Vec<u8> {
    let body = err.to_string();
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        err.status(),
        err.reason_phrase(),
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(lines: &[&str]) -> HeaderMap {
        let mut raw = String::from("GET /chat HTTP/1.1\r\n");
        for line in lines {
            raw.push_str(line);
            raw.push_str("\r\n");
        }
        raw.push_str("\r\n");
        HeaderMap::parse(raw.as_bytes())
    }

    fn valid_lines() -> Vec<&'static str> {
        vec![
            "Host: server.example.com",
            "Upgrade: websocket",
            "Connection: Upgrade",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
            "Sec-WebSocket-Version: 13",
        ]
    }

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(compute_accept_key(RFC_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_headers() {
        let map = request(&valid_lines());
        assert_eq!(map.method(), "GET");
        assert_eq!(map.get("Upgrade"), Some("websocket"));
        assert_eq!(map.get("Sec-WebSocket-Key"), Some(RFC_KEY));
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn test_parse_is_case_sensitive() {
        let map = request(&["upgrade: websocket"]);
        assert_eq!(map.get("Upgrade"), None);
        assert_eq!(map.get("upgrade"), Some("websocket"));
    }

    #[test]
    fn test_parse_ignores_malformed_lines() {
        let map = request(&["NoSeparatorHere", "Upgrade: websocket"]);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_validate_valid_upgrade() {
        let map = request(&valid_lines());
        assert_eq!(validate_upgrade(&map), Ok(RFC_KEY));
    }

    #[test]
    fn test_lowercase_connection_accepted() {
        let mut lines = valid_lines();
        lines[2] = "Connection: upgrade";
        assert!(validate_upgrade(&request(&lines)).is_ok());
    }

    #[test]
    fn test_validate_missing_connection() {
        let mut lines = valid_lines();
        lines.remove(2);
        let err = validate_upgrade(&request(&lines)).unwrap_err();
        assert_eq!(err, HandshakeError::MissingConnectionUpgrade);
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_validate_wrong_upgrade() {
        let mut lines = valid_lines();
        lines[1] = "Upgrade: WebSocket";
        assert_eq!(
            validate_upgrade(&request(&lines)),
            Err(HandshakeError::MissingUpgradeWebsocket)
        );
    }

    #[test]
    fn test_validate_wrong_method() {
        let mut raw = String::from("POST /chat HTTP/1.1\r\n");
        for line in valid_lines() {
            raw.push_str(line);
            raw.push_str("\r\n");
        }
        let err = validate_upgrade(&HeaderMap::parse(raw.as_bytes())).unwrap_err();
        assert_eq!(err, HandshakeError::MethodNotGet);
        assert_eq!(err.status(), 405);
    }

    #[test]
    fn test_validate_wrong_version() {
        let mut lines = valid_lines();
        lines[4] = "Sec-WebSocket-Version: 8";
        assert_eq!(
            validate_upgrade(&request(&lines)),
            Err(HandshakeError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_validate_blank_key() {
        let mut lines = valid_lines();
        lines.remove(3);
        assert_eq!(validate_upgrade(&request(&lines)), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_accept_response_literal() {
        let response = accept_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", false);
        assert_eq!(
            response,
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_accept_response_with_deflate() {
        let response = String::from_utf8(accept_response("abc", true)).unwrap();
        assert!(response.contains("Sec-WebSocket-Extensions: permessage-deflate"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_offers_deflate() {
        let mut lines = valid_lines();
        lines.push("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits");
        assert!(request(&lines).offers_deflate());
        assert!(!request(&valid_lines()).offers_deflate());
    }

    #[test]
    fn test_reject_response() {
        let response = String::from_utf8(reject_response(&HandshakeError::MethodNotGet)).unwrap();
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.ends_with("request method is not GET"));
    }
}
