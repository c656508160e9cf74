//! Echo handler

use async_trait::async_trait;
use bytes::Bytes;
use edgews_protocol::Opcode;
use edgews_transport::{Connection, WebSocketHandler};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sends every message back on the connection it came from
pub struct EchoHandler;

#[async_trait]
impl WebSocketHandler for EchoHandler {
    async fn on_connect(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), peer = %conn.peer_addr(), "Client connected");
    }

    async fn on_message(&self, conn: &Arc<Connection>, opcode: Opcode, payload: Bytes) {
        debug!(conn = %conn.id(), len = payload.len(), "Echoing message");
        if let Err(e) = conn.send(opcode, &payload).await {
            warn!(conn = %conn.id(), "Echo failed: {}", e);
        }
    }

    async fn on_close(&self, conn: &Arc<Connection>, code: u16, reason: &[u8]) {
        info!(
            conn = %conn.id(),
            code,
            reason = %String::from_utf8_lossy(reason),
            "Client disconnected"
        );
    }
}
