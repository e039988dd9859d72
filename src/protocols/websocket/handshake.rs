//! Opening handshake (RFC 6455 Section 4.2.2).
//!
//! Turns the client's `Sec-WebSocket-Key` into the `101 Switching Protocols`
//! header block that completes the upgrade.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_MAGIC_KEY: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Handshake errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The upgrade request carried no usable `Sec-WebSocket-Key`.
    MissingKey,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::MissingKey => write!(f, "missing Sec-WebSocket-Key header"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Compute `base64(sha1(client_key + magic))`.
pub fn accept_token(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_MAGIC_KEY.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the header block that accepts the upgrade.
///
/// The caller writes the returned block to the connection verbatim.
pub fn complete_handshake(client_key: &str) -> Result<String, HandshakeError> {
    let client_key = client_key.trim();
    if client_key.is_empty() {
        return Err(HandshakeError::MissingKey);
    }

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_token(client_key)
    ))
}
