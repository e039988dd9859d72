//! JSON echo application.
//!
//! Every text or binary message must be a JSON document. The reply wraps it
//! in an envelope stamped with the time it was handled:
//!
//! ```text
//! Request:  {"a":1}
//! Response: {"message":{"a":1},"at":"2024-01-02T03:04:05.000Z"}
//! ```
//!
//! Messages that are not JSON are logged and dropped; the connection stays
//! open.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocols::websocket::MessageHandler;

#[derive(Serialize)]
struct Envelope<'a> {
    message: &'a Value,
    at: String,
}

/// Replies to each JSON message with a timestamped envelope.
pub struct EchoHandler {
    clock: fn() -> DateTime<Utc>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    /// Use `clock` instead of the system time for the `at` field.
    pub fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for EchoHandler {
    fn on_message(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let received = match std::str::from_utf8(payload) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Dropping message that is not UTF-8");
                return None;
            }
        };

        let message: Value = match serde_json::from_str(received) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Dropping message that is not JSON");
                return None;
            }
        };

        debug!(message = %received, "Message received");

        let envelope = Envelope {
            message: &message,
            at: (self.clock)().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        match serde_json::to_vec(&envelope) {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "Failed to serialize reply");
                None
            }
        }
    }
}
