//! Protocol implementations.
//!
//! - `websocket`: handshake, frame codec and connection session
//! - `echo`: the JSON echo application served over WebSocket

pub mod echo;
pub mod websocket;
