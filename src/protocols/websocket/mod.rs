//! WebSocket protocol implementation (RFC 6455 subset).
//!
//! - `handshake`: `Sec-WebSocket-Accept` derivation and the 101 response
//! - `frame`: masked client frame decoder, unmasked server frame encoder
//! - `session`: per-connection read loop and serialized writer
//!
//! ## Scope
//!
//! Only unfragmented frames with payloads up to 65535 bytes are supported.
//! Close frames are answered with a close frame and pings with a pong;
//! everything else outside text and binary data is dropped.

pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{FrameDecoder, TracingObserver, UnmaskObserver};
pub use handshake::complete_handshake;
pub use session::MessageHandler;
