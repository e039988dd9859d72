//! Per-connection WebSocket session.
//!
//! Runs after the handshake has been written. Each readability event
//! appends to the connection's buffer and drains every complete frame from
//! it before reading again, so reads on one connection never interleave.
//! Outbound frames go through [`Outbound`], which serializes writers.

use crate::protocols::websocket::frame::{
    encode_frame, encode_text, Frame, FrameDecoder, FrameError, Opcode,
};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Application callback for complete data frames.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message payload. A returned reply is sent as a text frame.
    fn on_message(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Session errors
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Frame(FrameError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "I/O error: {e}"),
            SessionError::Frame(e) => write!(f, "frame error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::Frame(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Frame(e)
    }
}

/// Write side of a connection. Clones share one writer, and a frame is
/// always written whole before the next one starts.
pub struct Outbound<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for Outbound<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Encode and send one frame. Oversized payloads are rejected before
    /// anything reaches the socket.
    pub async fn send(&self, payload: &[u8], opcode: Opcode) -> Result<(), SessionError> {
        let frame = encode_frame(payload, opcode)?;
        self.write_frame(&frame).await
    }

    pub async fn send_text(&self, payload: &[u8]) -> Result<(), SessionError> {
        let frame = encode_text(payload)?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Drive a WebSocket connection until the peer closes it.
///
/// `buffer` holds any bytes that arrived together with the upgrade request.
pub async fn run<S>(
    stream: S,
    mut buffer: BytesMut,
    mut decoder: FrameDecoder,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let outbound = Outbound::new(writer);
    let mut pending = FrameError::Incomplete { needed: 2 };

    loop {
        // Drain every complete frame before waiting on the socket again
        loop {
            let frame = match decoder.decode(&mut buffer) {
                Ok(frame) => frame,
                Err(e) if e.is_incomplete() => {
                    pending = e;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            if dispatch(frame, &outbound, handler.as_ref()).await? == Flow::Close {
                return Ok(());
            }
        }

        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            if decoder.has_partial_frame(&buffer) {
                debug!(state = ?decoder.state(), buffered = buffer.len(), "Connection closed mid-frame");
                return Err(pending.into());
            }
            trace!("Connection closed by client");
            return Ok(());
        }
    }
}

async fn dispatch<W>(
    frame: Frame,
    outbound: &Outbound<W>,
    handler: &dyn MessageHandler,
) -> Result<Flow, SessionError>
where
    W: AsyncWrite + Unpin,
{
    if !frame.fin {
        warn!(opcode = ?frame.opcode, "Dropping fragmented frame");
        return Ok(Flow::Continue);
    }

    match frame.opcode {
        Opcode::Text | Opcode::Binary => {
            debug!(len = frame.payload.len(), "Message received");

            if let Some(reply) = handler.on_message(&frame.payload) {
                match outbound.send_text(&reply).await {
                    Err(SessionError::Frame(e)) => warn!(error = %e, "Reply not sent"),
                    other => other?,
                }
            }
        }

        Opcode::Close => {
            // Echo the status code, if any, and stop reading
            let code = frame.payload.get(..2).unwrap_or(&[]);
            outbound.send(code, Opcode::Close).await?;
            debug!("Close frame received");
            return Ok(Flow::Close);
        }

        Opcode::Ping => outbound.send(&frame.payload, Opcode::Pong).await?,

        Opcode::Pong => {}

        Opcode::Continuation | Opcode::Reserved(_) => {
            debug!(opcode = ?frame.opcode, "Ignoring frame");
        }
    }

    Ok(Flow::Continue)
}
