//! WebSocket frame codec (RFC 6455 Section 5.2 subset).
//!
//! Inbound frames are client-to-server and always masked; outbound frames
//! are server-to-client and never masked.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |        (16, if len==126)      |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  Masking-key, if MASK set     |          Payload Data         |
//! +-------------------------------+ - - - - - - - - - - - - - - - +
//! ```
//!
//! Payloads are limited to 65535 bytes in both directions; the 64-bit
//! extended length form is rejected.
//!
//! [`FrameDecoder`] is resumable: it consumes header fields from the input
//! buffer as soon as they are complete and reports [`FrameError::Incomplete`]
//! until the rest of the frame arrives, so it can be fed arbitrary chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::trace;

/// Largest payload length that fits in the 7-bit length field.
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Largest payload length this codec handles (16-bit extended length).
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Length of the client masking key.
pub const MASK_KEY_LEN: usize = 4;

const EXTENDED_16_MARKER: u8 = 126;
const EXTENDED_64_MARKER: u8 = 127;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;

/// Frame opcode (low 4 bits of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any value RFC 6455 reserves for future use.
    Reserved(u8),
}

impl Opcode {
    /// Read the opcode out of a header byte. The FIN and RSV bits are ignored.
    pub fn from_u8(byte: u8) -> Self {
        match byte & OPCODE_MASK {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(value) => value & OPCODE_MASK,
        }
    }
}

/// A decoded client frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Frame codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The peer used the 64-bit extended length form.
    UnsupportedFrameSize,
    /// An outbound payload does not fit in a 16-bit length.
    MessageTooLarge { len: usize },
    /// The buffer ends before the current frame does.
    Incomplete { needed: usize },
    /// A client frame arrived without the mask bit.
    Unmasked,
}

impl FrameError {
    /// True when more input would let decoding continue.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete { .. })
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::UnsupportedFrameSize => write!(f, "64-bit messages not handled"),
            FrameError::MessageTooLarge { len } => {
                write!(f, "message too large: {len} bytes (max {MAX_PAYLOAD})")
            }
            FrameError::Incomplete { needed } => {
                write!(f, "incomplete frame: {needed} more bytes needed")
            }
            FrameError::Unmasked => write!(f, "client frame is not masked"),
        }
    }
}

impl std::error::Error for FrameError {}

/// XOR `buf` in place with the repeating 4-byte `key`.
///
/// Masking and unmasking are the same operation.
pub fn apply_mask(buf: &mut [u8], key: [u8; MASK_KEY_LEN]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % MASK_KEY_LEN];
    }
}

/// Hook called for every payload byte while a frame is unmasked.
pub trait UnmaskObserver: Send + Sync {
    fn on_byte(&self, index: usize, masked: u8, key: u8, unmasked: u8);
}

/// Emits one `trace!` event per unmasked byte, bits spelled out.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl UnmaskObserver for TracingObserver {
    fn on_byte(&self, index: usize, masked: u8, key: u8, unmasked: u8) {
        trace!(
            index,
            unmasking = %format!("{masked:08b} ^ {key:08b} = {unmasked:08b}"),
            decoded = %char::from(unmasked).escape_default(),
            "Unmasking byte"
        );
    }
}

fn unmask_observed(buf: &mut [u8], key: [u8; MASK_KEY_LEN], observer: &dyn UnmaskObserver) {
    for (i, byte) in buf.iter_mut().enumerate() {
        let masked = *byte;
        let k = key[i % MASK_KEY_LEN];
        *byte = masked ^ k;
        observer.on_byte(i, masked, k, *byte);
    }
}

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitingHeader,
    AwaitingExtendedLength,
    AwaitingMaskKey,
    AwaitingPayload,
    /// A frame was just returned; the next call starts a new one.
    Complete,
}

/// Resumable decoder for masked client frames.
///
/// One decoder belongs to one connection. Bytes are consumed from the input
/// buffer only once the field they belong to is complete.
pub struct FrameDecoder {
    state: DecodeState,
    fin: bool,
    opcode: Opcode,
    payload_len: usize,
    mask_key: [u8; MASK_KEY_LEN],
    observer: Option<Arc<dyn UnmaskObserver>>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            fin: true,
            opcode: Opcode::Text,
            payload_len: 0,
            mask_key: [0; MASK_KEY_LEN],
            observer: None,
        }
    }

    /// Install a hook that sees every byte as it is unmasked.
    pub fn with_observer(mut self, observer: Arc<dyn UnmaskObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// True if a frame has been started but not finished.
    pub fn has_partial_frame(&self, src: &BytesMut) -> bool {
        !src.is_empty()
            || !matches!(
                self.state,
                DecodeState::AwaitingHeader | DecodeState::Complete
            )
    }

    /// Decode the next frame from `src`.
    ///
    /// Returns `FrameError::Incomplete` when `src` runs out mid-frame; call
    /// again after appending more bytes. Any other error is fatal for the
    /// connection.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Frame, FrameError> {
        loop {
            match self.state {
                DecodeState::Complete => {
                    self.state = DecodeState::AwaitingHeader;
                }

                DecodeState::AwaitingHeader => {
                    need(src, 2)?;

                    let first = src[0];
                    let second = src[1];

                    if second & MASK_BIT == 0 {
                        return Err(FrameError::Unmasked);
                    }

                    let length_indicator = second & !MASK_BIT;
                    if length_indicator == EXTENDED_64_MARKER {
                        return Err(FrameError::UnsupportedFrameSize);
                    }

                    src.advance(2);
                    self.fin = first & FIN_BIT != 0;
                    self.opcode = Opcode::from_u8(first);

                    if length_indicator == EXTENDED_16_MARKER {
                        self.state = DecodeState::AwaitingExtendedLength;
                    } else {
                        self.payload_len = length_indicator as usize;
                        self.state = DecodeState::AwaitingMaskKey;
                    }
                }

                DecodeState::AwaitingExtendedLength => {
                    need(src, 2)?;
                    self.payload_len = src.get_u16() as usize;
                    self.state = DecodeState::AwaitingMaskKey;
                }

                DecodeState::AwaitingMaskKey => {
                    need(src, MASK_KEY_LEN)?;
                    src.copy_to_slice(&mut self.mask_key);
                    self.state = DecodeState::AwaitingPayload;
                }

                DecodeState::AwaitingPayload => {
                    need(src, self.payload_len)?;

                    let mut payload = src.split_to(self.payload_len);
                    match &self.observer {
                        Some(observer) => {
                            unmask_observed(&mut payload, self.mask_key, observer.as_ref())
                        }
                        None => apply_mask(&mut payload, self.mask_key),
                    }

                    self.state = DecodeState::Complete;
                    return Ok(Frame {
                        fin: self.fin,
                        opcode: self.opcode,
                        payload: payload.freeze(),
                    });
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn need(src: &BytesMut, len: usize) -> Result<(), FrameError> {
    if src.len() < len {
        Err(FrameError::Incomplete {
            needed: len - src.len(),
        })
    } else {
        Ok(())
    }
}

/// Size of the header `encode_frame` writes for a payload of `len` bytes.
pub fn header_len(len: usize) -> usize {
    if len <= MAX_SHORT_PAYLOAD {
        2
    } else {
        4
    }
}

/// Encode an unmasked server frame with FIN set.
pub fn encode_frame(payload: &[u8], opcode: Opcode) -> Result<BytesMut, FrameError> {
    let mut dst = BytesMut::new();
    encode_into(payload, opcode, &mut dst)?;
    Ok(dst)
}

/// Encode a text frame.
pub fn encode_text(payload: &[u8]) -> Result<BytesMut, FrameError> {
    encode_frame(payload, Opcode::Text)
}

/// Append an unmasked server frame to `dst`.
///
/// Nothing is written when the payload is too large.
pub fn encode_into(payload: &[u8], opcode: Opcode, dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = payload.len();
    if len > MAX_PAYLOAD {
        return Err(FrameError::MessageTooLarge { len });
    }

    dst.reserve(header_len(len) + len);
    dst.put_u8(FIN_BIT | opcode.as_u8());

    if len <= MAX_SHORT_PAYLOAD {
        dst.put_u8(len as u8);
    } else {
        dst.put_u8(EXTENDED_16_MARKER);
        dst.put_u16(len as u16);
    }

    dst.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Build a masked frame the way a browser would send it.
    pub(crate) fn client_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![FIN_BIT | opcode.as_u8()];
        if payload.len() <= MAX_SHORT_PAYLOAD {
            out.push(MASK_BIT | payload.len() as u8);
        } else {
            out.push(MASK_BIT | EXTENDED_16_MARKER);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&key);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, key);
        out.extend_from_slice(&masked);
        out
    }

    #[test]
    fn test_encode_empty() {
        let frame = encode_text(b"").unwrap();
        assert_eq!(&frame[..], &[0x81, 0x00]);
    }

    #[test]
    fn test_encode_short() {
        let frame = encode_text(b"hello").unwrap();
        assert_eq!(&frame[..2], &[0x81, 5]);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn test_encode_seven_bit_boundary() {
        let payload = vec![b'x'; 125];
        let frame = encode_text(&payload).unwrap();
        assert_eq!(frame.len(), 127);
        assert_eq!(frame[1], 125);
    }

    #[test]
    fn test_encode_sixteen_bit_length() {
        let payload = vec![b'y'; 300];
        let frame = encode_text(&payload).unwrap();
        assert_eq!(frame.len(), 4 + 300);
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
        assert_eq!(&frame[4..], &payload[..]);
    }

    #[test]
    fn test_encode_max_payload() {
        let payload = vec![0u8; MAX_PAYLOAD];
        let frame = encode_text(&payload).unwrap();
        assert_eq!(&frame[1..4], &[126, 0xFF, 0xFF]);
        assert_eq!(frame.len(), 4 + MAX_PAYLOAD);
    }

    #[test]
    fn test_encode_too_large() {
        let payload = vec![0u8; 65536];
        assert_eq!(
            encode_text(&payload),
            Err(FrameError::MessageTooLarge { len: 65536 })
        );

        let mut dst = BytesMut::new();
        assert!(encode_into(&payload, Opcode::Text, &mut dst).is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn test_encode_opcode() {
        let frame = encode_frame(b"", Opcode::Close).unwrap();
        assert_eq!(&frame[..], &[0x88, 0x00]);
        let frame = encode_frame(b"ab", Opcode::Binary).unwrap();
        assert_eq!(frame[0], 0x82);
    }

    #[test]
    fn test_mask_is_self_inverse() {
        let keys = [[0x01, 0x02, 0x03, 0x04], [0xFF, 0x00, 0xAA, 0x55], [0; 4]];
        let payloads: [&[u8]; 4] = [b"", b"a", b"{\"a\":1}", &[0xAB; 125]];

        for key in keys {
            for payload in payloads {
                let mut buf = payload.to_vec();
                apply_mask(&mut buf, key);
                apply_mask(&mut buf, key);
                assert_eq!(buf, payload);
            }
        }
    }

    #[test]
    fn test_decode_json_payload() {
        let wire = client_frame(Opcode::Text, br#"{"a":1}"#, [0x01, 0x02, 0x03, 0x04]);
        let mut buf = BytesMut::from(&wire[..]);
        let mut decoder = FrameDecoder::new();

        let frame = decoder.decode(&mut buf).unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(std::str::from_utf8(&frame.payload).unwrap(), r#"{"a":1}"#);
        assert!(buf.is_empty());
        assert_eq!(decoder.state(), DecodeState::Complete);
    }

    #[test]
    fn test_decode_unmask_matches_wire() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let wire = client_frame(Opcode::Text, b"Hello", key);
        let mut buf = BytesMut::from(&wire[..]);

        let frame = FrameDecoder::new().decode(&mut buf).unwrap();
        for (i, byte) in frame.payload.iter().enumerate() {
            assert_eq!(*byte, wire[6 + i] ^ key[i % 4]);
        }
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_decode_sixteen_bit_length() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let wire = client_frame(Opcode::Binary, &payload, [9, 8, 7, 6]);
        assert_eq!(wire[1], MASK_BIT | 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 1000);

        let mut buf = BytesMut::from(&wire[..]);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_decode_max_payload() {
        let payload = vec![b'z'; MAX_PAYLOAD];
        let wire = client_frame(Opcode::Text, &payload, [1, 2, 3, 4]);
        let mut buf = BytesMut::from(&wire[..]);
        let frame = FrameDecoder::new().decode(&mut buf).unwrap();
        assert_eq!(frame.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_decode_rejects_64_bit_length() {
        let wire = [0x81, MASK_BIT | 127, 0, 0, 0, 0, 0, 1, 0, 0];
        let mut buf = BytesMut::from(&wire[..]);
        let mut decoder = FrameDecoder::new();

        assert_eq!(
            decoder.decode(&mut buf),
            Err(FrameError::UnsupportedFrameSize)
        );
        // Nothing was consumed or truncated.
        assert_eq!(buf.len(), wire.len());
    }

    #[test]
    fn test_decode_rejects_unmasked() {
        let wire = [0x81, 0x02, b'h', b'i'];
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(
            FrameDecoder::new().decode(&mut buf),
            Err(FrameError::Unmasked)
        );
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut buf = BytesMut::new();
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            decoder.decode(&mut buf),
            Err(FrameError::Incomplete { needed: 2 })
        );
        assert!(!decoder.has_partial_frame(&buf));
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let payload = vec![b'q'; 200];
        let wire = client_frame(Opcode::Text, &payload, [0xDE, 0xAD, 0xBE, 0xEF]);
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf);
            if i + 1 < wire.len() {
                assert!(result.unwrap_err().is_incomplete(), "byte {i}");
                assert!(decoder.has_partial_frame(&buf));
            } else {
                assert_eq!(&result.unwrap().payload[..], &payload[..]);
            }
        }
        assert!(!decoder.has_partial_frame(&buf));
    }

    #[test]
    fn test_decode_state_progression() {
        let wire = client_frame(Opcode::Text, &[b'a'; 130], [1, 1, 1, 1]);
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..2]);
        assert!(decoder.decode(&mut buf).is_err());
        assert_eq!(decoder.state(), DecodeState::AwaitingExtendedLength);

        buf.extend_from_slice(&wire[2..4]);
        assert!(decoder.decode(&mut buf).is_err());
        assert_eq!(decoder.state(), DecodeState::AwaitingMaskKey);

        buf.extend_from_slice(&wire[4..8]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(FrameError::Incomplete { needed: 130 })
        );
        assert_eq!(decoder.state(), DecodeState::AwaitingPayload);

        buf.extend_from_slice(&wire[8..]);
        assert!(decoder.decode(&mut buf).is_ok());
        assert_eq!(decoder.state(), DecodeState::Complete);
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut wire = client_frame(Opcode::Text, b"first", [1, 2, 3, 4]);
        wire.extend(client_frame(Opcode::Close, &[0x03, 0xE8], [5, 6, 7, 8]));
        wire.extend_from_slice(&[0x81]);

        let mut buf = BytesMut::from(&wire[..]);
        let mut decoder = FrameDecoder::new();

        assert_eq!(&decoder.decode(&mut buf).unwrap().payload[..], b"first");
        let close = decoder.decode(&mut buf).unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[..], &[0x03, 0xE8]);

        assert!(decoder.decode(&mut buf).unwrap_err().is_incomplete());
        assert!(decoder.has_partial_frame(&buf));
    }

    #[test]
    fn test_decode_fin_and_reserved_opcode() {
        let mut wire = client_frame(Opcode::Reserved(0x3), b"x", [0; 4]);
        wire[0] &= !FIN_BIT;
        let mut buf = BytesMut::from(&wire[..]);

        let frame = FrameDecoder::new().decode(&mut buf).unwrap();
        assert!(!frame.fin);
        assert_eq!(frame.opcode, Opcode::Reserved(0x3));
    }

    #[test]
    fn test_opcode_from_header_byte() {
        assert_eq!(Opcode::from_u8(0x81), Opcode::Text);
        assert_eq!(Opcode::from_u8(0x8A), Opcode::Pong);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, u8, u8, u8)>>);

    impl UnmaskObserver for Recorder {
        fn on_byte(&self, index: usize, masked: u8, key: u8, unmasked: u8) {
            self.0.lock().unwrap().push((index, masked, key, unmasked));
        }
    }

    #[test]
    fn test_observer_sees_every_byte() {
        let recorder = Arc::new(Recorder::default());
        let mut decoder = FrameDecoder::new().with_observer(recorder.clone());
        let key = [0x10, 0x20, 0x30, 0x40];
        let wire = client_frame(Opcode::Text, b"hey!!", key);
        let mut buf = BytesMut::from(&wire[..]);

        let frame = decoder.decode(&mut buf).unwrap();
        assert_eq!(&frame.payload[..], b"hey!!");

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[4], (4, b'!' ^ 0x10, 0x10, b'!'));
        for (index, masked, key, unmasked) in seen.iter() {
            assert_eq!(masked ^ key, *unmasked);
            assert_eq!(*unmasked, b"hey!!"[*index]);
        }
    }
}
