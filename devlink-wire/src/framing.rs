//! The three framing layers used by the rendezvous relay, the mediator, and
//! the chat-server-protocol proxy channel.

use crate::deserialize::{Cursor, Deserializable, Error as DeError};
use crate::serialize::Serializable;

/// Relay framing: `u32-LE length || payload`.
///
/// The relay's WebSocket delivers arbitrary byte chunks, not necessarily
/// aligned to frame boundaries, so the decoder accumulates across reads and
/// yields frames in arrival order; a partial tail remains buffered.
#[derive(Default)]
pub struct RelayFrameDecoder {
    buf: Vec<u8>,
}

impl RelayFrameDecoder {
    pub fn new() -> Self { Self::default() }

    /// Feed freshly received bytes into the decoder.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(0..4 + len);
        Some(payload)
    }
}

/// Encode a single relay frame.
pub fn encode_relay_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    (payload.len() as u32).serialize(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Mediator framing: each WebSocket message is exactly one frame
/// `type:u8 || reserved:3 (zero) || payload`.
#[derive(Clone, Debug, PartialEq)]
pub struct MediatorFrame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl MediatorFrame {
    pub fn new(frame_type: u8, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(self.frame_type);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(message: &[u8]) -> Result<Self, DeError> {
        if message.len() < 4 {
            return Err(DeError::UnexpectedEof);
        }
        Ok(Self {
            frame_type: message[0],
            // reserved bytes message[1..4] are ignored on receive
            payload: message[4..].to_vec(),
        })
    }
}

/// CSP framing: `length:u16-LE || authenticated-payload` where the payload is
/// the raw AEAD output (ciphertext plus Poly1305 tag).
pub struct CspFrameDecoder {
    buf: Vec<u8>,
}

impl Default for CspFrameDecoder {
    fn default() -> Self { Self { buf: Vec::new() } }
}

impl CspFrameDecoder {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete sealed frame (still AEAD-sealed), if buffered.
    pub fn pop_sealed_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes(self.buf[0..2].try_into().unwrap()) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let sealed = self.buf[2..2 + len].to_vec();
        self.buf.drain(0..2 + len);
        Some(sealed)
    }
}

pub fn encode_csp_frame(sealed_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + sealed_payload.len());
    (sealed_payload.len() as u16).serialize(&mut out);
    out.extend_from_slice(sealed_payload);
    out
}

/// The 4-byte container header that prefixes every CSP container's decrypted
/// plaintext: `type:u8 || reserved:3 bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    pub container_type: u8,
}

impl ContainerHeader {
    pub fn encode(self) -> [u8; 4] {
        [self.container_type, 0, 0, 0]
    }

    pub fn decode(buf: &mut Cursor) -> Result<Self, DeError> {
        let container_type = u8::deserialize(buf)?;
        let mut reserved = [0u8; 3];
        buf.read_exact(&mut reserved)?;
        Ok(Self { container_type })
    }
}

/// Known CSP container type discriminants.
pub mod container_type {
    pub const ECHO_REQUEST: u8 = 0x00;
    pub const OUTGOING_MESSAGE: u8 = 0x01;
    pub const INCOMING_MESSAGE: u8 = 0x02;
    pub const UNBLOCK_INCOMING_MESSAGES: u8 = 0x03;
    pub const ECHO_RESPONSE: u8 = 0x80;
    pub const OUTGOING_MESSAGE_ACK: u8 = 0x81;
    pub const INCOMING_MESSAGE_ACK: u8 = 0x82;
}
