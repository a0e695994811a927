//! Minimal WebSocket framing for disguised relays
//!
//! Frame format (RFC 6455):
//! ```text
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |           (16/64)             |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking key (0 or 4B)     |          Payload              |
//! +-------------------------------+-------------------------------+
//! ```

use crate::protocol::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest payload accepted from the peer (16 MB)
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(ProtocolError::InvalidFrame(format!(
                "Unknown opcode: {:#x}",
                value
            ))),
        }
    }
}

impl OpCode {
    /// Whether the frame carries relay payload
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }
}

/// A single WebSocket frame
#[derive(Debug, Clone)]
pub struct WsFrame {
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl WsFrame {
    /// Create a binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Create a close frame
    pub fn close() -> Self {
        Self {
            opcode: OpCode::Close,
            payload: Bytes::new(),
        }
    }

    /// Encode with FIN set, masking the payload when `mask` is given
    pub fn encode(&self, mask: Option<[u8; 4]>) -> BytesMut {
        let len = self.payload.len();
        let mut buf = BytesMut::with_capacity(14 + len);

        buf.put_u8(0x80 | self.opcode as u8);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len < 126 {
            buf.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                buf.extend_from_slice(&key);
                let start = buf.len();
                buf.extend_from_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            None => buf.extend_from_slice(&self.payload),
        }

        buf
    }
}

/// Incremental frame decoder
#[derive(Debug, Default)]
pub struct WsDecoder {
    buf: BytesMut,
}

impl WsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the peer
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<WsFrame>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let opcode = OpCode::try_from(self.buf[0] & 0x0F)?;
        let masked = self.buf[1] & 0x80 != 0;
        let (payload_len, mut header_len) = match self.buf[1] & 0x7F {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64, 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            n => (n as u64, 2),
        };

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::InvalidFrame(format!(
                "Frame too large: {} bytes",
                payload_len
            )));
        }

        let mask = if masked {
            if self.buf.len() < header_len + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[header_len..header_len + 4]);
            header_len += 4;
            Some(key)
        } else {
            None
        };

        let total = header_len + payload_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(header_len);
        let mut payload = self.buf.split_to(payload_len as usize);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(WsFrame {
            opcode,
            payload: payload.freeze(),
        }))
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}
