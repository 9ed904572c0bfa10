//! RFC 6455 frame model and wire codec.
//!
//! Decoding never consumes a partial frame: [`decode`] only advances the
//! buffer once a complete frame is available, so the caller can keep appending
//! chunks to the same buffer until it returns a frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseCode, CloseReason, WsError, WsResult};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (fragmented message).
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true for Close, Ping and Pong.
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Returns true for Continuation, Text and Binary.
    pub const fn is_data(self) -> bool {
        !self.is_control()
    }

    /// Parse an opcode from its 4-bit wire value.
    pub fn from_u8(value: u8) -> WsResult<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::protocol(format!("invalid opcode 0x{other:X}"))),
        }
    }
}

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1 (extension-defined).
    pub rsv1: bool,
    /// Reserved bit 2 (extension-defined).
    pub rsv2: bool,
    /// Reserved bit 3 (extension-defined).
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Masking key the frame was (or will be) masked with.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create an unfragmented frame with the given opcode.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Create a binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Create a continuation frame.
    pub fn continuation(payload: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(Opcode::Continuation, payload).with_fin(fin)
    }

    /// Create a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Create a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Create a close frame.
    ///
    /// Codes that may not appear on the wire (such as `1005`) produce an
    /// empty payload. Reasons are truncated on a character boundary so the
    /// payload stays within the control frame limit.
    pub fn close(reason: &CloseReason) -> Self {
        if !CloseCode::is_sendable(reason.code) {
            return Self::new(Opcode::Close, Bytes::new());
        }

        let mut text = reason.reason.as_str();
        while text.len() > MAX_CONTROL_PAYLOAD - 2 {
            let mut end = MAX_CONTROL_PAYLOAD - 2;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text = &text[..end];
        }

        let mut buf = BytesMut::with_capacity(2 + text.len());
        buf.put_u16(reason.code);
        buf.put_slice(text.as_bytes());
        Self::new(Opcode::Close, buf.freeze())
    }

    /// Set the FIN bit.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Set the RSV1 bit.
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Whether any reserved bit is set.
    pub fn has_rsv_bits(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Whether this is a control frame.
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Parse the payload of a close frame.
    ///
    /// An empty payload reports `1005` (no status). A one-byte payload, a code
    /// that may not be sent on the wire, or a reason that is not UTF-8 is a
    /// protocol error.
    pub fn close_reason(&self) -> WsResult<CloseReason> {
        match self.payload.len() {
            0 => Ok(CloseReason::new(CloseCode::NoStatus, "")),
            1 => Err(WsError::protocol("close frame payload of one byte")),
            _ => {
                let mut payload = self.payload.clone();
                let code = payload.get_u16();
                if !CloseCode::is_sendable(code) {
                    return Err(WsError::protocol(format!("invalid close code {code}")));
                }
                let reason = String::from_utf8(payload.to_vec()).map_err(|_| {
                    WsError::protocol_with_code(
                        CloseCode::InvalidPayload,
                        "close reason is not valid UTF-8",
                    )
                })?;
                Ok(CloseReason { code, reason })
            }
        }
    }

    /// Encode this frame, masking the payload if a mask key is set.
    pub fn encode(&self, dst: &mut BytesMut) {
        let payload_len = self.payload.len();

        let mut first_byte = self.opcode as u8;
        if self.fin {
            first_byte |= 0x80;
        }
        if self.rsv1 {
            first_byte |= 0x40;
        }
        if self.rsv2 {
            first_byte |= 0x20;
        }
        if self.rsv3 {
            first_byte |= 0x10;
        }

        let mask_bit = if self.mask_key.is_some() { 0x80 } else { 0 };
        let header_size = 2
            + match payload_len {
                0..=125 => 0,
                126..=65535 => 2,
                _ => 8,
            }
            + if self.mask_key.is_some() { 4 } else { 0 };

        dst.reserve(header_size + payload_len);
        dst.put_u8(first_byte);

        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        match self.mask_key {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&self.payload),
        }
    }

    /// Encode this frame into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` without touching `src` when the buffer does not yet hold
/// a complete frame. Masked frames are unmasked; whether a mask is acceptable
/// is up to the caller.
pub fn decode(src: &mut BytesMut) -> WsResult<Option<Frame>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let first_byte = src[0];
    let second_byte = src[1];

    let fin = first_byte & 0x80 != 0;
    let opcode = Opcode::from_u8(first_byte & 0x0F)?;
    let masked = second_byte & 0x80 != 0;
    let len7 = second_byte & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(WsError::protocol("fragmented control frame"));
        }
        if usize::from(len7) > MAX_CONTROL_PAYLOAD {
            return Err(WsError::protocol("control frame payload exceeds 125 bytes"));
        }
    }

    let (payload_len, mut offset) = match len7 {
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(WsError::protocol("64-bit payload length has the high bit set"));
            }
            (len, 10)
        }
        n => (u64::from(n), 2),
    };

    let mask_key = if masked {
        if src.len() < offset + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&src[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = usize::try_from(payload_len)
        .map_err(|_| WsError::protocol("payload length does not fit in memory"))?;
    let Some(total) = offset.checked_add(payload_len) else {
        return Err(WsError::protocol("payload length does not fit in memory"));
    };
    if src.len() < total {
        return Ok(None);
    }

    src.advance(offset);
    let mut payload = src.split_to(payload_len);
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        rsv1: first_byte & 0x40 != 0,
        rsv2: first_byte & 0x20 != 0,
        rsv3: first_byte & 0x10 != 0,
        opcode,
        mask_key,
        payload: payload.freeze(),
    }))
}

/// XOR `payload` in place with the repeating 4-byte `mask_key`.
///
/// The same operation masks and unmasks.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Generate a random masking key for a client frame.
pub fn generate_mask_key() -> [u8; 4] {
    rand::random()
}
