//! Length-prefixed framing for stream carriers.
//!
//! # Frame Format
//!
//! ```text
//! ┌────────┬────────────┬───────┬─────────────────────┐
//! │ "SRPC" │ len (u32be)│ flags │ payload (len-1 bytes)│
//! └────────┴────────────┴───────┴─────────────────────┘
//! ```
//!
//! `len` counts the flags byte plus the payload. Bit 0 of `flags` marks an
//! LZ4 compressed payload. Payloads above [`COMPRESSION_THRESHOLD`] are
//! compressed when that makes them smaller.

use crate::error::{ProtocolError, Result};

/// Magic bytes opening every SigRPC frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SRPC";

/// Payloads larger than this are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 4 (magic) + 4 (length) + 1 (flags).
pub const FRAME_HEADER_SIZE: usize = 9;

const PREFIX_SIZE: usize = 8;

/// Per-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// The payload is LZ4 compressed (size prepended).
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Wrap a raw flags byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw flags byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    #[inline]
    fn compressed() -> Self {
        Self(Self::COMPRESSED)
    }
}

/// Encodes payloads into frames and extracts payloads from a byte buffer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with compression of large payloads.
    pub fn new() -> Self {
        Self { compression: true }
    }

    /// Codec that never compresses. Compressed frames are still decoded.
    pub fn without_compression() -> Self {
        Self { compression: false }
    }

    /// Wrap `payload` in a frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() + FRAME_HEADER_SIZE > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let compressed = if self.compression && payload.len() > COMPRESSION_THRESHOLD {
            Some(lz4_flex::compress_prepend_size(payload)).filter(|c| c.len() < payload.len())
        } else {
            None
        };

        let (flags, body) = match &compressed {
            Some(c) => (FrameFlags::compressed(), c.as_slice()),
            None => (FrameFlags::default(), payload),
        };

        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
        out.push(flags.as_byte());
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Decode one complete frame from the front of `data`.
    ///
    /// Returns the payload and the number of bytes consumed. Fails if `data`
    /// holds less than a full frame; use [`FrameCodec::try_decode`] for
    /// streaming input.
    pub fn decode(&self, data: &[u8]) -> Result<(Vec<u8>, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Decode one frame if `data` already holds all of it.
    ///
    /// `Ok(None)` means more bytes are needed. Bad magic, an oversized
    /// length or a corrupt compressed payload are errors.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        let Some(content_len) = Self::content_len(data)? else {
            return Ok(None);
        };
        let total = PREFIX_SIZE + content_len;
        if data.len() < total {
            return Ok(None);
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];
        let payload = if flags.is_compressed() {
            Self::decompress(body)?
        } else {
            body.to_vec()
        };
        Ok(Some((payload, total)))
    }

    /// Inflate a size-prepended LZ4 body.
    ///
    /// The declared size is checked against the same bound `encode` applies
    /// to uncompressed payloads before anything is allocated.
    fn decompress(body: &[u8]) -> Result<Vec<u8>> {
        let Some((size, rest)) = body.split_first_chunk::<4>() else {
            return Err(ProtocolError::Deserialization(
                "compressed payload missing size prefix".to_string(),
            ));
        };
        let size = u32::from_le_bytes(*size) as usize;
        if size + FRAME_HEADER_SIZE > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: size + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }
        lz4_flex::decompress(rest, size).map_err(|e| {
            ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
        })
    }

    /// Validate the header and return the content length (flags + payload).
    fn content_len(data: &[u8]) -> Result<Option<usize>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        if data[..4] != FRAME_MAGIC {
            return Err(ProtocolError::Deserialization(format!(
                "invalid frame magic: expected {:02x?}, got {:02x?}",
                FRAME_MAGIC,
                &data[..4]
            )));
        }
        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if content_len == 0 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: missing flags byte".to_string(),
            ));
        }
        if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: PREFIX_SIZE + content_len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Some(content_len))
    }
}
