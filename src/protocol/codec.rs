//! Frame codec for the supported transports
//!
//! Turns opaque payloads into self-delimiting frames and back. Decoding never
//! blocks: it consumes whatever complete frames are buffered and leaves any
//! incomplete remainder in place for the next call.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DEFAULT_MAX_PAYLOAD, FRAME_DELIMITER, MAX_PAYLOAD_LIMIT};

/// Length prefix size for stream framing
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors
///
/// Every decode error consumes the offending frame, so the caller can keep
/// decoding from the same buffer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("COBS frame contains a zero byte at offset {0}")]
    UnexpectedZero(usize),

    #[error("COBS frame truncated: code at offset {offset} needs {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Framing used on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// COBS stuffing with a trailing 0x00 delimiter
    Cobs,
    /// Big-endian `u32` length prefix
    LengthPrefixed,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framing::Cobs => f.write_str("cobs"),
            Framing::LengthPrefixed => f.write_str("length-prefixed"),
        }
    }
}

/// Stuff `src` so it contains no zero byte and append it to `dst`.
///
/// The trailing delimiter is not written.
pub fn cobs_encode(src: &[u8], dst: &mut BytesMut) {
    dst.reserve(cobs_max_encoded_len(src.len()));

    let mut code_idx = dst.len();
    dst.put_u8(0);
    let mut code: u8 = 1;

    for &byte in src {
        if byte == 0 {
            dst[code_idx] = code;
            code_idx = dst.len();
            dst.put_u8(0);
            code = 1;
            continue;
        }

        dst.put_u8(byte);
        code += 1;
        if code == 0xFF {
            dst[code_idx] = code;
            code_idx = dst.len();
            dst.put_u8(0);
            code = 1;
        }
    }

    dst[code_idx] = code;
}

/// Reverse [`cobs_encode`]. `src` must not include the delimiter.
pub fn cobs_decode(src: &[u8]) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut idx = 0;

    while idx < src.len() {
        let code = src[idx];
        if code == 0 {
            return Err(CodecError::UnexpectedZero(idx));
        }

        let start = idx + 1;
        let end = idx + code as usize;
        if end > src.len() {
            return Err(CodecError::Truncated {
                offset: idx,
                needed: end - src.len(),
            });
        }

        if let Some(pos) = src[start..end].iter().position(|&b| b == 0) {
            return Err(CodecError::UnexpectedZero(start + pos));
        }
        out.extend_from_slice(&src[start..end]);

        idx = end;
        // A full block (0xFF) carries no implicit zero; neither does the last block
        if code != 0xFF && idx < src.len() {
            out.push(0);
        }
    }

    Ok(out)
}

/// Worst case stuffed size of a payload of `len` bytes, excluding the delimiter
pub fn cobs_max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a complete frame
    Frame,
    /// Dropping bytes of an oversized frame
    Discard { remaining: usize },
    /// Dropping bytes until the next delimiter
    Resync,
}

/// Encodes payloads into frames and decodes frames from a byte stream
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_payload: usize,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self::with_max_payload(framing, DEFAULT_MAX_PAYLOAD)
    }

    /// `max_payload` is capped at what a length prefix can describe
    pub fn with_max_payload(framing: Framing, max_payload: usize) -> Self {
        Self {
            framing,
            max_payload: max_payload.min(MAX_PAYLOAD_LIMIT),
            state: DecodeState::Frame,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append the frame for `payload` to `dst`
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> CodecResult<()> {
        if payload.len() > self.max_payload {
            return Err(CodecError::FrameTooLarge(payload.len(), self.max_payload));
        }

        match self.framing {
            Framing::Cobs => {
                cobs_encode(payload, dst);
                dst.put_u8(FRAME_DELIMITER);
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len())
                    .map_err(|_| CodecError::FrameTooLarge(payload.len(), MAX_PAYLOAD_LIMIT))?;
                dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
                dst.put_u32(len);
                dst.put_slice(payload);
            }
        }
        Ok(())
    }

    /// Attempt to decode one payload from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed. An error means one frame
    /// was dropped; decoding may continue with the same buffer.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Bytes>> {
        match self.framing {
            Framing::Cobs => self.decode_cobs(buf),
            Framing::LengthPrefixed => self.decode_length_prefixed(buf),
        }
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Vec<CodecResult<Bytes>> {
        let mut frames = Vec::new();
        loop {
            match self.decode(buf) {
                Ok(Some(payload)) => frames.push(Ok(payload)),
                Ok(None) => break,
                Err(e) => frames.push(Err(e)),
            }
        }
        frames
    }

    fn decode_cobs(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Bytes>> {
        let max_encoded = cobs_max_encoded_len(self.max_payload);

        loop {
            let delimiter = buf.iter().position(|&b| b == FRAME_DELIMITER);

            if self.state == DecodeState::Resync {
                match delimiter {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.state = DecodeState::Frame;
                        continue;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = delimiter else {
                if buf.len() > max_encoded {
                    let len = buf.len();
                    buf.clear();
                    self.state = DecodeState::Resync;
                    return Err(CodecError::FrameTooLarge(len, max_encoded));
                }
                return Ok(None);
            };

            let frame = buf.split_to(pos + 1);
            let encoded = &frame[..pos];
            if encoded.is_empty() {
                // Consecutive delimiters are padding
                continue;
            }
            if encoded.len() > max_encoded {
                return Err(CodecError::FrameTooLarge(encoded.len(), max_encoded));
            }

            return cobs_decode(encoded).map(|payload| Some(Bytes::from(payload)));
        }
    }

    fn decode_length_prefixed(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::Discard { remaining } => {
                    let skip = remaining.min(buf.len());
                    buf.advance(skip);
                    if skip < remaining {
                        self.state = DecodeState::Discard {
                            remaining: remaining - skip,
                        };
                        return Ok(None);
                    }
                    self.state = DecodeState::Frame;
                }
                DecodeState::Frame | DecodeState::Resync => {
                    if buf.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                    if length > self.max_payload {
                        buf.advance(LENGTH_PREFIX_SIZE);
                        self.state = DecodeState::Discard { remaining: length };
                        return Err(CodecError::FrameTooLarge(length, self.max_payload));
                    }

                    if buf.len() < LENGTH_PREFIX_SIZE + length {
                        buf.reserve(LENGTH_PREFIX_SIZE + length - buf.len());
                        return Ok(None);
                    }

                    buf.advance(LENGTH_PREFIX_SIZE);
                    return Ok(Some(buf.split_to(length).freeze()));
                }
            }
        }
    }
}
