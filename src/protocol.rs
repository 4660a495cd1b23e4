// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol between a Client (or Relay) and a Server (or Relay).
//!
//! One persistent byte stream per session. The downstream side sends a single
//! `STREAM` request; the upstream side answers with an unbounded sequence of
//! `EVENT` frames, possibly terminated by one `ERROR` frame.
//!
//! # Framing
//!
//! ```text
//! [tag:1][len:4 BE][body:len]
//!
//! STREAM  body: [version:1][flags:1][log_file_index:8][offset:8][id_len:2][source_id]
//!               flags bit0 = after-position present (absent = from the beginning)
//! EVENT   body: [log_file_index:8][offset:8][flags:1][payload...]
//!               flags bit0 = payload is zstd-compressed
//! ERROR   body: [kind:1][msg_len:2][message]
//! ```
//!
//! Positions are encoded as the exact integers the root assigned; relays
//! decode and re-encode them without arithmetic.
//!
//! # Compression
//!
//! Payloads at or above the codec's threshold are zstd-compressed when that
//! actually shrinks them. Decompression is bounded by [`MAX_FRAME_LEN`] and
//! verifies the zstd magic, so a corrupt peer cannot make us allocate
//! without limit.

use crate::error::{ReplicationError, Result, WireErrorKind};
use crate::position::CanonicalPosition;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version sent in `STREAM` requests.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted frame body (and decompressed payload).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const TAG_STREAM: u8 = 0x01;
const TAG_EVENT: u8 = 0x02;
const TAG_ERROR: u8 = 0x03;

const FLAG_HAS_AFTER: u8 = 0x01;
const FLAG_ZSTD: u8 = 0x01;

/// zstd magic bytes for decompression validation
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZSTD_LEVEL: i32 = 3;

/// A `STREAM` request: "give me events of `source_id` after `after`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub version: u8,
    pub source_id: String,
    pub after: Option<CanonicalPosition>,
}

impl StreamRequest {
    pub fn new(source_id: impl Into<String>, after: Option<CanonicalPosition>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            source_id: source_id.into(),
            after,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stream(StreamRequest),
    Event {
        position: CanonicalPosition,
        payload: Vec<u8>,
    },
    Error {
        kind: WireErrorKind,
        message: String,
    },
}

/// Frame encoder with an optional compression threshold.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    compress_threshold: Option<usize>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            compress_threshold: Some(4096),
        }
    }
}

impl FrameCodec {
    /// Create a codec. `None` disables payload compression.
    pub fn new(compress_threshold: Option<usize>) -> Self {
        Self { compress_threshold }
    }

    /// Encode a frame, header included.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let (tag, body) = match frame {
            Frame::Stream(req) => {
                let id = req.source_id.as_bytes();
                let id_len = u16::try_from(id.len())
                    .map_err(|_| ReplicationError::Protocol("source id too long".to_string()))?;
                let mut body = Vec::with_capacity(20 + id.len());
                body.push(req.version);
                let pos = req.after.unwrap_or(CanonicalPosition::new(0, 0));
                body.push(if req.after.is_some() { FLAG_HAS_AFTER } else { 0 });
                body.extend_from_slice(&pos.log_file_index.to_be_bytes());
                body.extend_from_slice(&pos.offset.to_be_bytes());
                body.extend_from_slice(&id_len.to_be_bytes());
                body.extend_from_slice(id);
                (TAG_STREAM, body)
            }
            Frame::Event { position, payload } => {
                let (flags, data) = self.maybe_compress(payload);
                let mut body = Vec::with_capacity(17 + data.len());
                body.extend_from_slice(&position.log_file_index.to_be_bytes());
                body.extend_from_slice(&position.offset.to_be_bytes());
                body.push(flags);
                body.extend_from_slice(&data);
                (TAG_EVENT, body)
            }
            Frame::Error { kind, message } => {
                // Messages are diagnostic only; clip rather than fail
                let msg = clip_utf8(message, u16::MAX as usize).as_bytes();
                let mut body = Vec::with_capacity(3 + msg.len());
                body.push(kind.code());
                body.extend_from_slice(&(msg.len() as u16).to_be_bytes());
                body.extend_from_slice(msg);
                (TAG_ERROR, body)
            }
        };

        if body.len() > MAX_FRAME_LEN {
            return Err(ReplicationError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut out = Vec::with_capacity(5 + body.len());
        out.push(tag);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn maybe_compress(&self, payload: &[u8]) -> (u8, Vec<u8>) {
        match self.compress_threshold {
            Some(threshold) if payload.len() >= threshold => {
                match zstd::bulk::compress(payload, ZSTD_LEVEL) {
                    Ok(compressed) if compressed.len() < payload.len() => (FLAG_ZSTD, compressed),
                    _ => (0, payload.to_vec()),
                }
            }
            _ => (0, payload.to_vec()),
        }
    }

    /// Encode and write one frame.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame, endpoint: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode(frame)?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| ReplicationError::transport(endpoint, e))?;
        writer
            .flush()
            .await
            .map_err(|e| ReplicationError::transport(endpoint, e))
    }
}

/// Decode a frame body for the given tag.
pub fn decode_frame(tag: u8, body: &[u8]) -> Result<Frame> {
    let mut r = BodyReader::new(body);
    match tag {
        TAG_STREAM => {
            let version = r.u8()?;
            let flags = r.u8()?;
            let pos = CanonicalPosition::new(r.u64()?, r.u64()?);
            let id_len = r.u16()? as usize;
            let source_id = r.utf8(id_len)?;
            r.finish()?;
            Ok(Frame::Stream(StreamRequest {
                version,
                source_id,
                after: (flags & FLAG_HAS_AFTER != 0).then_some(pos),
            }))
        }
        TAG_EVENT => {
            let position = CanonicalPosition::new(r.u64()?, r.u64()?);
            let flags = r.u8()?;
            let data = r.rest();
            let payload = if flags & FLAG_ZSTD != 0 {
                decompress_payload(data)?
            } else {
                data.to_vec()
            };
            Ok(Frame::Event { position, payload })
        }
        TAG_ERROR => {
            let code = r.u8()?;
            let kind = WireErrorKind::from_code(code)
                .ok_or_else(|| ReplicationError::Protocol(format!("unknown error kind {code}")))?;
            let len = r.u16()? as usize;
            let message = r.utf8(len)?;
            r.finish()?;
            Ok(Frame::Error { kind, message })
        }
        other => Err(ReplicationError::Protocol(format!("unknown frame tag 0x{other:02x}"))),
    }
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
fn clip_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Decompress a zstd payload, bounded by [`MAX_FRAME_LEN`].
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 || data[..4] != ZSTD_MAGIC {
        return Err(ReplicationError::Decompression(
            "compressed flag set but zstd magic missing".to_string(),
        ));
    }
    decompress_bounded(data, MAX_FRAME_LEN)
}

/// Stream-decode `data`, refusing output larger than `limit`. The buffer
/// grows with the output instead of being sized for the worst case.
fn decompress_bounded(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    use std::io::Read;

    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
    let mut decompressed = Vec::with_capacity(data.len().saturating_mul(4).min(limit));
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
    if decompressed.len() > limit {
        return Err(ReplicationError::Decompression(format!(
            "decompressed payload exceeds {} bytes",
            limit
        )));
    }
    Ok(decompressed)
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean EOF before the first byte of a frame.
/// EOF inside a frame is a transport error (the connection dropped).
pub async fn read_frame<R>(reader: &mut R, endpoint: &str) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ReplicationError::transport(endpoint, e)),
    };
    let len = reader
        .read_u32()
        .await
        .map_err(|e| ReplicationError::transport(endpoint, e))? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ReplicationError::Protocol(format!(
            "frame length {} exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ReplicationError::transport(endpoint, e))?;
    decode_frame(tag, &body).map(Some)
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| ReplicationError::Protocol("truncated frame body".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn utf8(&mut self, n: usize) -> Result<String> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ReplicationError::Protocol("invalid utf-8 in frame".to_string()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(ReplicationError::Protocol("trailing bytes in frame body".to_string()))
        }
    }
}
