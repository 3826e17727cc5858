//! Fixed-size binary codec for preview packets.
//!
//! Wire format (little-endian, bincode with fixed-width integers):
//! ```text
//! Point (22 bytes)
//! ┌──────────┬────────────┬─────────┬─────────┬──────────┐
//! │ tag 0x01 │ stroke id  │ x  f32  │ y  f32  │ pressure │
//! │ 2 bytes  │ 8 bytes    │ 4 bytes │ 4 bytes │ 4 bytes  │
//! └──────────┴────────────┴─────────┴─────────┴──────────┘
//!
//! Cursor (11 bytes)
//! ┌──────────┬─────────┬─────────┬─────────┐
//! │ tag 0x02 │ x  f32  │ y  f32  │ drawing │
//! │ 2 bytes  │ 4 bytes │ 4 bytes │ 1 byte  │
//! └──────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! The buffer length alone selects the packet kind on decode. Anything
//! that is not exactly 22 or 11 bytes, or carries the wrong tag, decodes
//! to `None`: a confused or hostile peer must never be able to make the
//! receiver fail.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Encoded size of a [`PointPacket`].
pub const POINT_PACKET_SIZE: usize = 22;
/// Encoded size of a [`CursorPacket`].
pub const CURSOR_PACKET_SIZE: usize = 11;
/// Size of the count prefix in a point batch.
pub const BATCH_HEADER_SIZE: usize = 2;
/// Byte length of a truncated stroke identifier.
pub const STROKE_TAG_LEN: usize = 8;

const POINT_TAG: u16 = 0x0001;
const CURSOR_TAG: u16 = 0x0002;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

// ───────────────────────────────────────────────────────────────────
// Stroke identifiers
// ───────────────────────────────────────────────────────────────────

/// A stroke identifier truncated to 8 bytes for the wire.
///
/// Longer ids keep their first 8 bytes (cut on a UTF-8 character
/// boundary); shorter ids are zero-padded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StrokeTag([u8; STROKE_TAG_LEN]);

impl StrokeTag {
    /// Truncate a full stroke id to its wire form.
    pub fn from_id(id: &str) -> Self {
        let mut end = 0;
        for (idx, ch) in id.char_indices() {
            let next = idx + ch.len_utf8();
            if next > STROKE_TAG_LEN {
                break;
            }
            end = next;
        }

        let mut bytes = [0u8; STROKE_TAG_LEN];
        bytes[..end].copy_from_slice(&id.as_bytes()[..end]);
        Self(bytes)
    }

    /// Build from raw wire bytes.
    pub fn from_bytes(bytes: [u8; STROKE_TAG_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STROKE_TAG_LEN] {
        &self.0
    }

    /// Text form with zero padding stripped.
    pub fn as_str(&self) -> Cow<'_, str> {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |last| last + 1);
        String::from_utf8_lossy(&self.0[..end])
    }

    /// Whether `id` truncates to this tag.
    pub fn matches(&self, id: &str) -> bool {
        *self == Self::from_id(id)
    }
}

impl From<&str> for StrokeTag {
    fn from(id: &str) -> Self {
        Self::from_id(id)
    }
}

impl fmt::Display for StrokeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for StrokeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrokeTag({:?})", self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Packets
// ───────────────────────────────────────────────────────────────────

/// One sample of an in-progress stroke, in unit canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPacket {
    pub stroke_id: StrokeTag,
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
}

impl PointPacket {
    pub fn new(stroke_id: impl Into<StrokeTag>, x: f32, y: f32, pressure: f32) -> Self {
        Self {
            stroke_id: stroke_id.into(),
            x,
            y,
            pressure,
        }
    }
}

/// Latest cursor position of a peer, in unit canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorPacket {
    pub x: f32,
    pub y: f32,
    pub drawing: bool,
}

impl CursorPacket {
    pub fn new(x: f32, y: f32, drawing: bool) -> Self {
        Self { x, y, drawing }
    }
}

/// Any packet carried on the direct channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    Point(PointPacket),
    Cursor(CursorPacket),
}

impl From<PointPacket> for Packet {
    fn from(p: PointPacket) -> Self {
        Packet::Point(p)
    }
}

impl From<CursorPacket> for Packet {
    fn from(c: CursorPacket) -> Self {
        Packet::Cursor(c)
    }
}

#[derive(Serialize, Deserialize)]
struct PointWire {
    tag: u16,
    stroke_id: [u8; STROKE_TAG_LEN],
    x: f32,
    y: f32,
    pressure: f32,
}

#[derive(Serialize, Deserialize)]
struct CursorWire {
    tag: u16,
    x: f32,
    y: f32,
    drawing: bool,
}

impl Packet {
    /// Serialize to the fixed-size wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = match self {
            Packet::Point(p) => bincode::serde::encode_to_vec(
                PointWire {
                    tag: POINT_TAG,
                    stroke_id: *p.stroke_id.as_bytes(),
                    x: p.x,
                    y: p.y,
                    pressure: p.pressure,
                },
                wire_config(),
            ),
            Packet::Cursor(c) => bincode::serde::encode_to_vec(
                CursorWire {
                    tag: CURSOR_TAG,
                    x: c.x,
                    y: c.y,
                    drawing: c.drawing,
                },
                wire_config(),
            ),
        }
        .map_err(|e| CodecError::Encode(e.to_string()))?;

        if bytes.len() != self.wire_size() {
            return Err(CodecError::SizeMismatch {
                expected: self.wire_size(),
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parse a wire buffer. Returns `None` for anything unrecognized.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            POINT_PACKET_SIZE => decode_point(bytes).map(Packet::Point),
            CURSOR_PACKET_SIZE => decode_cursor(bytes).map(Packet::Cursor),
            _ => None,
        }
    }

    /// Exact encoded size of this packet.
    pub fn wire_size(&self) -> usize {
        match self {
            Packet::Point(_) => POINT_PACKET_SIZE,
            Packet::Cursor(_) => CURSOR_PACKET_SIZE,
        }
    }
}

fn decode_point(bytes: &[u8]) -> Option<PointPacket> {
    let (wire, read): (PointWire, usize) =
        bincode::serde::decode_from_slice(bytes, wire_config()).ok()?;
    if read != POINT_PACKET_SIZE || wire.tag != POINT_TAG {
        return None;
    }
    if !(wire.x.is_finite() && wire.y.is_finite() && wire.pressure.is_finite()) {
        return None;
    }
    Some(PointPacket {
        stroke_id: StrokeTag::from_bytes(wire.stroke_id),
        x: wire.x,
        y: wire.y,
        pressure: wire.pressure,
    })
}

fn decode_cursor(bytes: &[u8]) -> Option<CursorPacket> {
    let (wire, read): (CursorWire, usize) =
        bincode::serde::decode_from_slice(bytes, wire_config()).ok()?;
    if read != CURSOR_PACKET_SIZE || wire.tag != CURSOR_TAG {
        return None;
    }
    if !(wire.x.is_finite() && wire.y.is_finite()) {
        return None;
    }
    Some(CursorPacket {
        x: wire.x,
        y: wire.y,
        drawing: wire.drawing,
    })
}

// ───────────────────────────────────────────────────────────────────
// Batches
// ───────────────────────────────────────────────────────────────────

/// Encode several point packets behind a 2-byte little-endian count.
///
/// Coalescing hook; the live path sends single packets.
pub fn encode_batch(points: &[PointPacket]) -> Result<Vec<u8>, CodecError> {
    let count = u16::try_from(points.len()).map_err(|_| CodecError::BatchTooLarge(points.len()))?;

    let mut buf = Vec::with_capacity(BATCH_HEADER_SIZE + points.len() * POINT_PACKET_SIZE);
    buf.extend_from_slice(&count.to_le_bytes());
    for point in points {
        buf.extend_from_slice(&Packet::Point(*point).encode()?);
    }
    Ok(buf)
}

/// Decode a batch produced by [`encode_batch`].
///
/// The whole batch is rejected if its length disagrees with the count or
/// any member fails to decode as a point.
pub fn decode_batch(bytes: &[u8]) -> Option<Vec<PointPacket>> {
    let header: [u8; BATCH_HEADER_SIZE] = bytes.get(..BATCH_HEADER_SIZE)?.try_into().ok()?;
    let count = u16::from_le_bytes(header) as usize;
    let body = &bytes[BATCH_HEADER_SIZE..];
    if body.len() != count * POINT_PACKET_SIZE {
        return None;
    }

    body.chunks_exact(POINT_PACKET_SIZE)
        .map(decode_point)
        .collect()
}

/// Codec errors. Only the encode side can fail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("encoded size {actual} does not match wire size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("batch of {0} points exceeds the u16 count prefix")]
    BatchTooLarge(usize),
}
