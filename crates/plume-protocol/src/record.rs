//! Command-log record format.
//!
//! Records are tagged and self-delimiting: a `u16` tag followed by a fixed
//! per-tag field layout (variable-size payloads carry explicit byte counts).
//! Everything is little-endian. The stream layer frames each record with a
//! `u32` length prefix; this module defines the payload only.
//!
//! The tag space has two tiers: a small fixed transport tier (`0x00xx`) and
//! an extensible domain tier (`0x01xx` surface lifecycle, `0x02xx` draw
//! operations). An unknown tag is a protocol error that fails the whole
//! connection; the transport never skips or reorders records.

use crate::OwnerId;

/// One command-log record, in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Transport(TransportRecord),
    Surface(SurfaceRecord),
}

/// Transport-control tier: records the stream layer itself consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRecord {
    /// Final record of a data buffer; the consumer advances to the next
    /// buffer in rotation order.
    NextBuffer,

    /// Marks a drain target the producer can wait on.
    Checkpoint,

    /// Suspend translation until the matching out-of-band token is observed.
    AwaitToken { token: u64 },

    /// Park the consumer in the Paused state.
    Pause,
}

/// Surface lock intent, encoded in lock records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl LockMode {
    fn to_u8(self) -> u8 {
        match self {
            LockMode::ReadOnly => 0,
            LockMode::WriteOnly => 1,
            LockMode::ReadWrite => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, RecordDecodeError> {
        Ok(match v {
            0 => LockMode::ReadOnly,
            1 => LockMode::WriteOnly,
            2 => LockMode::ReadWrite,
            _ => return Err(RecordDecodeError::InvalidEnum),
        })
    }
}

/// Pixel layout of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    Bgra8,
    Rgba8,
}

impl SurfaceFormat {
    fn to_u8(self) -> u8 {
        match self {
            SurfaceFormat::Bgra8 => 0,
            SurfaceFormat::Rgba8 => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self, RecordDecodeError> {
        Ok(match v {
            0 => SurfaceFormat::Bgra8,
            1 => SurfaceFormat::Rgba8,
            _ => return Err(RecordDecodeError::InvalidEnum),
        })
    }
}

bitflags::bitflags! {
    /// How the consumer may use a surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SurfaceUsage: u8 {
        /// Surface may be presented to an output.
        const DISPLAY = 1 << 0;
        /// Surface contents may be read back into the readback region.
        const READBACK = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    pub usage: SurfaceUsage,
}

/// A drawing operation against a locked surface. Pixel payloads are not
/// inlined; `BlitPixels` carries an offset/length into the connection's
/// pixel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOp {
    FillRect {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        color: u32,
    },
    StrokeLine {
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        color: u32,
        thickness: u32,
    },
    BlitPixels {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        pixels_offset: u64,
        pixels_len: u32,
    },
}

/// Domain tier: surface lifecycle and drawing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceRecord {
    Create { owner: OwnerId, desc: SurfaceDesc },
    Lock { owner: OwnerId, mode: LockMode },
    Unlock { owner: OwnerId },
    Draw { owner: OwnerId, op: DrawOp },
    Present { owner: OwnerId, output: u32 },
    Destroy { owner: OwnerId },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordDecodeError {
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("invalid enum value")]
    InvalidEnum,
    #[error("unknown tag")]
    UnknownTag,
    #[error("record payload too large")]
    OversizedPayload,
    #[error("trailing bytes after record")]
    TrailingBytes,
}

/// Defensive maximum record size (bytes) for decode.
pub const MAX_RECORD_BYTES: usize = 1 << 20; // 1 MiB

const TAG_NEXT_BUFFER: u16 = 0x0000;
const TAG_CHECKPOINT: u16 = 0x0001;
const TAG_AWAIT_TOKEN: u16 = 0x0002;
const TAG_PAUSE: u16 = 0x0003;

const TAG_SURFACE_CREATE: u16 = 0x0100;
const TAG_SURFACE_LOCK: u16 = 0x0101;
const TAG_SURFACE_UNLOCK: u16 = 0x0102;
const TAG_SURFACE_PRESENT: u16 = 0x0103;
const TAG_SURFACE_DESTROY: u16 = 0x0104;

const TAG_DRAW_FILL_RECT: u16 = 0x0200;
const TAG_DRAW_STROKE_LINE: u16 = 0x0201;
const TAG_DRAW_BLIT_PIXELS: u16 = 0x0202;

pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut out = Vec::new();
    encode_record_into(record, &mut out);
    out
}

pub fn encode_record_into(record: &Record, out: &mut Vec<u8>) {
    match record {
        Record::Transport(t) => encode_transport(t, out),
        Record::Surface(s) => encode_surface(s, out),
    }
}

fn encode_transport(record: &TransportRecord, out: &mut Vec<u8>) {
    match record {
        TransportRecord::NextBuffer => {
            push_u16(out, TAG_NEXT_BUFFER);
        }
        TransportRecord::Checkpoint => {
            push_u16(out, TAG_CHECKPOINT);
        }
        TransportRecord::AwaitToken { token } => {
            push_u16(out, TAG_AWAIT_TOKEN);
            push_u64(out, *token);
        }
        TransportRecord::Pause => {
            push_u16(out, TAG_PAUSE);
        }
    }
}

fn encode_surface(record: &SurfaceRecord, out: &mut Vec<u8>) {
    match record {
        SurfaceRecord::Create { owner, desc } => {
            push_u16(out, TAG_SURFACE_CREATE);
            push_u32(out, *owner);
            push_u32(out, desc.width);
            push_u32(out, desc.height);
            out.push(desc.format.to_u8());
            out.push(desc.usage.bits());
        }
        SurfaceRecord::Lock { owner, mode } => {
            push_u16(out, TAG_SURFACE_LOCK);
            push_u32(out, *owner);
            out.push(mode.to_u8());
        }
        SurfaceRecord::Unlock { owner } => {
            push_u16(out, TAG_SURFACE_UNLOCK);
            push_u32(out, *owner);
        }
        SurfaceRecord::Present { owner, output } => {
            push_u16(out, TAG_SURFACE_PRESENT);
            push_u32(out, *owner);
            push_u32(out, *output);
        }
        SurfaceRecord::Destroy { owner } => {
            push_u16(out, TAG_SURFACE_DESTROY);
            push_u32(out, *owner);
        }
        SurfaceRecord::Draw { owner, op } => match op {
            DrawOp::FillRect {
                x,
                y,
                width,
                height,
                color,
            } => {
                push_u16(out, TAG_DRAW_FILL_RECT);
                push_u32(out, *owner);
                push_i32(out, *x);
                push_i32(out, *y);
                push_u32(out, *width);
                push_u32(out, *height);
                push_u32(out, *color);
            }
            DrawOp::StrokeLine {
                x0,
                y0,
                x1,
                y1,
                color,
                thickness,
            } => {
                push_u16(out, TAG_DRAW_STROKE_LINE);
                push_u32(out, *owner);
                push_i32(out, *x0);
                push_i32(out, *y0);
                push_i32(out, *x1);
                push_i32(out, *y1);
                push_u32(out, *color);
                push_u32(out, *thickness);
            }
            DrawOp::BlitPixels {
                x,
                y,
                width,
                height,
                pixels_offset,
                pixels_len,
            } => {
                push_u16(out, TAG_DRAW_BLIT_PIXELS);
                push_u32(out, *owner);
                push_i32(out, *x);
                push_i32(out, *y);
                push_u32(out, *width);
                push_u32(out, *height);
                push_u64(out, *pixels_offset);
                push_u32(out, *pixels_len);
            }
        },
    }
}

pub fn decode_record(bytes: &[u8]) -> Result<Record, RecordDecodeError> {
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(RecordDecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let tag = r.read_u16()?;
    let record = match tag {
        TAG_NEXT_BUFFER => Record::Transport(TransportRecord::NextBuffer),
        TAG_CHECKPOINT => Record::Transport(TransportRecord::Checkpoint),
        TAG_AWAIT_TOKEN => Record::Transport(TransportRecord::AwaitToken {
            token: r.read_u64()?,
        }),
        TAG_PAUSE => Record::Transport(TransportRecord::Pause),
        TAG_SURFACE_CREATE => {
            let owner = r.read_u32()?;
            let width = r.read_u32()?;
            let height = r.read_u32()?;
            let format = SurfaceFormat::from_u8(r.read_u8()?)?;
            let usage = SurfaceUsage::from_bits(r.read_u8()?)
                .ok_or(RecordDecodeError::InvalidEnum)?;
            Record::Surface(SurfaceRecord::Create {
                owner,
                desc: SurfaceDesc {
                    width,
                    height,
                    format,
                    usage,
                },
            })
        }
        TAG_SURFACE_LOCK => {
            let owner = r.read_u32()?;
            let mode = LockMode::from_u8(r.read_u8()?)?;
            Record::Surface(SurfaceRecord::Lock { owner, mode })
        }
        TAG_SURFACE_UNLOCK => Record::Surface(SurfaceRecord::Unlock {
            owner: r.read_u32()?,
        }),
        TAG_SURFACE_PRESENT => {
            let owner = r.read_u32()?;
            let output = r.read_u32()?;
            Record::Surface(SurfaceRecord::Present { owner, output })
        }
        TAG_SURFACE_DESTROY => Record::Surface(SurfaceRecord::Destroy {
            owner: r.read_u32()?,
        }),
        TAG_DRAW_FILL_RECT => {
            let owner = r.read_u32()?;
            Record::Surface(SurfaceRecord::Draw {
                owner,
                op: DrawOp::FillRect {
                    x: r.read_i32()?,
                    y: r.read_i32()?,
                    width: r.read_u32()?,
                    height: r.read_u32()?,
                    color: r.read_u32()?,
                },
            })
        }
        TAG_DRAW_STROKE_LINE => {
            let owner = r.read_u32()?;
            Record::Surface(SurfaceRecord::Draw {
                owner,
                op: DrawOp::StrokeLine {
                    x0: r.read_i32()?,
                    y0: r.read_i32()?,
                    x1: r.read_i32()?,
                    y1: r.read_i32()?,
                    color: r.read_u32()?,
                    thickness: r.read_u32()?,
                },
            })
        }
        TAG_DRAW_BLIT_PIXELS => {
            let owner = r.read_u32()?;
            Record::Surface(SurfaceRecord::Draw {
                owner,
                op: DrawOp::BlitPixels {
                    x: r.read_i32()?,
                    y: r.read_i32()?,
                    width: r.read_u32()?,
                    height: r.read_u32()?,
                    pixels_offset: r.read_u64()?,
                    pixels_len: r.read_u32()?,
                },
            })
        }
        _ => return Err(RecordDecodeError::UnknownTag),
    };
    if r.remaining() != 0 {
        return Err(RecordDecodeError::TrailingBytes);
    }
    Ok(record)
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, RecordDecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(RecordDecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, RecordDecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, RecordDecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, RecordDecodeError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64, RecordDecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], RecordDecodeError> {
        if self.remaining() < len {
            return Err(RecordDecodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_records_round_trip() {
        for record in [
            Record::Transport(TransportRecord::NextBuffer),
            Record::Transport(TransportRecord::Checkpoint),
            Record::Transport(TransportRecord::AwaitToken { token: 42 }),
            Record::Transport(TransportRecord::Pause),
        ] {
            let bytes = encode_record(&record);
            assert_eq!(decode_record(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn surface_create_round_trips() {
        let record = Record::Surface(SurfaceRecord::Create {
            owner: 7,
            desc: SurfaceDesc {
                width: 64,
                height: 64,
                format: SurfaceFormat::Bgra8,
                usage: SurfaceUsage::DISPLAY | SurfaceUsage::READBACK,
            },
        });
        let bytes = encode_record(&record);
        assert_eq!(decode_record(&bytes).unwrap(), record);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = Vec::new();
        push_u16(&mut bytes, 0x7fff);
        assert_eq!(decode_record(&bytes), Err(RecordDecodeError::UnknownTag));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_record(&Record::Transport(TransportRecord::Pause));
        bytes.push(0);
        assert_eq!(decode_record(&bytes), Err(RecordDecodeError::TrailingBytes));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = encode_record(&Record::Surface(SurfaceRecord::Present {
            owner: 1,
            output: 2,
        }));
        assert_eq!(
            decode_record(&bytes[..bytes.len() - 1]),
            Err(RecordDecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn invalid_lock_mode_is_rejected() {
        let mut bytes = Vec::new();
        push_u16(&mut bytes, 0x0101);
        push_u32(&mut bytes, 7);
        bytes.push(9);
        assert_eq!(decode_record(&bytes), Err(RecordDecodeError::InvalidEnum));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let bytes = vec![0u8; MAX_RECORD_BYTES + 1];
        assert_eq!(
            decode_record(&bytes),
            Err(RecordDecodeError::OversizedPayload)
        );
    }
}
