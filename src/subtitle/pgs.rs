//! PGS (Presentation Graphic Stream) packet assembly.
//!
//! The renderer consumes a `.sup`-style byte stream: a sequence of packets,
//! each a 13-byte header (`PG`, pts90k, dts90k, segment type, segment
//! length) followed by the segment payload. Matroska blocks either carry
//! ready-made packets (leading `PG`) or bare `(type, length, payload)`
//! segment tuples that need a synthesized header stamping the block's
//! timestamp.

use bytes::{BufMut, BytesMut};

/// Magic opening every PG packet header.
pub const PG_MAGIC: [u8; 2] = [0x50, 0x47];

/// 90 kHz ticks for a microsecond timestamp.
pub fn pts_90k(timestamp_us: i64) -> u32 {
  ((timestamp_us as f64) * 90_000.0 / 1_000_000.0).round() as u32
}

/// Append one PG packet: 13-byte header plus segment payload.
pub fn write_packet(out: &mut BytesMut, pts: u32, segment_type: u8, payload: &[u8]) {
  out.reserve(13 + payload.len());
  out.put_slice(&PG_MAGIC);
  out.put_u32(pts);
  out.put_u32(0); // dts: unused by PGS presentation
  out.put_u8(segment_type);
  out.put_u16(payload.len() as u16);
  out.put_slice(payload);
}

/// Append a Matroska PGS block to the output stream.
///
/// A payload already starting with `PG` is a `.sup` packet sequence and is
/// passed through untouched; otherwise each bare `(segment_type,
/// segment_length, payload)` tuple is repacked behind a synthesized header
/// carrying `timestamp_us` as its 90 kHz PTS.
pub fn append_block(out: &mut BytesMut, block: &[u8], timestamp_us: i64) {
  if block.len() >= 2 && block[0..2] == PG_MAGIC {
    out.put_slice(block);
    return;
  }

  let pts = pts_90k(timestamp_us);
  let mut i = 0;
  while i + 3 <= block.len() {
    let segment_type = block[i];
    let length = u16::from_be_bytes([block[i + 1], block[i + 2]]) as usize;
    let start = i + 3;
    let end = (start + length).min(block.len());
    write_packet(out, pts, segment_type, &block[start..end]);
    i = start + length;
  }
}
