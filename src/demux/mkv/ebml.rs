//! Streaming EBML primitives over a [`ByteSource`].
//!
//! [`EbmlReader`] pulls windows of the source on demand and decodes VINTs
//! and element headers; [`SliceReader`] walks the children of an
//! already-fetched master element body.

use bytes::Bytes;

use crate::error::{MediaError, Result};
use crate::source::SharedByteSource;

/// Sentinel for an element of unknown size (all VINT value bits set).
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Window size pulled from the source per refill.
const READ_CHUNK: u64 = 64 * 1024;

/// One decoded element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
  pub id: u32,
  /// Payload size, or [`UNKNOWN_SIZE`].
  pub size: u64,
  /// Absolute offset of the first header byte.
  pub header_start: u64,
  /// Absolute offset of the first payload byte.
  pub data_start: u64,
}

impl ElementHeader {
  /// Absolute end of the payload; `stream_end` substitutes for unknown
  /// sizes.
  pub fn data_end(&self, stream_end: u64) -> u64 {
    if self.size == UNKNOWN_SIZE {
      stream_end
    } else {
      self.data_start + self.size
    }
  }
}

/// Pulling, buffered EBML reader.
pub struct EbmlReader {
  source: SharedByteSource,
  pos: u64,
  end: u64,
  buf: Bytes,
  buf_start: u64,
}

impl EbmlReader {
  pub fn new(source: SharedByteSource) -> Self {
    let end = source.len();
    Self {
      source,
      pos: 0,
      end,
      buf: Bytes::new(),
      buf_start: 0,
    }
  }

  pub fn position(&self) -> u64 {
    self.pos
  }

  pub fn stream_end(&self) -> u64 {
    self.end
  }

  pub fn remaining(&self) -> u64 {
    self.end.saturating_sub(self.pos)
  }

  pub fn seek(&mut self, pos: u64) {
    self.pos = pos.min(self.end);
  }

  pub fn skip(&mut self, n: u64) {
    self.pos = (self.pos + n).min(self.end);
  }

  fn buffered(&self) -> usize {
    let buf_end = self.buf_start + self.buf.len() as u64;
    if self.pos < self.buf_start || self.pos >= buf_end {
      0
    } else {
      (buf_end - self.pos) as usize
    }
  }

  /// Make at least `n` bytes available at the current position.
  async fn ensure(&mut self, n: usize) -> Result<()> {
    if self.buffered() >= n {
      return Ok(());
    }
    if self.pos + n as u64 > self.end {
      return Err(MediaError::format("unexpected end of EBML stream"));
    }
    let fetch_end = (self.pos + (n as u64).max(READ_CHUNK)).min(self.end);
    self.buf = self.source.slice(self.pos, fetch_end).await?;
    self.buf_start = self.pos;
    if (self.buf.len() as u64) < n as u64 {
      return Err(MediaError::format("short read from byte source"));
    }
    Ok(())
  }

  fn take(&mut self, n: usize) -> Bytes {
    let off = (self.pos - self.buf_start) as usize;
    let out = self.buf.slice(off..off + n);
    self.pos += n as u64;
    out
  }

  /// Read `n` bytes at the current position.
  pub async fn read_bytes(&mut self, n: u64) -> Result<Bytes> {
    if self.end.saturating_sub(self.pos) < n {
      return Err(MediaError::format("unexpected end of EBML stream"));
    }
    if n <= READ_CHUNK && self.buffered() as u64 >= n {
      return Ok(self.take(n as usize));
    }
    // Large or unbuffered payload: slice the source directly.
    let data = self.source.slice(self.pos, self.pos + n).await?;
    if (data.len() as u64) < n {
      return Err(MediaError::format("short read from byte source"));
    }
    self.pos += n;
    Ok(data)
  }

  /// Decode an element ID (marker bits kept, 1-4 bytes).
  pub async fn read_id(&mut self) -> Result<u32> {
    self.ensure(1).await?;
    let off = (self.pos - self.buf_start) as usize;
    let first = self.buf[off];
    let len = first.leading_zeros() as usize + 1;
    if len > 4 {
      return Err(MediaError::format(format!("invalid EBML ID byte {first:#04x}")));
    }
    self.ensure(len).await?;
    let raw = self.take(len);
    let mut id = 0u32;
    for b in raw.iter() {
      id = (id << 8) | *b as u32;
    }
    Ok(id)
  }

  /// Decode an element size VINT (marker bits stripped, 1-8 bytes).
  /// All value bits set means "unknown size" and maps to [`UNKNOWN_SIZE`].
  pub async fn read_size(&mut self) -> Result<u64> {
    self.ensure(1).await?;
    let off = (self.pos - self.buf_start) as usize;
    let first = self.buf[off];
    let len = first.leading_zeros() as usize + 1;
    if len > 8 {
      return Err(MediaError::format(format!("invalid EBML size byte {first:#04x}")));
    }
    self.ensure(len).await?;
    let raw = self.take(len);
    let mut value = (raw[0] & (0xFF >> len)) as u64;
    for b in raw.iter().skip(1) {
      value = (value << 8) | *b as u64;
    }
    let all_ones = (1u64 << (7 * len)) - 1;
    Ok(if value == all_ones { UNKNOWN_SIZE } else { value })
  }

  /// Read the next element header, or None at `limit`.
  pub async fn next_element(&mut self, limit: u64) -> Result<Option<ElementHeader>> {
    if self.pos >= limit.min(self.end) {
      return Ok(None);
    }
    let header_start = self.pos;
    let id = self.read_id().await?;
    let size = self.read_size().await?;
    Ok(Some(ElementHeader {
      id,
      size,
      header_start,
      data_start: self.pos,
    }))
  }
}

/// Decode a VINT from a byte slice. Returns `(value, length)` with marker
/// bits stripped.
pub fn parse_vint(data: &[u8]) -> Option<(u64, usize)> {
  let first = *data.first()?;
  let len = first.leading_zeros() as usize + 1;
  if len > 8 || data.len() < len {
    return None;
  }
  let mut value = (first & (0xFF >> len)) as u64;
  for b in &data[1..len] {
    value = (value << 8) | *b as u64;
  }
  Some((value, len))
}

/// Decode a signed (laced-size style) VINT: an unsigned VINT minus its bias
/// `2^(7*len-1) - 1`.
pub fn parse_svint(data: &[u8]) -> Option<(i64, usize)> {
  let (value, len) = parse_vint(data)?;
  let bias = (1i64 << (7 * len - 1)) - 1;
  Some((value as i64 - bias, len))
}

/// Big-endian unsigned integer from an element body (up to 8 bytes).
pub fn parse_uint(data: &[u8]) -> u64 {
  data.iter().take(8).fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// IEEE float from an element body (4 or 8 bytes; 0.0 otherwise).
pub fn parse_float(data: &[u8]) -> f64 {
  match data.len() {
    4 => f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64,
    8 => f64::from_be_bytes([
      data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]),
    _ => 0.0,
  }
}

/// Walks the children of a fetched master-element body.
pub struct SliceReader<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> SliceReader<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    Self { data, pos: 0 }
  }

  /// Next `(id, body)` child, or None at the end. Children of a bounded
  /// master element always carry known sizes.
  pub fn next_child(&mut self) -> Result<Option<(u32, &'a [u8])>> {
    if self.pos >= self.data.len() {
      return Ok(None);
    }
    let rest = &self.data[self.pos..];
    let first = rest[0];
    let id_len = first.leading_zeros() as usize + 1;
    if id_len > 4 || rest.len() < id_len {
      return Err(MediaError::format("truncated EBML child ID"));
    }
    let mut id = 0u32;
    for b in &rest[..id_len] {
      id = (id << 8) | *b as u32;
    }
    let (size, size_len) = parse_vint(&rest[id_len..])
      .ok_or_else(|| MediaError::format("truncated EBML child size"))?;
    let body_start = self.pos + id_len + size_len;
    let body_end = body_start + size as usize;
    if size == UNKNOWN_SIZE || body_end > self.data.len() {
      return Err(MediaError::format("EBML child overruns parent"));
    }
    self.pos = body_end;
    Ok(Some((id, &self.data[body_start..body_end])))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::MemoryByteSource;
  use std::sync::Arc;

  #[test]
  fn vint_lengths_and_values() {
    assert_eq!(parse_vint(&[0x81]), Some((1, 1)));
    assert_eq!(parse_vint(&[0x40, 0x02]), Some((2, 2)));
    assert_eq!(parse_vint(&[0x21, 0x23, 0x45]), Some((0x12345, 3)));
    // Marker byte alone of a longer VINT
    assert_eq!(parse_vint(&[0x40]), None);
  }

  #[test]
  fn signed_vint_bias() {
    // 1-byte svint: bias 63. 0x80 encodes -63, 0xBF encodes 0, 0xFF... is
    // reserved-unknown for sizes but plain arithmetic here.
    assert_eq!(parse_svint(&[0x80]), Some((-63, 1)));
    assert_eq!(parse_svint(&[0xBF]), Some((0, 1)));
    assert_eq!(parse_svint(&[0xC1]), Some((2, 1)));
  }

  #[tokio::test]
  async fn reader_decodes_ids_sizes_and_unknown() {
    // EBML ID 0x1A45DFA3, size 0 | ID 0xE7 size 1 payload 0x2A |
    // ID 0x18538067 with unknown 1-byte size (0xFF).
    let data = vec![
      0x1A, 0x45, 0xDF, 0xA3, 0x80, 0xE7, 0x81, 0x2A, 0x18, 0x53, 0x80, 0x67, 0xFF,
    ];
    let source = Arc::new(MemoryByteSource::new(data));
    let mut reader = EbmlReader::new(source);

    let first = reader.next_element(u64::MAX).await.unwrap().unwrap();
    assert_eq!(first.id, 0x1A45DFA3);
    assert_eq!(first.size, 0);

    let second = reader.next_element(u64::MAX).await.unwrap().unwrap();
    assert_eq!(second.id, 0xE7);
    assert_eq!(second.size, 1);
    let body = reader.read_bytes(1).await.unwrap();
    assert_eq!(parse_uint(&body), 42);

    let third = reader.next_element(u64::MAX).await.unwrap().unwrap();
    assert_eq!(third.id, 0x18538067);
    assert_eq!(third.size, UNKNOWN_SIZE);
    assert_eq!(third.data_end(reader.stream_end()), 13);
  }

  #[test]
  fn slice_reader_walks_children() {
    // Two children: (0xD7, [0x01]) and (0x86, b"V_VP9").
    let mut body = vec![0xD7, 0x81, 0x01];
    body.extend_from_slice(&[0x86, 0x85]);
    body.extend_from_slice(b"V_VP9");

    let mut reader = SliceReader::new(&body);
    let (id, payload) = reader.next_child().unwrap().unwrap();
    assert_eq!(id, 0xD7);
    assert_eq!(parse_uint(payload), 1);
    let (id, payload) = reader.next_child().unwrap().unwrap();
    assert_eq!(id, 0x86);
    assert_eq!(payload, b"V_VP9");
    assert!(reader.next_child().unwrap().is_none());
  }

  #[test]
  fn uint_and_float_bodies() {
    assert_eq!(parse_uint(&[0x0F, 0x42, 0x40]), 1_000_000);
    assert_eq!(parse_float(&1.5f64.to_be_bytes()), 1.5);
    assert_eq!(parse_float(&2.5f32.to_be_bytes()), 2.5);
  }
}
