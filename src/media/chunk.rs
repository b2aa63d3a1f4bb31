//! Encoded access units flowing from demuxer to decoder.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
  /// Keyframe - can be decoded independently.
  Key,
  /// Delta frame - depends on previous frames.
  Delta,
}

/// One video access unit.
///
/// For every chunk except a track's last, `duration_us` is the gap to the
/// next chunk's timestamp; the final chunk carries 0 and is still emitted.
#[derive(Debug, Clone)]
pub struct EncodedVideoChunk {
  pub kind: ChunkKind,
  pub timestamp_us: i64,
  pub duration_us: i64,
  pub data: Bytes,
}

/// One audio frame. Audio chunks are always key; a `duration_us` of 0 means
/// the decoder derives duration from the frame contents.
#[derive(Debug, Clone)]
pub struct EncodedAudioChunk {
  pub timestamp_us: i64,
  pub duration_us: i64,
  pub data: Bytes,
}
