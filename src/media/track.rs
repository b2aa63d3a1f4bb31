//! Per-track immutable metadata produced once per open().

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
  Video,
  Audio,
  Subtitle,
}

/// Subtitle payload format, as far as cue pre-processing cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtitleFormat {
  /// Plain UTF-8 text blocks (`S_TEXT/UTF8`).
  PlainText,
  /// ASS/SSA dialogue lines; carries the `Format:` event columns from the
  /// codec-private section so block text can be projected onto `Text`.
  Ass { format_columns: Vec<String> },
  /// Blu-ray presentation graphics (`S_HDMV/PGS`).
  Pgs,
}

/// Immutable description of one container track, normalized across the three
/// demuxers and consumed by decoder configuration.
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
  /// Container-scoped track id (MP4 track id, MKV track number, TS PID).
  pub id: u64,
  pub kind: TrackKind,
  /// WebCodecs-convention codec string (`avc1.*`, `hvc1.*`, `mp4a.40.*`, …).
  pub codec: String,
  /// Codec-private description bytes when the codec requires them
  /// (avcC, hvcC, AudioSpecificConfig, …).
  pub description: Option<Bytes>,
  /// Video only.
  pub width: Option<u32>,
  pub height: Option<u32>,
  /// Audio only.
  pub sample_rate: Option<u32>,
  pub channels: Option<u32>,
  /// Default frame duration when the container declares one.
  pub default_duration_us: Option<i64>,
  pub language: Option<String>,
  pub name: Option<String>,
  /// Present for subtitle tracks.
  pub subtitle_format: Option<SubtitleFormat>,
}

impl TrackDescriptor {
  pub fn new(id: u64, kind: TrackKind, codec: impl Into<String>) -> Self {
    Self {
      id,
      kind,
      codec: codec.into(),
      description: None,
      width: None,
      height: None,
      sample_rate: None,
      channels: None,
      default_duration_us: None,
      language: None,
      name: None,
      subtitle_format: None,
    }
  }
}
