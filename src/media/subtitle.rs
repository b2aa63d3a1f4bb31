//! Subtitle cues forwarded to the renderer.

use bytes::Bytes;

/// One subtitle cue. The two variants share no metadata on purpose: text
/// cues are timestamped here, PGS streams are timestamped internally by
/// their 90 kHz packet headers.
#[derive(Debug, Clone, PartialEq)]
pub enum SubtitleCue {
  Text {
    start_us: i64,
    end_us: i64,
    /// Raw `Text` column for ASS/SSA lines; override tags (`{\...}`) are the
    /// renderer's business.
    text: String,
  },
  Pgs {
    /// Self-contained sequence of PG packets (13-byte header + segment).
    data: Bytes,
  },
}
