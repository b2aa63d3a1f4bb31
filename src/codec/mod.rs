//! Codec-string construction and bitstream helpers.
//!
//! Codec strings follow the WebCodecs registry conventions (`avc1.PPCCLL`,
//! `hvc1.*`, `vp09.*`, `av01.*`, `mp4a.40.*`); the demuxers attach the
//! codec-private description bytes whenever the codec requires them.

pub mod aac;
pub mod avc;
pub mod hevc;
pub mod mp3;

/// Default VP9 codec string: profile 0, level 1.0, 8-bit.
pub const VP9_DEFAULT: &str = "vp09.00.10.08";

/// Build a VP9 codec string from Matroska `CodecPrivate` feature data.
///
/// The private data is a sequence of `(id, length, value…)` features
/// (1 = profile, 2 = level, 3 = bit depth, 4 = chroma subsampling). Missing
/// features fall back to the [`VP9_DEFAULT`] components.
pub fn vp9_codec_string(private: Option<&[u8]>) -> String {
  let mut profile = 0u8;
  let mut level = 10u8;
  let mut bit_depth = 8u8;
  let mut chroma: Option<u8> = None;

  if let Some(data) = private {
    let mut i = 0;
    while i + 2 <= data.len() {
      let id = data[i];
      let len = data[i + 1] as usize;
      if i + 2 + len > data.len() {
        break;
      }
      if len == 1 {
        let value = data[i + 2];
        match id {
          1 => profile = value,
          2 => level = value,
          3 => bit_depth = value,
          4 => chroma = Some(value),
          _ => {}
        }
      }
      i += 2 + len;
    }
  }

  match chroma {
    Some(c) => format!("vp09.{:02}.{:02}.{:02}.{:02}", profile, level, bit_depth, c),
    None => format!("vp09.{:02}.{:02}.{:02}", profile, level, bit_depth),
  }
}

/// Build an AV1 codec string from the first bytes of an
/// AV1CodecConfigurationRecord (`av1C`).
///
/// Layout: byte 0 is marker/version (0x81), byte 1 packs
/// `seq_profile (3) | seq_level_idx_0 (5)`, byte 2 packs
/// `seq_tier_0 (1) | high_bitdepth (1) | twelve_bit (1) | …`.
pub fn av1_codec_string(av1c: &[u8]) -> Option<String> {
  if av1c.len() < 3 || av1c[0] != 0x81 {
    return None;
  }
  let profile = av1c[1] >> 5;
  let level = av1c[1] & 0x1F;
  let tier = if av1c[2] >> 7 == 1 { 'H' } else { 'M' };
  let high_bitdepth = (av1c[2] >> 6) & 1 == 1;
  let twelve_bit = (av1c[2] >> 5) & 1 == 1;
  let bit_depth = if high_bitdepth {
    if twelve_bit {
      12
    } else {
      10
    }
  } else {
    8
  };
  Some(format!("av01.{}.{:02}{}.{:02}", profile, level, tier, bit_depth))
}

/// Channel count from an `OpusHead` identification header, when present.
pub fn opus_head_channels(private: &[u8]) -> Option<u32> {
  if private.len() >= 10 && &private[0..8] == b"OpusHead" {
    Some(private[9] as u32)
  } else {
    None
  }
}

/// Opus output is always clocked at 48 kHz regardless of the input rate.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;
