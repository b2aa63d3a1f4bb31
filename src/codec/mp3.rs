//! MPEG audio (MP3) frame header parsing.

/// MPEG version from the header's version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
  Mpeg1,
  Mpeg2,
  Mpeg25,
}

/// Parsed Layer-III frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp3Header {
  pub version: MpegVersion,
  pub sample_rate: u32,
  pub bitrate_kbps: u32,
  pub padding: bool,
  /// Whole frame length in bytes.
  pub frame_length: usize,
  /// 1152 for MPEG-1, 576 for MPEG-2/2.5.
  pub samples_per_frame: u32,
  /// 1 for single-channel mode, otherwise 2.
  pub channels: u32,
}

// Layer III bitrate tables, kbps, index 0 = free format (rejected).
const BITRATES_V1_L3: [u32; 16] =
  [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0];
const BITRATES_V2_L3: [u32; 16] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0];

const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];
const SAMPLE_RATES_V2: [u32; 3] = [22_050, 24_000, 16_000];
const SAMPLE_RATES_V25: [u32; 3] = [11_025, 12_000, 8_000];

/// Parse an MPEG audio header at the start of `data`.
///
/// Only Layer III is accepted. `frame_length` is
/// `floor(coef * kbps * 1000 / sample_rate) + padding` with coef 144 for
/// MPEG-1 and 72 for MPEG-2/2.5.
pub fn parse_mp3_header(data: &[u8]) -> Option<Mp3Header> {
  if data.len() < 4 {
    return None;
  }
  // 11-bit syncword
  if data[0] != 0xFF || (data[1] & 0xE0) != 0xE0 {
    return None;
  }

  let version = match (data[1] >> 3) & 0x03 {
    0b00 => MpegVersion::Mpeg25,
    0b10 => MpegVersion::Mpeg2,
    0b11 => MpegVersion::Mpeg1,
    _ => return None, // reserved
  };
  // layer must be III (0b01)
  if (data[1] >> 1) & 0x03 != 0b01 {
    return None;
  }

  let bitrate_index = (data[2] >> 4) & 0x0F;
  let sample_rate_index = (data[2] >> 2) & 0x03;
  if sample_rate_index == 0b11 {
    return None;
  }
  let padding = (data[2] >> 1) & 0x01 == 1;

  let bitrate_kbps = match version {
    MpegVersion::Mpeg1 => BITRATES_V1_L3[bitrate_index as usize],
    _ => BITRATES_V2_L3[bitrate_index as usize],
  };
  if bitrate_kbps == 0 {
    return None;
  }
  let sample_rate = match version {
    MpegVersion::Mpeg1 => SAMPLE_RATES_V1[sample_rate_index as usize],
    MpegVersion::Mpeg2 => SAMPLE_RATES_V2[sample_rate_index as usize],
    MpegVersion::Mpeg25 => SAMPLE_RATES_V25[sample_rate_index as usize],
  };

  let (coef, samples_per_frame) = match version {
    MpegVersion::Mpeg1 => (144u64, 1152),
    _ => (72u64, 576),
  };
  let frame_length =
    (coef * bitrate_kbps as u64 * 1000 / sample_rate as u64) as usize + padding as usize;
  let channels = if (data[3] >> 6) & 0x03 == 0b11 { 1 } else { 2 };

  Some(Mp3Header {
    version,
    sample_rate,
    bitrate_kbps,
    padding,
    frame_length,
    samples_per_frame,
    channels,
  })
}
