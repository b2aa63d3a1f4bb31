//! HEVC codec-string construction and access-unit helpers.

use crate::codec::avc::annexb_nal_ranges;

/// True when the Annex-B access unit contains an IRAP picture
/// (HEVC NAL types 16-21: BLA/IDR/CRA).
pub fn annexb_contains_irap(data: &[u8]) -> bool {
  annexb_nal_ranges(data).iter().any(|&(start, _)| {
    let nal_type = (data[start] >> 1) & 0x3F;
    (16..=21).contains(&nal_type)
  })
}

/// Build the `hvc1.*` codec string from an hvcC record.
///
/// Record layout (ISO/IEC 14496-15 §8.3.3.1): byte 1 packs
/// `general_profile_space (2) | general_tier_flag (1) | general_profile_idc (5)`,
/// bytes 2-5 are the 32 profile-compatibility flag bits, bytes 6-11 the
/// constraint indicator flags, byte 12 `general_level_idc`.
///
/// String form: `hvc1.{space}{profile}.{compat-hex}.{L|H}{level}.{constraint-hex}`
/// with the compatibility word bit-reversed per RFC 6381 convention and
/// trailing zero constraint bytes trimmed.
pub fn codec_string_from_hvcc(hvcc: &[u8]) -> Option<String> {
  if hvcc.len() < 13 || hvcc[0] != 1 {
    return None;
  }

  let profile_space = (hvcc[1] >> 6) & 0x03;
  let tier_flag = (hvcc[1] >> 5) & 0x01;
  let profile_idc = hvcc[1] & 0x1F;
  let compat = u32::from_be_bytes([hvcc[2], hvcc[3], hvcc[4], hvcc[5]]);
  let level_idc = hvcc[12];

  let space = match profile_space {
    1 => "A",
    2 => "B",
    3 => "C",
    _ => "",
  };
  let tier = if tier_flag == 1 { 'H' } else { 'L' };

  let mut constraints = &hvcc[6..12];
  while let Some((&0, rest)) = constraints.split_last() {
    constraints = rest;
  }
  let constraint_part = if constraints.is_empty() {
    "0".to_string()
  } else {
    constraints
      .iter()
      .map(|b| format!("{:02X}", b))
      .collect::<Vec<_>>()
      .join(".")
  };

  Some(format!(
    "hvc1.{}{}.{:X}.{}{}.{}",
    space,
    profile_idc,
    compat.reverse_bits(),
    tier,
    level_idc,
    constraint_part
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hvcc(byte1: u8, compat: u32, constraints: [u8; 6], level: u8) -> Vec<u8> {
    let mut record = vec![1u8, byte1];
    record.extend_from_slice(&compat.to_be_bytes());
    record.extend_from_slice(&constraints);
    record.push(level);
    // Tail of the record is irrelevant for the string.
    record.extend_from_slice(&[0xF0, 0x00, 0xFC, 0xFD, 0xF8, 0xF8, 0x00, 0x00, 0x0F, 0x00]);
    record
  }

  #[test]
  fn main_profile_string() {
    // profile_space 0, tier L, profile_idc 1, compat bit for Main,
    // constraint byte 0x90, level 93 (3.1).
    let record = hvcc(0x01, 0x60000000, [0x90, 0, 0, 0, 0, 0], 93);
    assert_eq!(
      codec_string_from_hvcc(&record).as_deref(),
      Some("hvc1.1.6.L93.90")
    );
  }

  #[test]
  fn high_tier_main10() {
    let record = hvcc(0x22, 0x40000000, [0x90, 0, 0, 0, 0, 0], 120);
    assert_eq!(
      codec_string_from_hvcc(&record).as_deref(),
      Some("hvc1.2.2.H120.90")
    );
  }

  #[test]
  fn irap_detection() {
    // IDR_W_RADL (type 19): first NAL byte 19 << 1 = 0x26.
    let idr = [0u8, 0, 0, 1, 0x26, 0x01, 0xAA];
    // TRAIL_R (type 1): first NAL byte 1 << 1 = 0x02.
    let trail = [0u8, 0, 0, 1, 0x02, 0x01, 0xAA];
    assert!(annexb_contains_irap(&idr));
    assert!(!annexb_contains_irap(&trail));
  }

  #[test]
  fn rejects_short_or_versioned_data() {
    assert_eq!(codec_string_from_hvcc(&[1, 2, 3]), None);
    let mut record = hvcc(0x01, 0x60000000, [0x90, 0, 0, 0, 0, 0], 93);
    record[0] = 2;
    assert_eq!(codec_string_from_hvcc(&record), None);
  }
}
