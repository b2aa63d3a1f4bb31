//! H.264/AVC bitstream helpers.
//!
//! Annex-B NAL iteration, Annex-B to AVCC conversion (start codes replaced
//! by 4-byte big-endian lengths), SPS/PPS harvesting, and
//! AVCDecoderConfigurationRecord synthesis.

/// NAL unit type for an IDR slice.
pub const NAL_IDR: u8 = 5;
/// NAL unit type for a sequence parameter set.
pub const NAL_SPS: u8 = 7;
/// NAL unit type for a picture parameter set.
pub const NAL_PPS: u8 = 8;

/// H.264 NAL type from the first NAL byte.
#[inline]
pub fn nal_type(first_byte: u8) -> u8 {
  first_byte & 0x1F
}

/// Iterate the NAL unit payload ranges of an Annex-B stream.
///
/// Yields `(start, end)` byte offsets, excluding start codes. Handles both
/// 3-byte and 4-byte start codes.
pub fn annexb_nal_ranges(data: &[u8]) -> Vec<(usize, usize)> {
  let mut starts = Vec::new();
  let mut i = 0;
  while i + 3 <= data.len() {
    if data[i] == 0 && data[i + 1] == 0 {
      if data[i + 2] == 1 {
        starts.push(i + 3);
        i += 3;
        continue;
      }
      if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
        starts.push(i + 4);
        i += 4;
        continue;
      }
    }
    i += 1;
  }

  let mut ranges = Vec::with_capacity(starts.len());
  for (idx, &start) in starts.iter().enumerate() {
    let end = if idx + 1 < starts.len() {
      let next = starts[idx + 1];
      // The start code before `next` is 3 or 4 bytes long.
      if next >= 4 && data[next - 4] == 0 && data[next - 3] == 0 {
        next - 4
      } else {
        next - 3
      }
    } else {
      data.len()
    };
    if start < end {
      ranges.push((start, end));
    }
  }
  ranges
}

/// Convert an Annex-B access unit to AVCC framing: each start code becomes a
/// 4-byte big-endian length prefix.
///
/// Data without any start code is returned unchanged (it may already be
/// AVCC).
pub fn annexb_to_avcc(data: &[u8]) -> Vec<u8> {
  let ranges = annexb_nal_ranges(data);
  if ranges.is_empty() {
    return data.to_vec();
  }

  let total: usize = ranges.iter().map(|(s, e)| 4 + (e - s)).sum();
  let mut out = Vec::with_capacity(total);
  for (start, end) in ranges {
    let len = (end - start) as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&data[start..end]);
  }
  out
}

/// True when any NAL unit in the Annex-B stream is an IDR slice.
pub fn annexb_contains_idr(data: &[u8]) -> bool {
  annexb_nal_ranges(data)
    .iter()
    .any(|&(start, _)| nal_type(data[start]) == NAL_IDR)
}

/// First SPS and PPS NAL units of an Annex-B stream.
pub fn find_sps_pps(data: &[u8]) -> (Option<&[u8]>, Option<&[u8]>) {
  let mut sps = None;
  let mut pps = None;
  for (start, end) in annexb_nal_ranges(data) {
    match nal_type(data[start]) {
      NAL_SPS if sps.is_none() => sps = Some(&data[start..end]),
      NAL_PPS if pps.is_none() => pps = Some(&data[start..end]),
      _ => {}
    }
    if sps.is_some() && pps.is_some() {
      break;
    }
  }
  (sps, pps)
}

/// Synthesize an AVCDecoderConfigurationRecord holding exactly one SPS and
/// one PPS, with `lengthSizeMinusOne = 3` (4-byte NAL lengths).
///
/// Record layout per ISO/IEC 14496-15: version, profile, compatibility,
/// level, 0xFF, 0xE1, SPS length + bytes, PPS count, PPS length + bytes.
pub fn avc_decoder_configuration_record(sps: &[u8], pps: &[u8]) -> Option<Vec<u8>> {
  if sps.len() < 4 {
    return None;
  }
  let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
  record.push(1); // configurationVersion
  record.push(sps[1]); // AVCProfileIndication
  record.push(sps[2]); // profile_compatibility
  record.push(sps[3]); // AVCLevelIndication
  record.push(0xFF); // reserved + lengthSizeMinusOne = 3
  record.push(0xE1); // reserved + numOfSequenceParameterSets = 1
  record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
  record.extend_from_slice(sps);
  record.push(1); // numOfPictureParameterSets
  record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
  record.extend_from_slice(pps);
  Some(record)
}

/// `avc1.PPCCLL` string from avcC bytes 1-3.
pub fn codec_string_from_avcc(avcc: &[u8]) -> Option<String> {
  if avcc.len() >= 4 && avcc[0] == 1 {
    Some(format!("avc1.{:02X}{:02X}{:02X}", avcc[1], avcc[2], avcc[3]))
  } else {
    None
  }
}

/// `avc1.PPCCLL` string from the profile/compat/level bytes of an SPS NAL.
pub fn codec_string_from_sps(sps: &[u8]) -> Option<String> {
  if sps.len() >= 4 {
    Some(format!("avc1.{:02X}{:02X}{:02X}", sps[1], sps[2], sps[3]))
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn avcc_conversion_preserves_payloads() {
    // Two NALs, one behind a 4-byte start code, one behind a 3-byte code.
    let mut annexb = vec![0, 0, 0, 1, 0x65, 0xAA, 0xBB];
    annexb.extend_from_slice(&[0, 0, 1, 0x41, 0xCC]);
    let avcc = annexb_to_avcc(&annexb);

    assert_eq!(&avcc[0..4], &3u32.to_be_bytes());
    assert_eq!(&avcc[4..7], &[0x65, 0xAA, 0xBB]);
    assert_eq!(&avcc[7..11], &2u32.to_be_bytes());
    assert_eq!(&avcc[11..13], &[0x41, 0xCC]);

    // sum(NAL length) + 4 * NAL count == output length
    let nal_sizes = [3usize, 2];
    assert_eq!(avcc.len(), nal_sizes.iter().sum::<usize>() + 4 * nal_sizes.len());
  }

  #[test]
  fn data_without_start_codes_passes_through() {
    let raw = [9u8, 8, 7, 6];
    assert_eq!(annexb_to_avcc(&raw), raw.to_vec());
  }

  #[test]
  fn idr_detection() {
    let idr = [0u8, 0, 0, 1, 0x65, 0x00];
    let non_idr = [0u8, 0, 0, 1, 0x41, 0x00];
    assert!(annexb_contains_idr(&idr));
    assert!(!annexb_contains_idr(&non_idr));
  }

  #[test]
  fn configuration_record_layout() {
    let sps = [0x67, 0x42, 0xC0, 0x1E, 0x99];
    let pps = [0x68, 0xCE, 0x3C, 0x80];
    let record = avc_decoder_configuration_record(&sps, &pps).unwrap();

    assert_eq!(&record[0..6], &[0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1]);
    assert_eq!(&record[6..8], &(sps.len() as u16).to_be_bytes());
    assert_eq!(&record[8..8 + sps.len()], &sps);
    let pps_at = 8 + sps.len();
    assert_eq!(record[pps_at], 1);
    assert_eq!(
      &record[pps_at + 1..pps_at + 3],
      &(pps.len() as u16).to_be_bytes()
    );
    assert_eq!(&record[pps_at + 3..], &pps);

    assert_eq!(codec_string_from_sps(&sps).as_deref(), Some("avc1.42C01E"));
    assert_eq!(codec_string_from_avcc(&record).as_deref(), Some("avc1.42C01E"));
  }

  #[test]
  fn sps_pps_harvest() {
    let mut stream = vec![0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28];
    stream.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xEE]);
    stream.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88]);
    let (sps, pps) = find_sps_pps(&stream);
    assert_eq!(sps, Some(&[0x67, 0x64, 0x00, 0x28][..]));
    assert_eq!(pps, Some(&[0x68, 0xEE][..]));
  }
}
