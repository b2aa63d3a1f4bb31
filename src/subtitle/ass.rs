//! ASS/SSA header and event-line handling.
//!
//! Matroska stores the script header in `CodecPrivate` and per-cue dialogue
//! fields in Block payloads. A stored dialogue block drops the `Start`/`End`
//! columns (the Block carries timing) and prepends a `ReadOrder` field, so
//! projecting the `Text` column needs the header's `Format:` line.

/// Extract the `[Events]` `Format:` columns from an ASS/SSA script header.
pub fn parse_event_format(codec_private: &str) -> Option<Vec<String>> {
  let mut in_events = false;
  for line in codec_private.lines() {
    let line = line.trim_start_matches('\u{feff}').trim();
    if line.starts_with('[') {
      in_events = line.eq_ignore_ascii_case("[events]");
      continue;
    }
    if !in_events {
      continue;
    }
    if let Some(rest) = line.strip_prefix("Format:") {
      return Some(rest.split(',').map(|c| c.trim().to_string()).collect());
    }
  }
  None
}

/// Number of comma-separated fields a Matroska dialogue block carries for
/// the given `Format:` columns: `ReadOrder` plus every column except
/// `Start` and `End`.
fn block_field_count(format_columns: &[String]) -> usize {
  1 + format_columns
    .iter()
    .filter(|c| !c.eq_ignore_ascii_case("start") && !c.eq_ignore_ascii_case("end"))
    .count()
}

/// Project a Matroska ASS/SSA block payload onto its `Text` column.
///
/// `Text` is always the final column and may itself contain commas, so the
/// payload is split at most `fields - 1` times. Override tags (`{\...}`)
/// are left for the renderer.
pub fn dialogue_text(format_columns: &[String], block_text: &str) -> String {
  let fields = block_field_count(format_columns);
  if fields <= 1 {
    return block_text.to_string();
  }
  block_text
    .splitn(fields, ',')
    .last()
    .unwrap_or(block_text)
    .to_string()
}

/// Strip NUL padding some muxers leave in text blocks.
pub fn clean_block_text(raw: &[u8]) -> String {
  String::from_utf8_lossy(raw).replace('\0', "")
}
