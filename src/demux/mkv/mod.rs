//! Matroska/WebM demuxer.
//!
//! A streaming EBML walk over the byte source: find the Segment, parse
//! `Info` (TimecodeScale) and `Tracks`, then iterate Clusters dispatching
//! SimpleBlocks and BlockGroups to the selected video/audio/subtitle
//! tracks. Video chunks carry inter-chunk durations via a one-slot
//! look-ahead; subtitle blocks are pre-processed into [`SubtitleCue`]s.

pub mod ebml;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;

use crate::codec::{aac, avc, hevc};
use crate::demux::{Demuxer, DemuxEvent, EventSink, ExtractControl};
use crate::error::{MediaError, Result};
use crate::media::{
  ChunkKind, EncodedAudioChunk, EncodedVideoChunk, SubtitleCue, SubtitleFormat, TrackDescriptor,
  TrackKind,
};
use crate::source::SharedByteSource;
use crate::subtitle::{ass, pgs};
use ebml::{EbmlReader, ElementHeader, SliceReader, UNKNOWN_SIZE};

// Element IDs (top level and Segment children).
const ID_SEGMENT: u32 = 0x1853_8067;
const ID_INFO: u32 = 0x1549_A966;
const ID_TIMECODE_SCALE: u32 = 0x2A_D7B1;
const ID_DURATION: u32 = 0x4489;
const ID_TRACKS: u32 = 0x1654_AE6B;
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_CLUSTER: u32 = 0x1F43_B675;

// TrackEntry children.
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_CODEC_ID: u32 = 0x86;
const ID_CODEC_PRIVATE: u32 = 0x63A2;
const ID_DEFAULT_DURATION: u32 = 0x23_E383;
const ID_NAME: u32 = 0x536E;
const ID_LANGUAGE: u32 = 0x22_B59C;
const ID_VIDEO: u32 = 0xE0;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_AUDIO: u32 = 0xE1;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;

// Cluster children.
const ID_TIMECODE: u32 = 0xE7;
const ID_SIMPLE_BLOCK: u32 = 0xA3;
const ID_BLOCK_GROUP: u32 = 0xA0;
const ID_BLOCK: u32 = 0xA1;
const ID_BLOCK_DURATION: u32 = 0x9B;

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;
const TRACK_TYPE_SUBTITLE: u64 = 17;

/// Elements processed between executor yields.
const YIELD_EVERY: u32 = 200;

/// End-of-stream fallback duration for an unterminated text cue.
const EOS_CUE_FALLBACK_US: i64 = 5_000_000;

/// Matroska demuxer over a [`ByteSource`](crate::source::ByteSource).
pub struct MkvDemuxer {
  source: SharedByteSource,
  control: Arc<ExtractControl>,
  timecode_scale: u64,
  duration_us: Option<i64>,
  tracks: Vec<TrackDescriptor>,
  clusters_start: Option<u64>,
  segment_end: u64,
  selected_subtitle: Option<u64>,
  task: Option<JoinHandle<()>>,
}

impl MkvDemuxer {
  pub fn new(source: SharedByteSource) -> Self {
    Self {
      source,
      control: ExtractControl::new(),
      timecode_scale: 1_000_000,
      duration_us: None,
      tracks: Vec::new(),
      clusters_start: None,
      segment_end: 0,
      selected_subtitle: None,
      task: None,
    }
  }

  fn first_of(&self, kind: TrackKind) -> Option<&TrackDescriptor> {
    self.tracks.iter().find(|t| t.kind == kind)
  }
}

#[async_trait]
impl Demuxer for MkvDemuxer {
  async fn open(&mut self) -> Result<()> {
    let mut reader = EbmlReader::new(self.source.clone());
    let stream_end = reader.stream_end();

    // Top level: skip everything (the EBML header) until the Segment.
    let segment = loop {
      match reader.next_element(stream_end).await? {
        Some(el) if el.id == ID_SEGMENT => break el,
        Some(el) if el.size == UNKNOWN_SIZE => {
          return Err(MediaError::format("unknown-size element before Segment"));
        }
        Some(el) => reader.skip(el.size),
        None => return Err(MediaError::format("no Segment element found")),
      }
    };
    self.segment_end = segment.data_end(stream_end);

    // Segment body: Info and Tracks, stop at the first Cluster.
    while let Some(el) = reader.next_element(self.segment_end).await? {
      if el.id != ID_CLUSTER && el.size == UNKNOWN_SIZE {
        return Err(MediaError::format("unknown-size element in Segment head"));
      }
      match el.id {
        ID_INFO => {
          let body = reader.read_bytes(el.size).await?;
          let info = parse_info(&body)?;
          self.timecode_scale = info.timecode_scale;
          self.duration_us = info
            .duration_ticks
            .map(|ticks| (ticks * info.timecode_scale as f64 / 1000.0) as i64);
        }
        ID_TRACKS => {
          let body = reader.read_bytes(el.size).await?;
          self.tracks = parse_tracks(&body)?;
        }
        ID_CLUSTER => {
          self.clusters_start = Some(el.header_start);
          break;
        }
        _ => reader.skip(el.size),
      }
    }

    if self.tracks.is_empty() {
      return Err(MediaError::format("Matroska stream declares no usable tracks"));
    }
    tracing::debug!(
      target: "demux::mkv",
      tracks = self.tracks.len(),
      timecode_scale = self.timecode_scale,
      "segment opened"
    );
    Ok(())
  }

  fn video_track(&self) -> Option<TrackDescriptor> {
    self.first_of(TrackKind::Video).cloned()
  }

  fn audio_track(&self) -> Option<TrackDescriptor> {
    self.first_of(TrackKind::Audio).cloned()
  }

  fn duration_us(&self) -> Option<i64> {
    self.duration_us
  }

  fn subtitle_tracks(&self) -> Vec<TrackDescriptor> {
    self
      .tracks
      .iter()
      .filter(|t| t.kind == TrackKind::Subtitle)
      .cloned()
      .collect()
  }

  fn select_subtitle_track(&mut self, id: u64) -> Result<()> {
    if self
      .tracks
      .iter()
      .any(|t| t.kind == TrackKind::Subtitle && t.id == id)
    {
      self.selected_subtitle = Some(id);
      Ok(())
    } else {
      Err(MediaError::InvalidState(format!("no subtitle track {id}")))
    }
  }

  fn start_extraction(&mut self, sink: EventSink) -> Result<()> {
    if self.task.is_some() {
      return Err(MediaError::InvalidState("extraction already started".into()));
    }
    let Some(clusters_start) = self.clusters_start else {
      // A headers-only stream still terminates its tracks.
      if self.first_of(TrackKind::Video).is_some() {
        let _ = sink.send(DemuxEvent::VideoEnd);
      }
      if self.first_of(TrackKind::Audio).is_some() {
        let _ = sink.send(DemuxEvent::AudioEnd);
      }
      return Ok(());
    };

    let mut extractor = Extractor {
      sink: sink.clone(),
      timecode_scale: self.timecode_scale,
      video_number: self.first_of(TrackKind::Video).map(|t| t.id),
      audio_number: self.first_of(TrackKind::Audio).map(|t| t.id),
      subtitle: self.selected_subtitle.and_then(|id| {
        self
          .tracks
          .iter()
          .find(|t| t.id == id)
          .and_then(|t| t.subtitle_format.clone())
          .map(|f| (id, f))
      }),
      pending_video: None,
      pending_cue: None,
      pgs: BytesMut::new(),
      warned_laced: false,
    };

    let source = self.source.clone();
    let control = self.control.clone();
    let segment_end = self.segment_end;

    self.task = Some(tokio::spawn(async move {
      let mut reader = EbmlReader::new(source);
      reader.seek(clusters_start);
      match extract_loop(&mut reader, segment_end, &control, &mut extractor).await {
        Ok(()) => extractor.finish(),
        Err(err) if err.is_aborted() => {}
        Err(err) => {
          tracing::warn!(target: "demux::mkv", error = %err, "extraction failed");
          let _ = sink.send(DemuxEvent::Error(err));
        }
      }
    }));
    Ok(())
  }

  fn pause_extraction(&self) {
    self.control.pause();
  }

  fn resume_extraction(&self) {
    self.control.resume();
  }

  async fn stop(&mut self) {
    self.control.stop();
    self.source.abort();
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }
}

struct SegmentInfo {
  /// Nanoseconds per tick (default 1 000 000).
  timecode_scale: u64,
  /// Declared duration in ticks.
  duration_ticks: Option<f64>,
}

fn parse_info(body: &[u8]) -> Result<SegmentInfo> {
  let mut info = SegmentInfo {
    timecode_scale: 1_000_000,
    duration_ticks: None,
  };
  let mut reader = SliceReader::new(body);
  while let Some((id, child)) = reader.next_child()? {
    match id {
      ID_TIMECODE_SCALE => info.timecode_scale = ebml::parse_uint(child),
      ID_DURATION => info.duration_ticks = Some(ebml::parse_float(child)),
      _ => {}
    }
  }
  Ok(info)
}

fn parse_tracks(body: &[u8]) -> Result<Vec<TrackDescriptor>> {
  let mut tracks = Vec::new();
  let mut reader = SliceReader::new(body);
  while let Some((id, entry)) = reader.next_child()? {
    if id != ID_TRACK_ENTRY {
      continue;
    }
    if let Some(track) = parse_track_entry(entry)? {
      tracks.push(track);
    }
  }
  Ok(tracks)
}

#[derive(Default)]
struct RawTrackEntry {
  number: u64,
  track_type: u64,
  codec_id: String,
  codec_private: Option<Bytes>,
  default_duration_ns: Option<u64>,
  name: Option<String>,
  language: Option<String>,
  width: Option<u32>,
  height: Option<u32>,
  sample_rate: Option<u32>,
  channels: Option<u32>,
}

fn parse_track_entry(entry: &[u8]) -> Result<Option<TrackDescriptor>> {
  let mut raw = RawTrackEntry::default();
  let mut reader = SliceReader::new(entry);
  while let Some((id, child)) = reader.next_child()? {
    match id {
      ID_TRACK_NUMBER => raw.number = ebml::parse_uint(child),
      ID_TRACK_TYPE => raw.track_type = ebml::parse_uint(child),
      ID_CODEC_ID => raw.codec_id = String::from_utf8_lossy(child).into_owned(),
      ID_CODEC_PRIVATE => raw.codec_private = Some(Bytes::copy_from_slice(child)),
      ID_DEFAULT_DURATION => raw.default_duration_ns = Some(ebml::parse_uint(child)),
      ID_NAME => raw.name = Some(String::from_utf8_lossy(child).into_owned()),
      ID_LANGUAGE => raw.language = Some(String::from_utf8_lossy(child).into_owned()),
      ID_VIDEO => {
        let mut video = SliceReader::new(child);
        while let Some((vid, vchild)) = video.next_child()? {
          match vid {
            ID_PIXEL_WIDTH => raw.width = Some(ebml::parse_uint(vchild) as u32),
            ID_PIXEL_HEIGHT => raw.height = Some(ebml::parse_uint(vchild) as u32),
            _ => {}
          }
        }
      }
      ID_AUDIO => {
        let mut audio = SliceReader::new(child);
        while let Some((aid, achild)) = audio.next_child()? {
          match aid {
            ID_SAMPLING_FREQUENCY => raw.sample_rate = Some(ebml::parse_float(achild) as u32),
            ID_CHANNELS => raw.channels = Some(ebml::parse_uint(achild) as u32),
            _ => {}
          }
        }
      }
      _ => {}
    }
  }
  Ok(map_track(raw))
}

/// Map a CodecID to a normalized descriptor. Unknown codecs are not
/// exposed.
fn map_track(raw: RawTrackEntry) -> Option<TrackDescriptor> {
  let private = raw.codec_private.clone();
  let private_ref = private.as_deref();

  let mut desc = match raw.codec_id.as_str() {
    "V_MPEG4/ISO/AVC" => {
      let codec = private_ref
        .and_then(avc::codec_string_from_avcc)
        .unwrap_or_else(|| "avc1.42001E".to_string());
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Video, codec);
      d.description = private;
      d
    }
    "V_MPEGH/ISO/HEVC" => {
      let codec = private_ref.and_then(hevc::codec_string_from_hvcc)?;
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Video, codec);
      d.description = private;
      d
    }
    "V_VP9" => TrackDescriptor::new(
      raw.number,
      TrackKind::Video,
      crate::codec::vp9_codec_string(private_ref),
    ),
    "V_AV1" => {
      let codec = private_ref
        .and_then(crate::codec::av1_codec_string)
        .unwrap_or_else(|| "av01.0.04M.08".to_string());
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Video, codec);
      d.description = private;
      d
    }
    "A_AAC" => {
      let codec = private_ref
        .and_then(aac::codec_string_from_asc)
        .unwrap_or_else(|| "mp4a.40.2".to_string());
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Audio, codec);
      d.description = private;
      d
    }
    "A_OPUS" => {
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Audio, "opus");
      d.sample_rate = Some(crate::codec::OPUS_SAMPLE_RATE);
      if raw.channels.is_none() {
        d.channels = private_ref.and_then(crate::codec::opus_head_channels);
      }
      d.description = private;
      d
    }
    "A_MPEG/L3" => TrackDescriptor::new(raw.number, TrackKind::Audio, "mp3"),
    "A_FLAC" => {
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Audio, "flac");
      d.description = private;
      d
    }
    "S_TEXT/UTF8" => {
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Subtitle, raw.codec_id.clone());
      d.subtitle_format = Some(SubtitleFormat::PlainText);
      d
    }
    "S_TEXT/ASS" | "S_TEXT/SSA" => {
      let header = private_ref
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .unwrap_or_default();
      let columns = ass::parse_event_format(&header).unwrap_or_default();
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Subtitle, raw.codec_id.clone());
      d.subtitle_format = Some(SubtitleFormat::Ass {
        format_columns: columns,
      });
      d
    }
    "S_HDMV/PGS" => {
      let mut d = TrackDescriptor::new(raw.number, TrackKind::Subtitle, raw.codec_id.clone());
      d.subtitle_format = Some(SubtitleFormat::Pgs);
      d
    }
    other => {
      tracing::debug!(target: "demux::mkv", codec_id = other, "skipping unsupported codec");
      return None;
    }
  };

  // Only overwrite geometry the codec mapping did not already pin.
  if desc.kind == TrackKind::Video {
    desc.width = raw.width;
    desc.height = raw.height;
  } else if desc.kind == TrackKind::Audio {
    if desc.sample_rate.is_none() {
      desc.sample_rate = raw.sample_rate;
    }
    if desc.channels.is_none() {
      desc.channels = raw.channels;
    }
  }
  desc.default_duration_us = raw.default_duration_ns.map(|ns| (ns / 1000) as i64);
  desc.language = raw.language;
  desc.name = raw.name;
  Some(desc)
}

/// Parsed Block/SimpleBlock body: lacing size metadata stripped, frame
/// payloads kept concatenated.
#[derive(Debug)]
struct BlockInfo {
  track_number: u64,
  rel_timecode: i16,
  keyframe: bool,
  laced: bool,
  payload: Bytes,
}

fn parse_block(data: &Bytes) -> Result<BlockInfo> {
  let (track_number, vint_len) =
    ebml::parse_vint(data).ok_or_else(|| MediaError::format("Block track number truncated"))?;
  let mut off = vint_len;
  if data.len() < off + 3 {
    return Err(MediaError::format("Block header truncated"));
  }
  let rel_timecode = i16::from_be_bytes([data[off], data[off + 1]]);
  let flags = data[off + 2];
  off += 3;

  let lacing = (flags >> 1) & 0x03;
  let laced = lacing != 0;
  if laced {
    if data.len() <= off {
      return Err(MediaError::format("laced Block missing frame count"));
    }
    let frame_count = data[off] as usize + 1;
    off += 1;
    match lacing {
      // Xiph: 255-terminated sizes for all but the last frame.
      0b01 => {
        for _ in 0..frame_count - 1 {
          loop {
            let byte = *data
              .get(off)
              .ok_or_else(|| MediaError::format("Xiph lacing sizes truncated"))?;
            off += 1;
            if byte != 255 {
              break;
            }
          }
        }
      }
      // Fixed-size: no size metadata.
      0b10 => {}
      // EBML: one VINT plus N-1 signed diffs.
      0b11 => {
        let (_, len) = ebml::parse_vint(&data[off..])
          .ok_or_else(|| MediaError::format("EBML lacing size truncated"))?;
        off += len;
        for _ in 0..frame_count.saturating_sub(2) {
          let (_, len) = ebml::parse_svint(&data[off..])
            .ok_or_else(|| MediaError::format("EBML lacing diff truncated"))?;
          off += len;
        }
      }
      _ => unreachable!(),
    }
  }

  if off > data.len() {
    return Err(MediaError::format("Block payload truncated"));
  }
  Ok(BlockInfo {
    track_number,
    rel_timecode,
    keyframe: flags & 0x80 != 0,
    laced,
    payload: data.slice(off..),
  })
}

struct Extractor {
  sink: EventSink,
  timecode_scale: u64,
  video_number: Option<u64>,
  audio_number: Option<u64>,
  subtitle: Option<(u64, SubtitleFormat)>,
  /// One-slot look-ahead so each emitted video chunk carries the gap to the
  /// next chunk as its duration.
  pending_video: Option<(ChunkKind, i64, Bytes)>,
  /// At-most-one unterminated text cue for the selected track.
  pending_cue: Option<(i64, String)>,
  pgs: BytesMut,
  warned_laced: bool,
}

impl Extractor {
  fn ticks_to_us(&self, ticks: i64) -> i64 {
    ((ticks as i128 * self.timecode_scale as i128 + 500) / 1000) as i64
  }

  fn handle_block(&mut self, block: BlockInfo, cluster_tc: i64, duration_ticks: Option<u64>) {
    let timestamp_us = self.ticks_to_us(cluster_tc + block.rel_timecode as i64);

    if Some(block.track_number) == self.video_number {
      if block.laced {
        if !self.warned_laced {
          self.warned_laced = true;
          tracing::warn!(
            target: "demux::mkv",
            track = block.track_number,
            "laced video blocks are unsupported; dropping"
          );
        }
        return;
      }
      if let Some((kind, ts, data)) = self.pending_video.take() {
        let _ = self.sink.send(DemuxEvent::VideoChunk(EncodedVideoChunk {
          kind,
          timestamp_us: ts,
          duration_us: (timestamp_us - ts).max(0),
          data,
        }));
      }
      self.pending_video = Some((
        if block.keyframe {
          ChunkKind::Key
        } else {
          ChunkKind::Delta
        },
        timestamp_us,
        block.payload,
      ));
      return;
    }

    if Some(block.track_number) == self.audio_number {
      let _ = self.sink.send(DemuxEvent::AudioChunk(EncodedAudioChunk {
        timestamp_us,
        duration_us: 0,
        data: block.payload,
      }));
      return;
    }

    if let Some((number, format)) = &self.subtitle {
      if block.track_number == *number {
        match format {
          SubtitleFormat::Pgs => pgs::append_block(&mut self.pgs, &block.payload, timestamp_us),
          SubtitleFormat::PlainText | SubtitleFormat::Ass { .. } => {
            let raw = ass::clean_block_text(&block.payload);
            let text = match format {
              SubtitleFormat::Ass { format_columns } => ass::dialogue_text(format_columns, &raw),
              _ => raw,
            };
            // A previous open-ended cue closes when the next one arrives.
            if let Some((start, pending)) = self.pending_cue.take() {
              let _ = self.sink.send(DemuxEvent::Subtitle(SubtitleCue::Text {
                start_us: start,
                end_us: timestamp_us,
                text: pending,
              }));
            }
            match duration_ticks {
              Some(ticks) => {
                let _ = self.sink.send(DemuxEvent::Subtitle(SubtitleCue::Text {
                  start_us: timestamp_us,
                  end_us: timestamp_us + self.ticks_to_us(ticks as i64),
                  text,
                }));
              }
              None => self.pending_cue = Some((timestamp_us, text)),
            }
          }
        }
      }
    }
  }

  fn finish(&mut self) {
    if let Some((kind, ts, data)) = self.pending_video.take() {
      let _ = self.sink.send(DemuxEvent::VideoChunk(EncodedVideoChunk {
        kind,
        timestamp_us: ts,
        duration_us: 0,
        data,
      }));
    }
    if let Some((start, text)) = self.pending_cue.take() {
      let _ = self.sink.send(DemuxEvent::Subtitle(SubtitleCue::Text {
        start_us: start,
        end_us: start + EOS_CUE_FALLBACK_US,
        text,
      }));
    }
    if !self.pgs.is_empty() {
      let data = std::mem::take(&mut self.pgs).freeze();
      let _ = self.sink.send(DemuxEvent::Subtitle(SubtitleCue::Pgs { data }));
    }
    if self.video_number.is_some() {
      let _ = self.sink.send(DemuxEvent::VideoEnd);
    }
    if self.audio_number.is_some() {
      let _ = self.sink.send(DemuxEvent::AudioEnd);
    }
  }
}

/// Walk the Segment body from the first Cluster to the end.
///
/// Clusters are entered without tracking their extent: children are read
/// sequentially and anything else (the next Cluster included) falls through
/// to the same dispatch, which also handles unknown-size clusters.
async fn extract_loop(
  reader: &mut EbmlReader,
  segment_end: u64,
  control: &ExtractControl,
  extractor: &mut Extractor,
) -> Result<()> {
  let mut cluster_tc: i64 = 0;
  let mut elements_seen: u32 = 0;

  while let Some(el) = reader.next_element(segment_end).await? {
    control.checkpoint().await?;
    elements_seen += 1;
    if elements_seen % YIELD_EVERY == 0 {
      tokio::task::yield_now().await;
    }

    match el.id {
      ID_CLUSTER => {
        // Children follow; timecode resets per cluster.
        cluster_tc = 0;
      }
      ID_TIMECODE => {
        let body = reader.read_bytes(known_size(&el)?).await?;
        cluster_tc = ebml::parse_uint(&body) as i64;
      }
      ID_SIMPLE_BLOCK => {
        let body = reader.read_bytes(known_size(&el)?).await?;
        let block = parse_block(&body)?;
        extractor.handle_block(block, cluster_tc, None);
      }
      ID_BLOCK_GROUP => {
        let body = reader.read_bytes(known_size(&el)?).await?;
        let mut group = SliceReader::new(&body);
        let mut block_bytes: Option<Bytes> = None;
        let mut duration_ticks: Option<u64> = None;
        while let Some((id, child)) = group.next_child()? {
          match id {
            ID_BLOCK => block_bytes = Some(Bytes::copy_from_slice(child)),
            ID_BLOCK_DURATION => duration_ticks = Some(ebml::parse_uint(child)),
            _ => {}
          }
        }
        if let Some(bytes) = block_bytes {
          let mut block = parse_block(&bytes)?;
          // A bare Block never marks keyframes; only SimpleBlocks do.
          block.keyframe = false;
          extractor.handle_block(block, cluster_tc, duration_ticks);
        }
      }
      _ => reader.skip(known_size(&el)?),
    }
  }
  Ok(())
}

fn known_size(el: &ElementHeader) -> Result<u64> {
  if el.size == UNKNOWN_SIZE {
    Err(MediaError::format(format!(
      "element {:#x} has unknown size",
      el.id
    )))
  } else {
    Ok(el.size)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::MemoryByteSource;

  // Minimal EBML writer for fixtures.

  fn size_vint(n: usize) -> Vec<u8> {
    if n < 0x7F {
      vec![0x80 | n as u8]
    } else {
      assert!(n < 0x3FFF);
      vec![0x40 | (n >> 8) as u8, (n & 0xFF) as u8]
    }
  }

  fn el(id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let id_bytes = id.to_be_bytes();
    let skip = id_bytes.iter().take_while(|b| **b == 0).count();
    out.extend_from_slice(&id_bytes[skip..]);
    out.extend_from_slice(&size_vint(body.len()));
    out.extend_from_slice(body);
    out
  }

  fn uint_el(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    el(id, &bytes[skip..])
  }

  fn simple_block(track: u8, rel: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![0x80 | track];
    body.extend_from_slice(&rel.to_be_bytes());
    body.push(flags);
    body.extend_from_slice(payload);
    el(ID_SIMPLE_BLOCK, &body)
  }

  fn avc_track_entry(number: u8) -> Vec<u8> {
    let avcc = avc::avc_decoder_configuration_record(
      &[0x67, 0x42, 0xC0, 0x1E],
      &[0x68, 0xCE, 0x3C, 0x80],
    )
    .unwrap();
    let mut entry = Vec::new();
    entry.extend_from_slice(&uint_el(ID_TRACK_NUMBER, number as u64));
    entry.extend_from_slice(&uint_el(ID_TRACK_TYPE, TRACK_TYPE_VIDEO));
    entry.extend_from_slice(&el(ID_CODEC_ID, b"V_MPEG4/ISO/AVC"));
    entry.extend_from_slice(&el(ID_CODEC_PRIVATE, &avcc));
    let mut video = Vec::new();
    video.extend_from_slice(&uint_el(ID_PIXEL_WIDTH, 640));
    video.extend_from_slice(&uint_el(ID_PIXEL_HEIGHT, 480));
    entry.extend_from_slice(&el(ID_VIDEO, &video));
    el(ID_TRACK_ENTRY, &entry)
  }

  fn subtitle_track_entry(number: u8) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&uint_el(ID_TRACK_NUMBER, number as u64));
    entry.extend_from_slice(&uint_el(ID_TRACK_TYPE, TRACK_TYPE_SUBTITLE));
    entry.extend_from_slice(&el(ID_CODEC_ID, b"S_TEXT/UTF8"));
    el(ID_TRACK_ENTRY, &entry)
  }

  fn segment_fixture(cluster_children: &[Vec<u8>], extra_tracks: &[Vec<u8>]) -> Vec<u8> {
    let info = el(ID_INFO, &uint_el(ID_TIMECODE_SCALE, 1_000_000));
    let mut tracks_body = avc_track_entry(1);
    for t in extra_tracks {
      tracks_body.extend_from_slice(t);
    }
    let tracks = el(ID_TRACKS, &tracks_body);

    let mut cluster_body = Vec::new();
    for child in cluster_children {
      cluster_body.extend_from_slice(child);
    }
    let cluster = el(ID_CLUSTER, &cluster_body);

    let mut segment_body = info;
    segment_body.extend_from_slice(&tracks);
    segment_body.extend_from_slice(&cluster);

    let mut file = el(0x1A45DFA3, &[]);
    file.extend_from_slice(&el(ID_SEGMENT, &segment_body));
    file
  }

  async fn open_and_extract(file: Vec<u8>, subtitle: Option<u64>) -> Vec<DemuxEvent> {
    let source = Arc::new(MemoryByteSource::new(file));
    let mut demuxer = MkvDemuxer::new(source);
    demuxer.open().await.unwrap();
    if let Some(id) = subtitle {
      demuxer.select_subtitle_track(id).unwrap();
    }
    let (sink, mut stream) = crate::demux::event_channel();
    demuxer.start_extraction(sink).unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
      events.push(event);
    }
    demuxer.stop().await;
    events
  }

  #[tokio::test]
  async fn cluster_timecode_plus_relative_maps_to_microseconds() {
    let children = vec![
      uint_el(ID_TIMECODE, 1000),
      simple_block(1, 42, 0x80, &[0xDE, 0xAD]),
    ];
    let events = open_and_extract(segment_fixture(&children, &[]), None).await;

    match &events[0] {
      DemuxEvent::VideoChunk(chunk) => {
        assert_eq!(chunk.timestamp_us, 1_042_000);
        assert_eq!(chunk.kind, ChunkKind::Key);
        // Sole chunk of the track: duration 0.
        assert_eq!(chunk.duration_us, 0);
        assert_eq!(&chunk.data[..], &[0xDE, 0xAD]);
      }
      other => panic!("expected video chunk, got {other:?}"),
    }
    assert!(matches!(events[1], DemuxEvent::VideoEnd));
  }

  #[tokio::test]
  async fn video_lookahead_assigns_inter_chunk_durations() {
    let children = vec![
      uint_el(ID_TIMECODE, 0),
      simple_block(1, 0, 0x80, &[1]),
      simple_block(1, 40, 0x00, &[2]),
      simple_block(1, 80, 0x00, &[3]),
    ];
    let events = open_and_extract(segment_fixture(&children, &[]), None).await;

    let chunks: Vec<_> = events
      .iter()
      .filter_map(|e| match e {
        DemuxEvent::VideoChunk(c) => Some(c),
        _ => None,
      })
      .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].duration_us, 40_000);
    assert_eq!(chunks[1].duration_us, 40_000);
    assert_eq!(chunks[2].duration_us, 0);
    assert_eq!(chunks[0].kind, ChunkKind::Key);
    assert_eq!(chunks[1].kind, ChunkKind::Delta);
    // Non-decreasing timestamps.
    assert!(chunks.windows(2).all(|w| w[1].timestamp_us >= w[0].timestamp_us));
  }

  #[tokio::test]
  async fn open_ended_text_cue_closes_on_next_block_and_eos() {
    let children = vec![
      uint_el(ID_TIMECODE, 0),
      simple_block(1, 0, 0x80, &[1]),
      simple_block(2, 100, 0x00, b"first line"),
      simple_block(2, 400, 0x00, b"second line"),
    ];
    let fixture = segment_fixture(&children, &[subtitle_track_entry(2)]);
    let events = open_and_extract(fixture, Some(2)).await;

    let cues: Vec<_> = events
      .iter()
      .filter_map(|e| match e {
        DemuxEvent::Subtitle(cue) => Some(cue.clone()),
        _ => None,
      })
      .collect();
    assert_eq!(
      cues[0],
      SubtitleCue::Text {
        start_us: 100_000,
        end_us: 400_000,
        text: "first line".into()
      }
    );
    // Last cue: end-of-stream fallback of 5 s.
    assert_eq!(
      cues[1],
      SubtitleCue::Text {
        start_us: 400_000,
        end_us: 5_400_000,
        text: "second line".into()
      }
    );
  }

  #[tokio::test]
  async fn laced_video_blocks_are_dropped() {
    // Xiph lacing, 2 frames, sizes [2]; video lacing is unsupported.
    let mut laced_body = vec![0x81u8];
    laced_body.extend_from_slice(&0i16.to_be_bytes());
    laced_body.push(0x80 | 0x02); // keyframe + Xiph lacing
    laced_body.push(1); // frame count - 1
    laced_body.push(2); // first frame size
    laced_body.extend_from_slice(&[9, 9, 8, 8]);
    let children = vec![uint_el(ID_TIMECODE, 0), el(ID_SIMPLE_BLOCK, &laced_body)];
    let events = open_and_extract(segment_fixture(&children, &[]), None).await;

    assert!(events
      .iter()
      .all(|e| !matches!(e, DemuxEvent::VideoChunk(_))));
  }

  #[test]
  fn laced_audio_payload_keeps_frames_concatenated() {
    // Xiph lacing: 2 frames, first size 3 -> payload "abcde".
    let mut body = vec![0x82u8];
    body.extend_from_slice(&0i16.to_be_bytes());
    body.push(0x02);
    body.push(1);
    body.push(3);
    body.extend_from_slice(b"abcde");
    let block = parse_block(&Bytes::from(body)).unwrap();
    assert_eq!(block.track_number, 2);
    assert!(block.laced);
    assert_eq!(&block.payload[..], b"abcde");
  }

  #[test]
  fn track_mapping_covers_the_codec_table() {
    let avcc =
      avc::avc_decoder_configuration_record(&[0x67, 0x64, 0x00, 0x28], &[0x68, 0xEE]).unwrap();
    let track = map_track(RawTrackEntry {
      number: 1,
      track_type: TRACK_TYPE_VIDEO,
      codec_id: "V_MPEG4/ISO/AVC".into(),
      codec_private: Some(avcc.into()),
      width: Some(1920),
      height: Some(1080),
      ..Default::default()
    })
    .unwrap();
    assert_eq!(track.codec, "avc1.640028");
    assert!(track.description.is_some());
    assert_eq!(track.width, Some(1920));

    let mut opus_head = b"OpusHead".to_vec();
    opus_head.extend_from_slice(&[1, 2]);
    let track = map_track(RawTrackEntry {
      number: 2,
      track_type: TRACK_TYPE_AUDIO,
      codec_id: "A_OPUS".into(),
      codec_private: Some(opus_head.into()),
      sample_rate: Some(24_000),
      ..Default::default()
    })
    .unwrap();
    assert_eq!(track.codec, "opus");
    // Opus is always surfaced at 48 kHz; channels come from OpusHead.
    assert_eq!(track.sample_rate, Some(48_000));
    assert_eq!(track.channels, Some(2));

    assert!(map_track(RawTrackEntry {
      number: 3,
      codec_id: "V_UNHEARD_OF".into(),
      ..Default::default()
    })
    .is_none());
  }
}
