//! MPEG-TS / M2TS demuxer.
//!
//! Probes the packet stride (188, 192 with timestamp prefix, or 204 with
//! FEC trailer), discovers the program through PAT/PMT, reassembles PES
//! packets for the selected elementary PIDs, and emits AVCC-framed video
//! chunks plus ADTS/MP3-framed audio chunks.

pub mod pes;
pub mod psi;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::codec::{aac, avc, hevc, mp3};
use crate::demux::{Demuxer, DemuxEvent, EventSink, ExtractControl};
use crate::error::{MediaError, Result};
use crate::media::{ChunkKind, EncodedAudioChunk, EncodedVideoChunk, TrackDescriptor, TrackKind};
use crate::source::SharedByteSource;
use pes::PesAssembler;
use psi::{AudioStreamType, SectionAssembler, VideoStreamType};

const TS_PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;
/// Probe window: up to 50 packets at the largest stride.
const PROBE_SPAN: u64 = 50 * 204;
/// Consecutive sync bytes required by the probe (fewer only when the probe
/// buffer itself cannot hold that many packets).
const PROBE_SYNC_COUNT: usize = 5;
/// Audio timestamps resynchronize to the PES PTS beyond this drift.
const AUDIO_RESYNC_US: f64 = 500_000.0;
/// Packets processed between executor yields.
const YIELD_EVERY: u32 = 200;

/// Detected packetization: packet length on the wire and the offset of the
/// first sync byte within each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
  pub stride: usize,
  pub offset: usize,
}

/// Probe the packet layout over the head of the stream.
///
/// For every candidate stride and sync offset, counts consecutive `0x47`
/// bytes at `offset + i * stride`. A candidate qualifies with 5 in a row
/// (or as many as the buffer can hold, for very short streams); the best
/// match count wins, smaller strides break ties.
pub fn probe_packet_layout(data: &[u8]) -> Option<PacketLayout> {
  let mut best: Option<(usize, PacketLayout)> = None;

  for &stride in &[188usize, 192, 204] {
    // Offsets beyond this cannot fit the required run; offset 0 is always
    // attempted so short buffers degrade to fewer candidates, not zero.
    let max_offset = stride
      .min(data.len().saturating_sub(stride * (PROBE_SYNC_COUNT - 1)))
      .max(1);
    for offset in 0..max_offset {
      let mut count = 0usize;
      let mut pos = offset;
      while pos < data.len() && data[pos] == SYNC_BYTE {
        count += 1;
        pos += stride;
      }
      let fits = (data.len() - offset).div_ceil(stride).max(1);
      if count >= PROBE_SYNC_COUNT.min(fits) && count >= 1 {
        let better = match &best {
          None => true,
          Some((best_count, _)) => count > *best_count,
        };
        if better {
          best = Some((count, PacketLayout { stride, offset }));
        }
      }
    }
  }

  best.map(|(_, layout)| layout)
}

/// One parsed transport packet with a payload.
struct TsPacket<'a> {
  pid: u16,
  unit_start: bool,
  payload: &'a [u8],
}

/// Parse a 188-byte packet; None when the sync byte is wrong or the packet
/// carries no payload (adaptation-field-only or reserved).
fn parse_packet(data: &[u8]) -> Option<TsPacket<'_>> {
  if data.len() < TS_PACKET_LEN || data[0] != SYNC_BYTE {
    return None;
  }
  let unit_start = (data[1] >> 6) & 0x01 == 1;
  let pid = (((data[1] & 0x1F) as u16) << 8) | data[2] as u16;
  let afc = (data[3] >> 4) & 0x03;
  if afc == 0 || afc == 2 {
    return None;
  }
  let payload_start = if afc == 3 {
    let adaptation_len = data[4] as usize;
    5 + adaptation_len
  } else {
    4
  };
  if payload_start >= TS_PACKET_LEN {
    return None;
  }
  Some(TsPacket {
    pid,
    unit_start,
    payload: &data[payload_start..TS_PACKET_LEN],
  })
}

/// Sequentially yields aligned 188-byte packets from the byte source.
struct PacketScanner {
  source: SharedByteSource,
  stride: u64,
  pos: u64,
  end: u64,
  chunk: Bytes,
  chunk_start: u64,
}

impl PacketScanner {
  const READ_CHUNK: u64 = 256 * 1024;

  fn new(source: SharedByteSource, layout: PacketLayout) -> Self {
    let end = source.len();
    Self {
      source,
      stride: layout.stride as u64,
      pos: layout.offset as u64,
      end,
      chunk: Bytes::new(),
      chunk_start: 0,
    }
  }

  /// Next full packet, or None at end of stream (a trailing partial packet
  /// is dropped).
  async fn next_packet(&mut self) -> Result<Option<Bytes>> {
    if self.pos + TS_PACKET_LEN as u64 > self.end {
      return Ok(None);
    }
    let chunk_end = self.chunk_start + self.chunk.len() as u64;
    if self.pos < self.chunk_start || self.pos + TS_PACKET_LEN as u64 > chunk_end {
      let fetch_end = (self.pos + Self::READ_CHUNK).min(self.end);
      self.chunk = self.source.slice(self.pos, fetch_end).await?;
      self.chunk_start = self.pos;
    }
    let rel = (self.pos - self.chunk_start) as usize;
    if rel + TS_PACKET_LEN > self.chunk.len() {
      return Ok(None);
    }
    let packet = self.chunk.slice(rel..rel + TS_PACKET_LEN);
    self.pos += self.stride;
    Ok(Some(packet))
  }
}

#[derive(Debug, Clone, Copy)]
struct AudioParams {
  sample_rate: u32,
  samples_per_frame: u32,
}

struct VideoSelection {
  pid: u16,
  kind: VideoStreamType,
  descriptor: TrackDescriptor,
}

struct AudioSelection {
  pid: u16,
  kind: AudioStreamType,
  descriptor: TrackDescriptor,
  params: AudioParams,
}

/// MPEG-TS demuxer over a [`ByteSource`](crate::source::ByteSource).
pub struct TsDemuxer {
  source: SharedByteSource,
  control: Arc<ExtractControl>,
  layout: Option<PacketLayout>,
  video: Option<VideoSelection>,
  audio: Option<AudioSelection>,
  task: Option<JoinHandle<()>>,
}

impl TsDemuxer {
  pub fn new(source: SharedByteSource) -> Self {
    Self {
      source,
      control: ExtractControl::new(),
      layout: None,
      video: None,
      audio: None,
      task: None,
    }
  }
}

#[async_trait]
impl Demuxer for TsDemuxer {
  async fn open(&mut self) -> Result<()> {
    let probe_end = PROBE_SPAN.min(self.source.len());
    let head = self.source.slice(0, probe_end).await?;
    let layout = probe_packet_layout(&head)
      .ok_or_else(|| MediaError::format("no transport packet sync found"))?;
    tracing::debug!(
      target: "demux::ts",
      stride = layout.stride,
      offset = layout.offset,
      "packet layout probed"
    );

    let discovery = discover_tracks(self.source.clone(), layout).await?;
    if discovery.video.is_none() && discovery.audio.is_none() {
      return Err(MediaError::format("transport stream has no supported track"));
    }
    self.layout = Some(layout);
    self.video = discovery.video;
    self.audio = discovery.audio;
    Ok(())
  }

  fn video_track(&self) -> Option<TrackDescriptor> {
    self.video.as_ref().map(|v| v.descriptor.clone())
  }

  fn audio_track(&self) -> Option<TrackDescriptor> {
    self.audio.as_ref().map(|a| a.descriptor.clone())
  }

  fn start_extraction(&mut self, sink: EventSink) -> Result<()> {
    if self.task.is_some() {
      return Err(MediaError::InvalidState("extraction already started".into()));
    }
    let layout = self
      .layout
      .ok_or_else(|| MediaError::InvalidState("demuxer not opened".into()))?;

    let mut extractor = TsExtractor::new(
      sink.clone(),
      self.video.as_ref().map(|v| (v.pid, v.kind)),
      self.audio.as_ref().map(|a| (a.pid, a.kind, a.params)),
    );
    let source = self.source.clone();
    let control = self.control.clone();

    self.task = Some(tokio::spawn(async move {
      let mut scanner = PacketScanner::new(source, layout);
      match extract_loop(&mut scanner, &control, &mut extractor).await {
        Ok(()) => extractor.finish(),
        Err(err) if err.is_aborted() => {}
        Err(err) => {
          tracing::warn!(target: "demux::ts", error = %err, "extraction failed");
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

#[derive(Default)]
struct Discovery {
  video: Option<VideoSelection>,
  audio: Option<AudioSelection>,
}

/// Scan from the head until PAT, PMT and usable init data for the selected
/// elementary streams have been seen.
async fn discover_tracks(source: SharedByteSource, layout: PacketLayout) -> Result<Discovery> {
  let mut scanner = PacketScanner::new(source, layout);
  let mut pat = SectionAssembler::new();
  let mut pmt = SectionAssembler::new();
  let mut pmt_pid: Option<u16> = None;
  let mut selection: Option<psi::PmtSelection> = None;

  let mut video_pes = PesAssembler::new();
  let mut audio_pes = PesAssembler::new();
  let mut video: Option<VideoSelection> = None;
  let mut audio: Option<AudioSelection> = None;

  loop {
    let Some(packet) = scanner.next_packet().await? else {
      // Drain whatever is still pending at end of stream.
      let video_pid = selection.as_ref().and_then(|sel| sel.video);
      if video.is_none() {
        if let (Some((pid, kind)), Some(raw)) = (video_pid, video_pes.finalize()) {
          video = try_video_init(pid, kind, &raw);
        }
      }
      let audio_pid = selection.as_ref().and_then(|sel| sel.audio);
      if audio.is_none() {
        if let (Some((pid, kind)), Some(raw)) = (audio_pid, audio_pes.finalize()) {
          audio = try_audio_init(pid, kind, &raw);
        }
      }
      break;
    };
    let Some(ts) = parse_packet(&packet) else {
      continue;
    };

    if ts.pid == 0 {
      if pmt_pid.is_none() {
        if let Some(section) = pat.push(ts.payload, ts.unit_start) {
          pmt_pid = Some(psi::parse_pat(&section)?);
        }
      }
      continue;
    }
    if Some(ts.pid) == pmt_pid && selection.is_none() {
      if let Some(section) = pmt.push(ts.payload, ts.unit_start) {
        let sel = psi::parse_pmt(&section)?;
        if sel.video.is_none() && sel.audio.is_none() {
          return Err(MediaError::format("PMT lists no supported stream"));
        }
        selection = Some(sel);
      }
      continue;
    }

    let Some(sel) = &selection else { continue };

    if let Some((pid, kind)) = sel.video {
      if ts.pid == pid && video.is_none() {
        if let Some(raw) = video_pes.push(ts.payload, ts.unit_start) {
          video = try_video_init(pid, kind, &raw);
        }
      }
    }
    if let Some((pid, kind)) = sel.audio {
      if ts.pid == pid && audio.is_none() {
        if let Some(raw) = audio_pes.push(ts.payload, ts.unit_start) {
          audio = try_audio_init(pid, kind, &raw);
        }
      }
    }

    let audio_expected = sel.audio.is_some();
    let video_expected = sel.video.is_some();
    if (!video_expected || video.is_some()) && (!audio_expected || audio.is_some()) {
      break;
    }
  }

  Ok(Discovery { video, audio })
}

fn try_video_init(pid: u16, kind: VideoStreamType, raw: &[u8]) -> Option<VideoSelection> {
  let pes = pes::parse_pes(raw).ok()?;
  let descriptor = match kind {
    VideoStreamType::H264 => {
      let (sps, pps) = avc::find_sps_pps(&pes.payload);
      let sps = sps?;
      let pps = pps?;
      let codec = avc::codec_string_from_sps(sps)?;
      let mut d = TrackDescriptor::new(pid as u64, TrackKind::Video, codec);
      d.description = avc::avc_decoder_configuration_record(sps, pps).map(Bytes::from);
      d
    }
    // HEVC parameter-set harvesting is out of scope; a capability query
    // against the generic Main-profile string decides support.
    VideoStreamType::Hevc => TrackDescriptor::new(pid as u64, TrackKind::Video, "hev1.1.6.L93.B0"),
  };
  Some(VideoSelection {
    pid,
    kind,
    descriptor,
  })
}

fn try_audio_init(pid: u16, kind: AudioStreamType, raw: &[u8]) -> Option<AudioSelection> {
  let pes = pes::parse_pes(raw).ok()?;
  match kind {
    AudioStreamType::Aac => {
      let header = scan_for(&pes.payload, aac::parse_adts_header)?;
      let mut d = TrackDescriptor::new(
        pid as u64,
        TrackKind::Audio,
        aac::codec_string(header.object_type),
      );
      d.sample_rate = Some(header.sample_rate);
      d.channels = Some(header.channel_configuration as u32);
      d.description = Some(Bytes::copy_from_slice(&aac::audio_specific_config(
        header.object_type,
        header.sampling_frequency_index,
        header.channel_configuration,
      )));
      Some(AudioSelection {
        pid,
        kind,
        descriptor: d,
        params: AudioParams {
          sample_rate: header.sample_rate,
          samples_per_frame: aac::SAMPLES_PER_FRAME,
        },
      })
    }
    AudioStreamType::Mp3 => {
      let header = scan_for(&pes.payload, mp3::parse_mp3_header)?;
      let mut d = TrackDescriptor::new(pid as u64, TrackKind::Audio, "mp3");
      d.sample_rate = Some(header.sample_rate);
      d.channels = Some(header.channels);
      Some(AudioSelection {
        pid,
        kind,
        descriptor: d,
        params: AudioParams {
          sample_rate: header.sample_rate,
          samples_per_frame: header.samples_per_frame,
        },
      })
    }
  }
}

/// First offset where `parse` accepts the data.
fn scan_for<T>(data: &[u8], parse: impl Fn(&[u8]) -> Option<T>) -> Option<T> {
  (0..data.len()).find_map(|i| parse(&data[i..]))
}

/// Reframes concatenated PES payloads into individual ADTS/MP3 frames on a
/// running timestamp.
struct AudioFramer {
  kind: AudioStreamType,
  params: AudioParams,
  remainder: Vec<u8>,
  /// Running timestamp in µs; fractional to avoid cumulative rounding.
  next_ts: Option<f64>,
}

impl AudioFramer {
  fn new(kind: AudioStreamType, params: AudioParams) -> Self {
    Self {
      kind,
      params,
      remainder: Vec::new(),
      next_ts: None,
    }
  }

  fn min_header_len(&self) -> usize {
    match self.kind {
      AudioStreamType::Aac => 7,
      AudioStreamType::Mp3 => 4,
    }
  }

  fn frame_length_at(&self, pos: usize) -> Option<usize> {
    let data = &self.remainder[pos..];
    match self.kind {
      AudioStreamType::Aac => aac::parse_adts_header(data).map(|h| h.frame_length),
      AudioStreamType::Mp3 => mp3::parse_mp3_header(data).map(|h| h.frame_length),
    }
  }

  fn frame_duration_us(&self) -> f64 {
    self.params.samples_per_frame as f64 * 1_000_000.0 / self.params.sample_rate as f64
  }

  fn push_pes(&mut self, pts_us: Option<i64>, payload: &[u8], emit: &mut dyn FnMut(EncodedAudioChunk)) {
    if let Some(pts) = pts_us {
      let pts = pts as f64;
      match self.next_ts {
        None => self.next_ts = Some(pts),
        Some(current) if (pts - current).abs() >= AUDIO_RESYNC_US => {
          tracing::debug!(
            target: "demux::ts",
            drift_us = pts - current,
            "audio timestamp resync"
          );
          self.next_ts = Some(pts);
        }
        Some(_) => {}
      }
    }

    self.remainder.extend_from_slice(payload);
    let mut pos = 0;
    loop {
      // Resync: discard bytes that provably cannot start a frame. A tail
      // shorter than a header stays buffered for the next PES.
      while pos + self.min_header_len() <= self.remainder.len()
        && self.frame_length_at(pos).is_none()
      {
        pos += 1;
      }
      let Some(frame_len) = (pos + self.min_header_len() <= self.remainder.len())
        .then(|| self.frame_length_at(pos))
        .flatten()
      else {
        break;
      };
      if pos + frame_len > self.remainder.len() {
        break;
      }

      let ts = self.next_ts.unwrap_or(0.0);
      emit(EncodedAudioChunk {
        timestamp_us: ts.round() as i64,
        duration_us: 0,
        data: Bytes::copy_from_slice(&self.remainder[pos..pos + frame_len]),
      });
      self.next_ts = Some(ts + self.frame_duration_us());
      pos += frame_len;
    }
    self.remainder.drain(..pos);
  }
}

struct TsExtractor {
  sink: EventSink,
  video: Option<(u16, VideoStreamType)>,
  video_pes: PesAssembler,
  /// One-chunk look-ahead carrying the inter-chunk duration.
  pending_video: Option<(ChunkKind, i64, Bytes)>,
  last_video_ts: i64,
  audio: Option<(u16, AudioStreamType)>,
  audio_pes: PesAssembler,
  framer: Option<AudioFramer>,
}

impl TsExtractor {
  fn new(
    sink: EventSink,
    video: Option<(u16, VideoStreamType)>,
    audio: Option<(u16, AudioStreamType, AudioParams)>,
  ) -> Self {
    Self {
      sink,
      video,
      video_pes: PesAssembler::new(),
      pending_video: None,
      last_video_ts: 0,
      audio: audio.map(|(pid, kind, _)| (pid, kind)),
      audio_pes: PesAssembler::new(),
      framer: audio.map(|(_, kind, params)| AudioFramer::new(kind, params)),
    }
  }

  fn handle_video_pes(&mut self, raw: &[u8]) {
    let Ok(parsed) = pes::parse_pes(raw) else {
      return;
    };
    let Some((_, kind)) = self.video else { return };

    let timestamp_us = parsed.pts_us.unwrap_or(self.last_video_ts);
    self.last_video_ts = timestamp_us;
    let key = match kind {
      VideoStreamType::H264 => avc::annexb_contains_idr(&parsed.payload),
      VideoStreamType::Hevc => hevc::annexb_contains_irap(&parsed.payload),
    };
    let data = Bytes::from(avc::annexb_to_avcc(&parsed.payload));

    if let Some((prev_kind, prev_ts, prev_data)) = self.pending_video.take() {
      let _ = self.sink.send(DemuxEvent::VideoChunk(EncodedVideoChunk {
        kind: prev_kind,
        timestamp_us: prev_ts,
        duration_us: (timestamp_us - prev_ts).max(0),
        data: prev_data,
      }));
    }
    self.pending_video = Some((
      if key { ChunkKind::Key } else { ChunkKind::Delta },
      timestamp_us,
      data,
    ));
  }

  fn handle_audio_pes(&mut self, raw: &[u8]) {
    let Ok(parsed) = pes::parse_pes(raw) else {
      return;
    };
    let Some(framer) = &mut self.framer else { return };
    let sink = &self.sink;
    framer.push_pes(parsed.pts_us, &parsed.payload, &mut |chunk| {
      let _ = sink.send(DemuxEvent::AudioChunk(chunk));
    });
  }

  fn finish(&mut self) {
    if let Some(raw) = self.video_pes.finalize() {
      self.handle_video_pes(&raw);
    }
    if let Some(raw) = self.audio_pes.finalize() {
      self.handle_audio_pes(&raw);
    }
    if let Some((kind, ts, data)) = self.pending_video.take() {
      let _ = self.sink.send(DemuxEvent::VideoChunk(EncodedVideoChunk {
        kind,
        timestamp_us: ts,
        duration_us: 0,
        data,
      }));
    }
    if self.video.is_some() {
      let _ = self.sink.send(DemuxEvent::VideoEnd);
    }
    if self.audio.is_some() {
      let _ = self.sink.send(DemuxEvent::AudioEnd);
    }
  }
}

async fn extract_loop(
  scanner: &mut PacketScanner,
  control: &ExtractControl,
  extractor: &mut TsExtractor,
) -> Result<()> {
  let mut packets_seen: u32 = 0;
  while let Some(packet) = scanner.next_packet().await? {
    control.checkpoint().await?;
    packets_seen += 1;
    if packets_seen % YIELD_EVERY == 0 {
      tokio::task::yield_now().await;
    }

    let Some(ts) = parse_packet(&packet) else {
      continue;
    };

    if let Some((pid, _)) = extractor.video {
      if ts.pid == pid {
        if let Some(raw) = extractor.video_pes.push(ts.payload, ts.unit_start) {
          extractor.handle_video_pes(&raw);
        }
        continue;
      }
    }
    if let Some((pid, _)) = extractor.audio {
      if ts.pid == pid {
        if let Some(raw) = extractor.audio_pes.push(ts.payload, ts.unit_start) {
          extractor.handle_audio_pes(&raw);
        }
      }
    }
  }
  Ok(())
}
