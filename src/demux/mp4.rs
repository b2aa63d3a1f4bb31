//! ISO-BMFF (MP4) demuxer.
//!
//! Drives the `mp4` parser over a progressive in-memory cache: a pull loop
//! feeds ≤1 MiB slices from the byte source while header parsing and
//! per-sample reads retry whenever they touch a range that has not arrived
//! yet. This keeps extraction streaming even when the parser seeks (mdat
//! before moov and back).

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use mp4::{MediaType, Mp4Reader, TrackType};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::codec::aac;
use crate::demux::{Demuxer, DemuxEvent, EventSink, ExtractControl};
use crate::error::{MediaError, Result};
use crate::media::{ChunkKind, EncodedAudioChunk, EncodedVideoChunk, TrackDescriptor, TrackKind};
use crate::source::SharedByteSource;

/// Pull-loop slice size.
const PULL_CHUNK: u64 = 1024 * 1024;
/// Samples pumped between executor yields.
const YIELD_EVERY: u32 = 64;

/// Progressively filled byte cache shared between the pull loop and the
/// parser's reader.
struct CacheState {
  buf: Mutex<Vec<u8>>,
  total: u64,
  progress: Notify,
  complete: AtomicBool,
  failed: AtomicBool,
}

impl CacheState {
  fn new(total: u64) -> Arc<Self> {
    Arc::new(Self {
      buf: Mutex::new(Vec::new()),
      total,
      progress: Notify::new(),
      complete: AtomicBool::new(false),
      failed: AtomicBool::new(false),
    })
  }

  fn cached_len(&self) -> u64 {
    self.buf.lock().map(|b| b.len() as u64).unwrap_or(0)
  }
}

/// `Read + Seek` view over the cache. Reads into a range that has not been
/// pulled yet fail with `WouldBlock`, which the async retry wrappers turn
/// into a wait on the pull loop's progress signal.
struct CacheReader {
  cache: Arc<CacheState>,
  pos: u64,
}

impl CacheReader {
  fn new(cache: Arc<CacheState>) -> Self {
    Self { cache, pos: 0 }
  }
}

impl Read for CacheReader {
  fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
    if self.pos >= self.cache.total {
      return Ok(0);
    }
    let buf = self
      .cache
      .buf
      .lock()
      .map_err(|_| std::io::Error::other("cache poisoned"))?;
    let cached = buf.len() as u64;
    if self.pos >= cached {
      drop(buf);
      return if self.cache.failed.load(Ordering::SeqCst) {
        Err(std::io::Error::new(
          std::io::ErrorKind::UnexpectedEof,
          "byte source aborted",
        ))
      } else {
        Err(std::io::Error::new(
          std::io::ErrorKind::WouldBlock,
          "range not cached yet",
        ))
      };
    }
    let start = self.pos as usize;
    let n = out.len().min(buf.len() - start);
    out[..n].copy_from_slice(&buf[start..start + n]);
    self.pos += n as u64;
    Ok(n)
  }
}

impl Seek for CacheReader {
  fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
    let target = match from {
      SeekFrom::Start(p) => p as i64,
      SeekFrom::Current(d) => self.pos as i64 + d,
      SeekFrom::End(d) => self.cache.total as i64 + d,
    };
    if target < 0 {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "seek before start",
      ));
    }
    self.pos = target as u64;
    Ok(self.pos)
  }
}

fn is_would_block(err: &mp4::Error) -> bool {
  matches!(err, mp4::Error::IoError(io) if io.kind() == std::io::ErrorKind::WouldBlock)
}

/// Run a parser operation, parking on cache progress whenever it touches
/// bytes the pull loop has not delivered yet.
async fn with_cache<T>(
  cache: &Arc<CacheState>,
  mut op: impl FnMut() -> mp4::Result<T>,
) -> Result<T> {
  loop {
    // Register before the attempt so a pull landing in between cannot be
    // missed.
    let progressed = cache.progress.notified();
    match op() {
      Ok(value) => return Ok(value),
      Err(err) if is_would_block(&err) => {
        if cache.failed.load(Ordering::SeqCst) {
          return Err(MediaError::Aborted);
        }
        if cache.complete.load(Ordering::SeqCst) && cache.cached_len() >= cache.total {
          return Err(MediaError::format("parser read past end of cached stream"));
        }
        progressed.await;
      }
      Err(err) => return Err(MediaError::format(format!("ISO-BMFF parse error: {err}"))),
    }
  }
}

/// Feed the cache with sequential slices until the whole source is in.
async fn pull_loop(source: SharedByteSource, cache: Arc<CacheState>, control: Arc<ExtractControl>) {
  let mut pos = 0u64;
  while pos < cache.total {
    if control.checkpoint().await.is_err() {
      break;
    }
    let end = (pos + PULL_CHUNK).min(cache.total);
    match source.slice(pos, end).await {
      Ok(chunk) => {
        if let Ok(mut buf) = cache.buf.lock() {
          buf.extend_from_slice(&chunk);
        }
        pos = end;
        cache.progress.notify_waiters();
      }
      Err(err) => {
        if !err.is_aborted() {
          tracing::warn!(target: "demux::mp4", error = %err, "pull loop read failed");
        }
        cache.failed.store(true, Ordering::SeqCst);
        cache.progress.notify_waiters();
        return;
      }
    }
  }
  cache.complete.store(true, Ordering::SeqCst);
  cache.progress.notify_waiters();
}

#[derive(Clone)]
struct TrackCursor {
  track_id: u32,
  timescale: u32,
  sample_count: u32,
  next_sample: u32,
  is_video: bool,
}

impl TrackCursor {
  fn done(&self) -> bool {
    self.next_sample > self.sample_count
  }
}

/// MP4 demuxer over a [`ByteSource`](crate::source::ByteSource).
pub struct Mp4Demuxer {
  source: SharedByteSource,
  control: Arc<ExtractControl>,
  cache: Option<Arc<CacheState>>,
  reader: Option<Mp4Reader<CacheReader>>,
  video: Option<(TrackDescriptor, TrackCursor)>,
  audio: Option<(TrackDescriptor, TrackCursor)>,
  duration_us: Option<i64>,
  pull_task: Option<JoinHandle<()>>,
  extract_task: Option<JoinHandle<()>>,
}

impl Mp4Demuxer {
  pub fn new(source: SharedByteSource) -> Self {
    Self {
      source,
      control: ExtractControl::new(),
      cache: None,
      reader: None,
      video: None,
      audio: None,
      duration_us: None,
      pull_task: None,
      extract_task: None,
    }
  }
}

#[async_trait]
impl Demuxer for Mp4Demuxer {
  async fn open(&mut self) -> Result<()> {
    let size = self.source.len();
    let cache = CacheState::new(size);
    self.pull_task = Some(tokio::spawn(pull_loop(
      self.source.clone(),
      cache.clone(),
      self.control.clone(),
    )));

    let reader = with_cache(&cache, || {
      Mp4Reader::read_header(CacheReader::new(cache.clone()), size)
    })
    .await?;

    for track in reader.tracks().values() {
      let track_type = match track.track_type() {
        Ok(t) => t,
        Err(_) => continue,
      };
      match track_type {
        TrackType::Video if self.video.is_none() => {
          if let Some(descriptor) = video_descriptor(track) {
            let cursor = TrackCursor {
              track_id: track.track_id(),
              timescale: track.timescale().max(1),
              sample_count: track.sample_count(),
              next_sample: 1,
              is_video: true,
            };
            self.video = Some((descriptor, cursor));
          }
        }
        TrackType::Audio if self.audio.is_none() => {
          if let Some(descriptor) = audio_descriptor(track) {
            let cursor = TrackCursor {
              track_id: track.track_id(),
              timescale: track.timescale().max(1),
              sample_count: track.sample_count(),
              next_sample: 1,
              is_video: false,
            };
            self.audio = Some((descriptor, cursor));
          }
        }
        _ => {}
      }
    }

    if self.video.is_none() && self.audio.is_none() {
      return Err(MediaError::format("MP4 has no supported track"));
    }
    self.duration_us = i64::try_from(reader.duration().as_micros()).ok();
    self.reader = Some(reader);
    self.cache = Some(cache);
    Ok(())
  }

  fn duration_us(&self) -> Option<i64> {
    self.duration_us
  }

  fn video_track(&self) -> Option<TrackDescriptor> {
    self.video.as_ref().map(|(d, _)| d.clone())
  }

  fn audio_track(&self) -> Option<TrackDescriptor> {
    self.audio.as_ref().map(|(d, _)| d.clone())
  }

  fn start_extraction(&mut self, sink: EventSink) -> Result<()> {
    if self.extract_task.is_some() {
      return Err(MediaError::InvalidState("extraction already started".into()));
    }
    let mut reader = self
      .reader
      .take()
      .ok_or_else(|| MediaError::InvalidState("demuxer not opened".into()))?;
    let cache = self
      .cache
      .clone()
      .ok_or_else(|| MediaError::InvalidState("demuxer not opened".into()))?;
    let control = self.control.clone();
    let mut video = self.video.as_ref().map(|(_, c)| c.clone());
    let mut audio = self.audio.as_ref().map(|(_, c)| c.clone());

    self.extract_task = Some(tokio::spawn(async move {
      let result = extract_loop(
        &mut reader,
        &cache,
        &control,
        &sink,
        video.as_mut(),
        audio.as_mut(),
      )
      .await;
      match result {
        Ok(()) => {}
        Err(err) if err.is_aborted() => {}
        Err(err) => {
          tracing::warn!(target: "demux::mp4", error = %err, "extraction failed");
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
    if let Some(cache) = &self.cache {
      cache.failed.store(true, Ordering::SeqCst);
      cache.progress.notify_waiters();
    }
    if let Some(task) = self.extract_task.take() {
      let _ = task.await;
    }
    if let Some(task) = self.pull_task.take() {
      let _ = task.await;
    }
  }
}

/// Alternate one sample per live track per round, so neither queue starves
/// the other while keeping per-track order strict.
async fn extract_loop(
  reader: &mut Mp4Reader<CacheReader>,
  cache: &Arc<CacheState>,
  control: &ExtractControl,
  sink: &EventSink,
  mut video: Option<&mut TrackCursor>,
  mut audio: Option<&mut TrackCursor>,
) -> Result<()> {
  let mut samples_seen: u32 = 0;
  loop {
    control.checkpoint().await?;
    let mut progressed = false;

    for cursor in [video.as_deref_mut(), audio.as_deref_mut()].into_iter().flatten() {
      if cursor.done() {
        continue;
      }
      let sample_id = cursor.next_sample;
      let track_id = cursor.track_id;
      let sample = with_cache(cache, || reader.read_sample(track_id, sample_id)).await?;
      cursor.next_sample += 1;
      progressed = true;

      let Some(sample) = sample else {
        // Sample table ended early; the track is still terminated cleanly.
        cursor.next_sample = cursor.sample_count + 1;
        let _ = sink.send(if cursor.is_video {
          DemuxEvent::VideoEnd
        } else {
          DemuxEvent::AudioEnd
        });
        continue;
      };
      let cts = sample.start_time as i64 + sample.rendering_offset as i64;
      let timestamp_us = scaled_to_us(cts, cursor.timescale);
      let duration_us = scaled_to_us(sample.duration as i64, cursor.timescale);

      if cursor.is_video {
        let _ = sink.send(DemuxEvent::VideoChunk(EncodedVideoChunk {
          kind: if sample.is_sync {
            ChunkKind::Key
          } else {
            ChunkKind::Delta
          },
          timestamp_us,
          duration_us,
          data: sample.bytes,
        }));
      } else {
        let _ = sink.send(DemuxEvent::AudioChunk(EncodedAudioChunk {
          timestamp_us,
          duration_us,
          data: sample.bytes,
        }));
      }

      if cursor.done() {
        let _ = sink.send(if cursor.is_video {
          DemuxEvent::VideoEnd
        } else {
          DemuxEvent::AudioEnd
        });
      }

      samples_seen += 1;
      if samples_seen % YIELD_EVERY == 0 {
        tokio::task::yield_now().await;
      }
    }

    if !progressed {
      break;
    }
  }
  Ok(())
}

fn scaled_to_us(value: i64, timescale: u32) -> i64 {
  ((value as i128 * 1_000_000 + timescale as i128 / 2) / timescale as i128) as i64
}

/// AVCDecoderConfigurationRecord serialized from the sample description.
///
/// `mp4::AvcCBox` lives in a `pub(crate)` module of the `mp4` crate, so the
/// type cannot be named from here; this is a macro (rather than a generic
/// function) purely to avoid needing to spell out that type.
macro_rules! avcc_record {
  ($avcc:expr) => {{
    let avcc = $avcc;
    let mut record = vec![
      avcc.configuration_version,
      avcc.avc_profile_indication,
      avcc.profile_compatibility,
      avcc.avc_level_indication,
      0xFF, // reserved + lengthSizeMinusOne = 3
    ];
    record.push(0xE0 | (avcc.sequence_parameter_sets.len() as u8 & 0x1F));
    for sps in &avcc.sequence_parameter_sets {
      record.extend_from_slice(&(sps.bytes.len() as u16).to_be_bytes());
      record.extend_from_slice(&sps.bytes);
    }
    record.push(avcc.picture_parameter_sets.len() as u8);
    for pps in &avcc.picture_parameter_sets {
      record.extend_from_slice(&(pps.bytes.len() as u16).to_be_bytes());
      record.extend_from_slice(&pps.bytes);
    }
    record
  }};
}

/// Serialize a sample-description child box and strip its 8-byte header,
/// leaving the raw configuration record.
fn box_payload<B>(b: &B) -> Option<Vec<u8>>
where
  B: for<'a> mp4::WriteBox<&'a mut Vec<u8>>,
{
  let mut out = Vec::new();
  b.write_box(&mut out).ok()?;
  (out.len() > 8).then(|| out.split_off(8))
}

fn video_descriptor(track: &mp4::Mp4Track) -> Option<TrackDescriptor> {
  let stsd = &track.trak.mdia.minf.stbl.stsd;
  let media_type = track.media_type().ok()?;

  let mut descriptor = match media_type {
    MediaType::H264 => {
      let avc1 = stsd.avc1.as_ref()?;
      let record: Vec<u8> = avcc_record!(&avc1.avcc);
      let codec = crate::codec::avc::codec_string_from_avcc(&record)?;
      let mut d = TrackDescriptor::new(track.track_id() as u64, TrackKind::Video, codec);
      d.description = Some(Bytes::from(record));
      d
    }
    MediaType::H265 => {
      let hev1 = stsd.hev1.as_ref()?;
      let record = box_payload(&hev1.hvcc)?;
      let codec = crate::codec::hevc::codec_string_from_hvcc(&record)?;
      let mut d = TrackDescriptor::new(track.track_id() as u64, TrackKind::Video, codec);
      d.description = Some(Bytes::from(record));
      d
    }
    MediaType::VP9 => {
      let vp09 = stsd.vp09.as_ref()?;
      let vpcc = &vp09.vpcc;
      let codec = format!(
        "vp09.{:02}.{:02}.{:02}",
        vpcc.profile, vpcc.level, vpcc.bit_depth
      );
      let mut d = TrackDescriptor::new(track.track_id() as u64, TrackKind::Video, codec);
      d.description = box_payload(vpcc).map(Bytes::from);
      d
    }
    _ => return None,
  };

  descriptor.width = Some(track.width() as u32);
  descriptor.height = Some(track.height() as u32);
  Some(descriptor)
}

fn audio_descriptor(track: &mp4::Mp4Track) -> Option<TrackDescriptor> {
  let media_type = track.media_type().ok()?;
  match media_type {
    MediaType::AAC => {
      let object_type = track.audio_profile().ok()? as u8;
      let freq_index = track.sample_freq_index().ok()?;
      let sample_rate = freq_index.freq();
      let sfi = freq_index as u8;
      let channels = track.channel_config().ok()? as u8;
      let mut d = TrackDescriptor::new(
        track.track_id() as u64,
        TrackKind::Audio,
        aac::codec_string(object_type),
      );
      d.sample_rate = Some(sample_rate);
      d.channels = Some(channels as u32);
      d.description = Some(Bytes::copy_from_slice(&aac::audio_specific_config(
        object_type,
        sfi,
        channels,
      )));
      Some(d)
    }
    _ => None,
  }
}
