//! Playback orchestrator.
//!
//! Owns the session: picks a demuxer for the source, gates on decoder
//! capability, drives the decode/render/audio-schedule loops on the
//! cooperative executor, applies back-pressure to extraction, and tears
//! everything down on stop. Decoded output reaches the orchestrator through
//! channels, never by synchronous callback, so decoder callbacks can fire
//! from anywhere without re-entering player state.

pub mod audio;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::clock::MediaClock;
use crate::decode::{
  AudioDecoder, AudioDecoderConfig, DecodeErrorSink, VideoDecoder, VideoDecoderConfig,
};
use crate::demux::{
  detect_container, event_channel, ContainerFormat, Demuxer, DemuxEvent, EventStream,
};
use crate::demux::mkv::MkvDemuxer;
use crate::demux::mp4::Mp4Demuxer;
use crate::demux::ts::TsDemuxer;
use crate::error::{MediaError, Result};
use crate::media::{
  AudioData, EncodedAudioChunk, EncodedVideoChunk, SubtitleCue, TrackDescriptor, VideoFrame,
};
use crate::ring::FrameRing;
use crate::source::SharedByteSource;
use audio::{AudioOutput, AudioScheduler};

/// Decoded-frame ring capacity.
const VIDEO_RING_CAPACITY: usize = 8;
/// Keep this much ring headroom before submitting more video chunks.
const RING_HEADROOM: usize = 2;
/// Maximum chunks in flight inside the video decoder.
const MAX_VIDEO_DECODE_QUEUE: usize = 4;
/// Maximum chunks in flight inside the audio decoder.
const MAX_AUDIO_DECODE_QUEUE: usize = 8;
/// Stop decoding audio ahead once this much is scheduled on the device.
const AUDIO_LOOKAHEAD_SEC: f64 = 2.0;
/// Pause extraction above this queue depth.
const QUEUE_HIGH_WATER: usize = 120;
/// Resume extraction below this depth on both queues.
const QUEUE_LOW_WATER: usize = 40;
/// Give audio this long to anchor the clock before video force-starts it.
const WAIT_FOR_AUDIO_TIMEOUT: Duration = Duration::from_secs(1);
/// Render tick, display-refresh sized.
const RENDER_TICK: Duration = Duration::from_micros(16_667);

/// Active pipeline kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
  None,
  /// Demux path failed for a natively playable container; the shell should
  /// hand the source to a platform media element.
  NativeElement,
  Mp4,
  Mkv,
  Ts,
}

/// Session events surfaced to the shell.
#[derive(Debug)]
pub enum PlayerEvent {
  Loaded {
    video: Option<TrackDescriptor>,
    audio: Option<TrackDescriptor>,
  },
  /// Audio was torn down (unsupported config or decoder failure); video
  /// continues on the monotonic clock.
  AudioDisabled { reason: String },
  /// The demux path cannot serve this source but a native element can.
  NativeFallback {
    container: ContainerFormat,
    reason: String,
  },
  Ended,
  Error(String),
}

/// Presentation sink for decoded frames.
pub trait VideoRenderer: Send {
  fn render(&mut self, frame: &mut VideoFrame);
}

pub type SubtitleHandler = Box<dyn FnMut(SubtitleCue) + Send>;

/// A source to play: bytes plus enough naming to detect the container.
pub struct MediaSource {
  pub source: SharedByteSource,
  /// Path or URL; the suffix drives container detection.
  pub location: String,
  pub media_type: Option<String>,
  /// Explicit container override.
  pub container: Option<ContainerFormat>,
}

/// Construction-time components, WebCodecs-init style.
pub struct PlayerInit {
  pub video_decoder: Box<dyn VideoDecoder>,
  pub audio_decoder: Option<Box<dyn AudioDecoder>>,
  pub renderer: Box<dyn VideoRenderer>,
  pub audio_output: Option<Box<dyn AudioOutput>>,
  pub subtitle_output: Option<SubtitleHandler>,
}

struct Shared {
  pipeline: Pipeline,
  demuxer: Option<Box<dyn Demuxer>>,
  video_decoder: Box<dyn VideoDecoder>,
  audio_decoder: Option<Box<dyn AudioDecoder>>,
  renderer: Box<dyn VideoRenderer>,
  audio_out: Option<Box<dyn AudioOutput>>,
  scheduler: AudioScheduler,
  subtitle_handler: Option<SubtitleHandler>,
  events: mpsc::UnboundedSender<PlayerEvent>,

  clock: MediaClock,
  epoch: Instant,
  session_start: Instant,

  video_track: Option<TrackDescriptor>,
  audio_track: Option<TrackDescriptor>,
  audio_enabled: bool,
  waiting_for_audio: bool,

  video_queue: VecDeque<EncodedVideoChunk>,
  audio_queue: VecDeque<EncodedAudioChunk>,
  frame_ring: FrameRing<VideoFrame>,

  frames_rx: Option<UnboundedReceiver<VideoFrame>>,
  audio_rx: Option<UnboundedReceiver<AudioData>>,
  video_err_rx: Option<UnboundedReceiver<MediaError>>,
  audio_err_rx: Option<UnboundedReceiver<MediaError>>,

  video_eos: bool,
  audio_eos: bool,
  video_flushed: bool,
  audio_flushed: bool,
  extraction_paused: bool,
  paused: bool,
  ended_sent: bool,
}

impl Shared {
  fn send_event(&self, event: PlayerEvent) {
    let _ = self.events.send(event);
  }

  /// Wall clock in milliseconds: the audio device clock while audio is
  /// live (drift-free scheduling), otherwise the monotonic clock.
  fn wall_now_ms(&self) -> f64 {
    if self.audio_enabled {
      if let Some(out) = &self.audio_out {
        return out.current_time() * 1000.0;
      }
    }
    self.epoch.elapsed().as_secs_f64() * 1000.0
  }

  fn has_live_demux(&self) -> bool {
    matches!(self.pipeline, Pipeline::Mp4 | Pipeline::Mkv | Pipeline::Ts)
  }

  fn reset_session_state(&mut self) {
    self.clock = MediaClock::new();
    self.scheduler.reset();
    self.video_track = None;
    self.audio_track = None;
    self.audio_enabled = false;
    self.waiting_for_audio = false;
    self.video_queue.clear();
    self.audio_queue.clear();
    for mut frame in self.frame_ring.drain() {
      frame.close();
    }
    self.frames_rx = None;
    self.audio_rx = None;
    self.video_err_rx = None;
    self.audio_err_rx = None;
    self.video_eos = false;
    self.audio_eos = false;
    self.video_flushed = false;
    self.audio_flushed = false;
    self.extraction_paused = false;
    self.paused = false;
    self.ended_sent = false;
  }

  fn on_video_frame(&mut self, frame: VideoFrame) {
    if !self.clock.started() && !self.waiting_for_audio {
      let wall = self.wall_now_ms();
      self.clock.start(frame.timestamp_us, wall);
    }
    if let Err(rejected) = self.frame_ring.push(frame) {
      // Drop-oldest: the evicted head is closed before the new frame goes
      // in.
      if let Some(mut evicted) = self.frame_ring.pop() {
        evicted.close();
      }
      let _ = self.frame_ring.push(rejected);
    }
  }

  fn on_audio_data(&mut self, mut data: AudioData) {
    if !self.audio_enabled {
      data.close();
      return;
    }
    let Some(out) = self.audio_out.as_mut() else {
      data.close();
      return;
    };
    self.waiting_for_audio = false;
    self.scheduler.schedule_block(out.as_mut(), &mut self.clock, data);
  }

  fn drain_frames(&mut self) {
    if let Some(mut rx) = self.frames_rx.take() {
      loop {
        match rx.try_recv() {
          Ok(frame) => self.on_video_frame(frame),
          Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
      }
      self.frames_rx = Some(rx);
    }
  }

  fn drain_decoded(&mut self) {
    self.drain_frames();
    if let Some(mut rx) = self.audio_rx.take() {
      loop {
        match rx.try_recv() {
          Ok(data) => self.on_audio_data(data),
          Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
      }
      self.audio_rx = Some(rx);
    }
  }

  fn drain_decoder_errors(&mut self) {
    if let Some(mut rx) = self.video_err_rx.take() {
      while let Ok(err) = rx.try_recv() {
        // Video decoder runtime errors are non-fatal; frames may simply
        // stop arriving.
        tracing::warn!(target: "player", error = %err, "video decoder error");
      }
      self.video_err_rx = Some(rx);
    }
    let mut audio_failed = false;
    if let Some(mut rx) = self.audio_err_rx.take() {
      while let Ok(err) = rx.try_recv() {
        tracing::debug!(target: "player", error = %err, "audio decoder error");
        audio_failed = true;
      }
      self.audio_err_rx = Some(rx);
    }
    if audio_failed && self.audio_enabled {
      self.teardown_audio("decoder error");
    }
  }

  /// Kill the audio pipeline and keep video running on the monotonic
  /// clock.
  fn teardown_audio(&mut self, reason: &str) {
    // Rebase before the wall-clock source flips away from the device.
    if self.clock.started() {
      let media_now = self.clock.now_us(self.wall_now_ms());
      self.audio_enabled = false;
      let wall = self.wall_now_ms();
      self.clock.start(media_now, wall);
    } else {
      self.audio_enabled = false;
    }
    self.waiting_for_audio = false;
    self.audio_queue.clear();
    if let Some(decoder) = &mut self.audio_decoder {
      decoder.reset();
      decoder.close();
    }
    if let Some(out) = &mut self.audio_out {
      out.stop_all();
    }
    self.audio_flushed = true;
    self.send_event(PlayerEvent::AudioDisabled {
      reason: reason.to_string(),
    });
  }

  async fn pump_video(&mut self) {
    if self.video_track.is_none() {
      return;
    }
    loop {
      // Pick up frames a synchronous decoder may have emitted for the
      // previous submission; the ring-headroom guard depends on it.
      self.drain_frames();
      if self.video_queue.is_empty()
        || self.video_decoder.decode_queue_size() > MAX_VIDEO_DECODE_QUEUE
        || self.frame_ring.len() + RING_HEADROOM > self.frame_ring.capacity()
      {
        break;
      }
      let chunk = self.video_queue.pop_front().expect("queue non-empty");
      if let Err(err) = self.video_decoder.decode(chunk) {
        tracing::warn!(target: "player", error = %err, "video decode submit failed");
      }
    }
    if self.video_eos && self.video_queue.is_empty() && !self.video_flushed {
      self.video_flushed = true;
      // Best effort: a failed flush never fails the session.
      if let Err(err) = self.video_decoder.flush().await {
        tracing::debug!(target: "player", error = %err, "video flush failed");
      }
    }
  }

  async fn pump_audio(&mut self) {
    if !self.audio_enabled || self.audio_track.is_none() {
      return;
    }
    let Some(decoder) = self.audio_decoder.as_mut() else {
      return;
    };
    let lookahead = match &self.audio_out {
      Some(out) => self.scheduler.scheduled_lookahead_sec(out.as_ref()),
      None => 0.0,
    };
    let mut lookahead_ok = lookahead < AUDIO_LOOKAHEAD_SEC;
    while lookahead_ok
      && !self.audio_queue.is_empty()
      && decoder.decode_queue_size() <= MAX_AUDIO_DECODE_QUEUE
    {
      let chunk = self.audio_queue.pop_front().expect("queue non-empty");
      if let Err(err) = decoder.decode(chunk) {
        tracing::debug!(target: "player", error = %err, "audio decode submit failed");
      }
      lookahead_ok = match &self.audio_out {
        Some(out) => self.scheduler.scheduled_lookahead_sec(out.as_ref()) < AUDIO_LOOKAHEAD_SEC,
        None => true,
      };
    }
    if self.audio_eos && self.audio_queue.is_empty() && !self.audio_flushed {
      self.audio_flushed = true;
      if let Some(decoder) = &mut self.audio_decoder {
        if let Err(err) = decoder.flush().await {
          tracing::debug!(target: "player", error = %err, "audio flush failed");
        }
      }
    }
  }

  fn update_backpressure(&mut self) {
    let Some(demuxer) = &self.demuxer else { return };
    let high =
      self.video_queue.len() > QUEUE_HIGH_WATER || self.audio_queue.len() > QUEUE_HIGH_WATER;
    let low =
      self.video_queue.len() < QUEUE_LOW_WATER && self.audio_queue.len() < QUEUE_LOW_WATER;
    if high && !self.extraction_paused {
      demuxer.pause_extraction();
      self.extraction_paused = true;
    } else if low && self.extraction_paused && !self.paused {
      demuxer.resume_extraction();
      self.extraction_paused = false;
    }
  }

  fn maybe_ended(&mut self) {
    if self.ended_sent || !self.has_live_demux() {
      return;
    }
    let video_done = match &self.video_track {
      Some(_) => {
        self.video_eos
          && self.video_queue.is_empty()
          && self.video_flushed
          && self.frame_ring.is_empty()
      }
      None => true,
    };
    let audio_done = if self.audio_track.is_some() && self.audio_enabled {
      self.audio_eos && self.audio_queue.is_empty() && self.audio_flushed
    } else {
      true
    };
    if video_done && audio_done {
      self.ended_sent = true;
      self.send_event(PlayerEvent::Ended);
    }
  }

  /// One step of the decode/schedule machinery; called after demux events
  /// and on every render tick.
  async fn advance(&mut self) {
    if !self.has_live_demux() {
      return;
    }
    self.drain_decoder_errors();
    self.drain_decoded();
    self.pump_video().await;
    self.pump_audio().await;
    // Synchronous decoders may have produced output during the pumps.
    self.drain_decoded();
    self.update_backpressure();
    self.maybe_ended();
  }

  fn render_tick(&mut self) {
    if !self.has_live_demux() {
      return;
    }
    if self.waiting_for_audio && self.session_start.elapsed() >= WAIT_FOR_AUDIO_TIMEOUT {
      self.drain_decoded();
      if let Some(frame) = self.frame_ring.peek() {
        let ts = frame.timestamp_us;
        let wall = self.wall_now_ms();
        tracing::debug!(target: "player", ts, "audio never anchored the clock; starting from video");
        self.clock.start(ts, wall);
        self.waiting_for_audio = false;
      }
    }
    if self.paused || !self.clock.started() {
      return;
    }

    let now_us = self.clock.now_us(self.wall_now_ms());
    loop {
      match self.frame_ring.peek() {
        // Late frames are rendered immediately rather than skipped.
        Some(frame) if frame.timestamp_us <= now_us => {}
        _ => break,
      }
      let mut frame = self.frame_ring.pop().expect("peeked frame");
      self.renderer.render(&mut frame);
      frame.close();
    }
  }
}

/// Streaming media player session.
pub struct Player {
  shared: Arc<Mutex<Shared>>,
  events_rx: Option<UnboundedReceiver<PlayerEvent>>,
  cancel: CancellationToken,
  tasks: Vec<JoinHandle<()>>,
}

impl Player {
  pub fn new(init: PlayerInit) -> Self {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Shared {
      pipeline: Pipeline::None,
      demuxer: None,
      video_decoder: init.video_decoder,
      audio_decoder: init.audio_decoder,
      renderer: init.renderer,
      audio_out: init.audio_output,
      scheduler: AudioScheduler::new(),
      subtitle_handler: init.subtitle_output,
      events: events_tx,
      clock: MediaClock::new(),
      epoch: Instant::now(),
      session_start: Instant::now(),
      video_track: None,
      audio_track: None,
      audio_enabled: false,
      waiting_for_audio: false,
      video_queue: VecDeque::new(),
      audio_queue: VecDeque::new(),
      frame_ring: FrameRing::new(VIDEO_RING_CAPACITY),
      frames_rx: None,
      audio_rx: None,
      video_err_rx: None,
      audio_err_rx: None,
      video_eos: false,
      audio_eos: false,
      video_flushed: false,
      audio_flushed: false,
      extraction_paused: false,
      paused: false,
      ended_sent: false,
    };
    Self {
      shared: Arc::new(Mutex::new(shared)),
      events_rx: Some(events_rx),
      cancel: CancellationToken::new(),
      tasks: Vec::new(),
    }
  }

  /// Take the session event stream. Available once.
  pub fn take_events(&mut self) -> Option<UnboundedReceiver<PlayerEvent>> {
    self.events_rx.take()
  }

  pub async fn pipeline(&self) -> Pipeline {
    self.shared.lock().await.pipeline
  }

  /// Load a source: close any prior pipeline, detect the container, open
  /// the matching demuxer, gate on decoder capability and start playback.
  pub async fn load(&mut self, media: MediaSource) -> Result<()> {
    let container = media
      .container
      .or_else(|| detect_container(&media.location, media.media_type.as_deref()))
      .ok_or_else(|| MediaError::format(format!("unrecognized container: {}", media.location)))?;

    let demuxer: Box<dyn Demuxer> = match container {
      ContainerFormat::Mp4 => Box::new(Mp4Demuxer::new(media.source.clone())),
      ContainerFormat::Mkv => Box::new(MkvDemuxer::new(media.source.clone())),
      ContainerFormat::Ts => Box::new(TsDemuxer::new(media.source.clone())),
    };
    self.load_with(demuxer, container).await
  }

  /// Load over an already-constructed demuxer.
  pub(crate) async fn load_with(
    &mut self,
    mut demuxer: Box<dyn Demuxer>,
    container: ContainerFormat,
  ) -> Result<()> {
    self.stop().await;

    if let Err(err) = demuxer.open().await {
      return self.fall_back(container, err).await;
    }
    let video_track = demuxer.video_track();
    let audio_track = demuxer.audio_track();
    if video_track.is_none() && audio_track.is_none() {
      return
        self.fall_back(container, MediaError::format("no playable track")).await;
    }

    let mut shared = self.shared.lock().await;
    shared.reset_session_state();

    // Video decoder capability gate: fatal (or native fallback) on
    // rejection.
    if let Some(track) = &video_track {
      let config = VideoDecoderConfig::from_track(track);
      let support = shared.video_decoder.is_config_supported(&config).await?;
      if !support.supported {
        drop(shared);
        return
          self
            .fall_back(
              container,
              MediaError::Unsupported(format!("video codec {}", config.codec)),
            )
            .await;
      }
      let (frames_tx, frames_rx) = mpsc::unbounded_channel();
      let (err_tx, err_rx) = mpsc::unbounded_channel();
      let error_sink: DecodeErrorSink = Box::new(move |err| {
        let _ = err_tx.send(err);
      });
      shared.video_decoder.configure(
        support.config,
        Box::new(move |frame| {
          let _ = frames_tx.send(frame);
        }),
        error_sink,
      )?;
      shared.frames_rx = Some(frames_rx);
      shared.video_err_rx = Some(err_rx);
    }

    // Audio decoder failures only disable audio.
    let mut audio_enabled = false;
    if let Some(track) = &audio_track {
      if shared.audio_decoder.is_some() && shared.audio_out.is_some() {
        let config = AudioDecoderConfig::from_track(track);
        match configure_audio(&mut shared, config).await {
          Ok(()) => audio_enabled = true,
          Err(err) => {
            tracing::warn!(target: "player", error = %err, "audio disabled for this session");
            shared.send_event(PlayerEvent::AudioDisabled {
              reason: err.to_string(),
            });
          }
        }
      }
    }

    // Forward subtitle cues for the first exposed subtitle track.
    if shared.subtitle_handler.is_some() {
      if let Some(track) = demuxer.subtitle_tracks().first() {
        if let Err(err) = demuxer.select_subtitle_track(track.id) {
          tracing::warn!(target: "player", error = %err, "subtitle selection failed");
        }
      }
    }

    let (sink, events) = event_channel();
    demuxer.start_extraction(sink)?;

    shared.pipeline = match container {
      ContainerFormat::Mp4 => Pipeline::Mp4,
      ContainerFormat::Mkv => Pipeline::Mkv,
      ContainerFormat::Ts => Pipeline::Ts,
    };
    shared.demuxer = Some(demuxer);
    shared.video_track = video_track.clone();
    shared.audio_track = audio_track.clone();
    shared.audio_enabled = audio_enabled;
    shared.waiting_for_audio = audio_enabled;
    shared.epoch = Instant::now();
    shared.session_start = Instant::now();
    shared.send_event(PlayerEvent::Loaded {
      video: video_track,
      audio: audio_track,
    });
    drop(shared);

    self.spawn_loops(events);
    Ok(())
  }

  async fn fall_back(&mut self, container: ContainerFormat, err: MediaError) -> Result<()> {
    if container.natively_playable() {
      tracing::warn!(target: "player", error = %err, "demux path failed, native element takes over");
      let mut shared = self.shared.lock().await;
      shared.pipeline = Pipeline::NativeElement;
      shared.send_event(PlayerEvent::NativeFallback {
        container,
        reason: err.to_string(),
      });
      Ok(())
    } else {
      tracing::error!(target: "player", error = %err, ?container, "no native fallback for this container");
      Err(err)
    }
  }

  fn spawn_loops(&mut self, mut events: EventStream) {
    let cancel = self.cancel.clone();
    let shared = self.shared.clone();
    self.tasks.push(tokio::spawn(async move {
      loop {
        let event = tokio::select! {
          _ = cancel.cancelled() => break,
          event = events.recv() => event,
        };
        let mut s = shared.lock().await;
        let done = event.is_none();
        match event {
          Some(DemuxEvent::VideoChunk(chunk)) => s.video_queue.push_back(chunk),
          Some(DemuxEvent::AudioChunk(chunk)) => s.audio_queue.push_back(chunk),
          Some(DemuxEvent::Subtitle(cue)) => {
            if let Some(handler) = &mut s.subtitle_handler {
              handler(cue);
            }
          }
          Some(DemuxEvent::VideoEnd) => s.video_eos = true,
          Some(DemuxEvent::AudioEnd) => s.audio_eos = true,
          Some(DemuxEvent::Error(err)) => {
            s.send_event(PlayerEvent::Error(err.to_string()));
          }
          None => {}
        }
        s.advance().await;
        if done {
          break;
        }
      }
    }));

    let cancel = self.cancel.clone();
    let shared = self.shared.clone();
    self.tasks.push(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(RENDER_TICK);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {}
        }
        let mut s = shared.lock().await;
        s.render_tick();
        s.advance().await;
      }
    }));
  }

  /// Pause presentation and extraction.
  pub async fn pause(&self) {
    let mut s = self.shared.lock().await;
    if s.paused {
      return;
    }
    s.paused = true;
    let wall = s.wall_now_ms();
    s.clock.pause(wall);
    if let Some(demuxer) = &s.demuxer {
      demuxer.pause_extraction();
    }
    s.extraction_paused = true;
  }

  /// Resume presentation; extraction resumes subject to back-pressure.
  pub async fn resume(&self) {
    let mut s = self.shared.lock().await;
    if !s.paused {
      return;
    }
    s.paused = false;
    let wall = s.wall_now_ms();
    s.clock.resume(wall);
    if let Some(demuxer) = &s.demuxer {
      demuxer.resume_extraction();
    }
    s.extraction_paused = false;
  }

  /// Change the playback rate (> 0); media time stays continuous.
  pub async fn set_rate(&self, rate: f64) -> Result<()> {
    if rate <= 0.0 {
      return Err(MediaError::InvalidState("rate must be positive".into()));
    }
    let mut s = self.shared.lock().await;
    let wall = s.wall_now_ms();
    s.clock.set_rate(rate, wall);
    Ok(())
  }

  /// Tear the session down: cancel loops, stop the demuxer (aborting the
  /// byte source), drain and close every queued resource.
  pub async fn stop(&mut self) {
    self.cancel.cancel();
    let _ = futures::future::join_all(self.tasks.drain(..)).await;
    self.cancel = CancellationToken::new();

    let mut s = self.shared.lock().await;
    if let Some(mut demuxer) = s.demuxer.take() {
      demuxer.stop().await;
    }
    // Close frames and PCM still in flight from the decoders.
    s.audio_enabled = false;
    s.drain_decoded();
    for mut frame in s.frame_ring.drain() {
      frame.close();
    }
    s.video_queue.clear();
    s.audio_queue.clear();
    s.video_decoder.close();
    if let Some(decoder) = &mut s.audio_decoder {
      decoder.close();
    }
    if let Some(out) = &mut s.audio_out {
      out.stop_all();
    }
    s.pipeline = Pipeline::None;
    s.clock = MediaClock::new();
    s.scheduler.reset();
  }
}

async fn configure_audio(shared: &mut Shared, config: AudioDecoderConfig) -> Result<()> {
  let decoder = shared
    .audio_decoder
    .as_mut()
    .ok_or_else(|| MediaError::Unsupported("no audio decoder".into()))?;
  let support = decoder.is_config_supported(&config).await?;
  if !support.supported {
    return Err(MediaError::Unsupported(format!(
      "audio codec {}",
      config.codec
    )));
  }
  let (data_tx, data_rx) = mpsc::unbounded_channel();
  let (err_tx, err_rx) = mpsc::unbounded_channel();
  decoder.configure(
    support.config,
    Box::new(move |data| {
      let _ = data_tx.send(data);
    }),
    Box::new(move |err| {
      let _ = err_tx.send(err);
    }),
  )?;
  shared.audio_rx = Some(data_rx);
  shared.audio_err_rx = Some(err_rx);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decode::stub::{StubAudioDecoder, StubVideoDecoder};
  use crate::media::{ChunkKind, TrackKind};
  use async_trait::async_trait;
  use bytes::Bytes;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex as StdMutex;

  /// Route tracing from every subsystem into the test harness; honors
  /// RUST_LOG when set.
  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  struct StubDemuxer {
    video: Option<TrackDescriptor>,
    audio: Option<TrackDescriptor>,
    script: StdMutex<Vec<DemuxEvent>>,
    fail_open: bool,
    pauses: Arc<AtomicUsize>,
    resumes: Arc<AtomicUsize>,
  }

  impl StubDemuxer {
    fn video_only(script: Vec<DemuxEvent>) -> Self {
      Self {
        video: Some(TrackDescriptor::new(1, TrackKind::Video, "avc1.42C01E")),
        audio: None,
        script: StdMutex::new(script),
        fail_open: false,
        pauses: Arc::new(AtomicUsize::new(0)),
        resumes: Arc::new(AtomicUsize::new(0)),
      }
    }

    fn failing() -> Self {
      Self {
        video: None,
        audio: None,
        script: StdMutex::new(Vec::new()),
        fail_open: true,
        pauses: Arc::new(AtomicUsize::new(0)),
        resumes: Arc::new(AtomicUsize::new(0)),
      }
    }
  }

  #[async_trait]
  impl Demuxer for StubDemuxer {
    async fn open(&mut self) -> Result<()> {
      if self.fail_open {
        Err(MediaError::format("synthetic open failure"))
      } else {
        Ok(())
      }
    }

    fn video_track(&self) -> Option<TrackDescriptor> {
      self.video.clone()
    }

    fn audio_track(&self) -> Option<TrackDescriptor> {
      self.audio.clone()
    }

    fn start_extraction(&mut self, sink: crate::demux::EventSink) -> Result<()> {
      for event in self.script.lock().unwrap().drain(..) {
        let _ = sink.send(event);
      }
      Ok(())
    }

    fn pause_extraction(&self) {
      self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_extraction(&self) {
      self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&mut self) {}
  }

  struct RecordingRenderer(Arc<StdMutex<Vec<i64>>>);

  impl VideoRenderer for RecordingRenderer {
    fn render(&mut self, frame: &mut VideoFrame) {
      self.0.lock().unwrap().push(frame.timestamp_us);
    }
  }

  struct NullOutput;

  impl AudioOutput for NullOutput {
    fn sample_rate(&self) -> u32 {
      48_000
    }
    fn current_time(&self) -> f64 {
      0.0
    }
    fn schedule(&mut self, _b: audio::AudioBlock, _w: f64, _o: f64, _d: f64) {}
    fn stop_all(&mut self) {}
  }

  fn video_chunk(ts: i64) -> DemuxEvent {
    DemuxEvent::VideoChunk(EncodedVideoChunk {
      kind: if ts == 0 { ChunkKind::Key } else { ChunkKind::Delta },
      timestamp_us: ts,
      duration_us: 40_000,
      data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
    })
  }

  async fn wait_for_ended(events: &mut UnboundedReceiver<PlayerEvent>) {
    tokio::time::timeout(Duration::from_secs(60), async {
      while let Some(event) = events.recv().await {
        if matches!(event, PlayerEvent::Ended) {
          return;
        }
      }
      panic!("event stream closed before Ended");
    })
    .await
    .expect("session never ended");
  }

  #[tokio::test(start_paused = true)]
  async fn frames_render_in_timestamp_order_and_close() {
    init_tracing();
    let rendered = Arc::new(StdMutex::new(Vec::new()));
    let decoder = StubVideoDecoder::new(true);
    let closes = decoder.closes.clone();
    let mut player = Player::new(PlayerInit {
      video_decoder: Box::new(decoder),
      audio_decoder: None,
      renderer: Box::new(RecordingRenderer(rendered.clone())),
      audio_output: None,
      subtitle_output: None,
    });
    let mut events = player.take_events().unwrap();

    let script = vec![
      video_chunk(0),
      video_chunk(40_000),
      video_chunk(80_000),
      DemuxEvent::VideoEnd,
    ];
    player
      .load_with(Box::new(StubDemuxer::video_only(script)), ContainerFormat::Mp4)
      .await
      .unwrap();
    assert_eq!(player.pipeline().await, Pipeline::Mp4);

    assert!(matches!(
      events.recv().await,
      Some(PlayerEvent::Loaded { video: Some(_), audio: None })
    ));
    wait_for_ended(&mut events).await;
    player.stop().await;

    assert_eq!(&*rendered.lock().unwrap(), &[0, 40_000, 80_000]);
    // Every decoded frame was closed exactly once (rendered or evicted).
    assert_eq!(closes.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn deep_queues_pause_and_resume_extraction() {
    init_tracing();
    let rendered = Arc::new(StdMutex::new(Vec::new()));
    let mut player = Player::new(PlayerInit {
      video_decoder: Box::new(StubVideoDecoder::new(true)),
      audio_decoder: None,
      renderer: Box::new(RecordingRenderer(rendered)),
      audio_output: None,
      subtitle_output: None,
    });
    let mut events = player.take_events().unwrap();

    let mut script: Vec<DemuxEvent> = (0..200i64).map(|i| video_chunk(i * 10_000)).collect();
    script.push(DemuxEvent::VideoEnd);
    let demuxer = StubDemuxer::video_only(script);
    let pauses = demuxer.pauses.clone();
    let resumes = demuxer.resumes.clone();

    player
      .load_with(Box::new(demuxer), ContainerFormat::Mp4)
      .await
      .unwrap();
    wait_for_ended(&mut events).await;
    player.stop().await;

    assert!(pauses.load(Ordering::SeqCst) >= 1, "high water never hit");
    assert!(resumes.load(Ordering::SeqCst) >= 1, "low water never resumed");
  }

  #[tokio::test(start_paused = true)]
  async fn unsupported_audio_disables_audio_but_keeps_video() {
    init_tracing();
    let rendered = Arc::new(StdMutex::new(Vec::new()));
    let mut player = Player::new(PlayerInit {
      video_decoder: Box::new(StubVideoDecoder::new(true)),
      audio_decoder: Some(Box::new(StubAudioDecoder::new(false))),
      renderer: Box::new(RecordingRenderer(rendered.clone())),
      audio_output: Some(Box::new(NullOutput)),
      subtitle_output: None,
    });
    let mut events = player.take_events().unwrap();

    let mut demuxer = StubDemuxer::video_only(vec![
      video_chunk(0),
      DemuxEvent::VideoEnd,
      DemuxEvent::AudioEnd,
    ]);
    demuxer.audio = Some({
      let mut t = TrackDescriptor::new(2, TrackKind::Audio, "mp4a.40.2");
      t.sample_rate = Some(48_000);
      t.channels = Some(2);
      t
    });

    player
      .load_with(Box::new(demuxer), ContainerFormat::Mp4)
      .await
      .unwrap();

    let mut saw_disabled = false;
    tokio::time::timeout(Duration::from_secs(60), async {
      while let Some(event) = events.recv().await {
        match event {
          PlayerEvent::AudioDisabled { .. } => saw_disabled = true,
          PlayerEvent::Ended => break,
          _ => {}
        }
      }
    })
    .await
    .unwrap();
    player.stop().await;

    assert!(saw_disabled);
    assert_eq!(&*rendered.lock().unwrap(), &[0]);
  }

  #[tokio::test(start_paused = true)]
  async fn mp4_open_failure_falls_back_to_native_element() {
    init_tracing();
    let mut player = Player::new(PlayerInit {
      video_decoder: Box::new(StubVideoDecoder::new(true)),
      audio_decoder: None,
      renderer: Box::new(RecordingRenderer(Arc::new(StdMutex::new(Vec::new())))),
      audio_output: None,
      subtitle_output: None,
    });
    let mut events = player.take_events().unwrap();

    player
      .load_with(Box::new(StubDemuxer::failing()), ContainerFormat::Mp4)
      .await
      .unwrap();
    assert_eq!(player.pipeline().await, Pipeline::NativeElement);
    assert!(matches!(
      events.recv().await,
      Some(PlayerEvent::NativeFallback { container: ContainerFormat::Mp4, .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn mkv_open_failure_is_fatal() {
    init_tracing();
    let mut player = Player::new(PlayerInit {
      video_decoder: Box::new(StubVideoDecoder::new(true)),
      audio_decoder: None,
      renderer: Box::new(RecordingRenderer(Arc::new(StdMutex::new(Vec::new())))),
      audio_output: None,
      subtitle_output: None,
    });

    let result = player
      .load_with(Box::new(StubDemuxer::failing()), ContainerFormat::Mkv)
      .await;
    assert!(result.is_err());
    assert_eq!(player.pipeline().await, Pipeline::None);
  }

  #[tokio::test(start_paused = true)]
  async fn pause_latches_presentation() {
    init_tracing();
    let rendered = Arc::new(StdMutex::new(Vec::new()));
    let mut player = Player::new(PlayerInit {
      video_decoder: Box::new(StubVideoDecoder::new(true)),
      audio_decoder: None,
      renderer: Box::new(RecordingRenderer(rendered.clone())),
      audio_output: None,
      subtitle_output: None,
    });
    let mut events = player.take_events().unwrap();

    // A far-future frame that must not render while paused.
    let script = vec![video_chunk(0), video_chunk(3_600_000_000), DemuxEvent::VideoEnd];
    player
      .load_with(Box::new(StubDemuxer::video_only(script)), ContainerFormat::Mp4)
      .await
      .unwrap();
    assert!(matches!(events.recv().await, Some(PlayerEvent::Loaded { .. })));

    tokio::time::sleep(Duration::from_millis(100)).await;
    player.pause().await;
    let rendered_at_pause = rendered.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rendered.lock().unwrap().len(), rendered_at_pause);
    player.stop().await;
  }
}
