//! Container demuxers and their shared surface.
//!
//! The three demuxers expose one shape: open, track queries, start/pause/
//! resume extraction, stop. Chunks and cues flow to the orchestrator through
//! a [`DemuxEvent`] channel; back-pressure flows the other way as
//! pause/resume calls on the shared [`ExtractControl`].

pub mod mkv;
pub mod mp4;
pub mod ts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::error::{MediaError, Result};
use crate::media::{EncodedAudioChunk, EncodedVideoChunk, SubtitleCue, TrackDescriptor};

/// Event stream from a demuxer to the orchestrator.
#[derive(Debug)]
pub enum DemuxEvent {
  VideoChunk(EncodedVideoChunk),
  AudioChunk(EncodedAudioChunk),
  Subtitle(SubtitleCue),
  /// Video track reached end of stream.
  VideoEnd,
  /// Audio track reached end of stream.
  AudioEnd,
  Error(MediaError),
}

pub type EventSink = mpsc::UnboundedSender<DemuxEvent>;
pub type EventStream = mpsc::UnboundedReceiver<DemuxEvent>;

pub fn event_channel() -> (EventSink, EventStream) {
  mpsc::unbounded_channel()
}

/// Cooperative pause/stop switch shared between the orchestrator and the
/// extraction loops.
///
/// `checkpoint()` is awaited at element/packet boundaries: it returns
/// immediately while running, parks on the resume signal while paused, and
/// fails with [`MediaError::Aborted`] once stopped. `resume`/`stop` wake all
/// registered waiters.
#[derive(Default)]
pub struct ExtractControl {
  paused: AtomicBool,
  stopped: AtomicBool,
  resume: Notify,
}

impl ExtractControl {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn pause(&self) {
    self.paused.store(true, Ordering::SeqCst);
  }

  pub fn resume(&self) {
    self.paused.store(false, Ordering::SeqCst);
    self.resume.notify_waiters();
  }

  pub fn stop(&self) {
    self.stopped.store(true, Ordering::SeqCst);
    self.resume.notify_waiters();
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::SeqCst)
  }

  /// Suspend while paused; error once stopped.
  pub async fn checkpoint(&self) -> Result<()> {
    loop {
      if self.is_stopped() {
        return Err(MediaError::Aborted);
      }
      if !self.is_paused() {
        return Ok(());
      }
      // Register interest before re-checking so a resume between the check
      // and the await cannot be missed.
      let notified = self.resume.notified();
      if self.is_stopped() {
        return Err(MediaError::Aborted);
      }
      if !self.is_paused() {
        return Ok(());
      }
      notified.await;
    }
  }
}

/// Common demuxer surface; the orchestrator stores one boxed instance.
#[async_trait]
pub trait Demuxer: Send {
  /// Parse headers far enough to answer track queries.
  async fn open(&mut self) -> Result<()>;

  /// First (selected) video track, if any.
  fn video_track(&self) -> Option<TrackDescriptor>;

  /// First (selected) audio track, if any.
  fn audio_track(&self) -> Option<TrackDescriptor>;

  /// Container duration when the headers declare one.
  fn duration_us(&self) -> Option<i64> {
    None
  }

  /// All exposed subtitle tracks. Empty for containers without subtitle
  /// support in this player.
  fn subtitle_tracks(&self) -> Vec<TrackDescriptor> {
    Vec::new()
  }

  /// Choose the subtitle track to extract. Must be called before
  /// `start_extraction`.
  fn select_subtitle_track(&mut self, _id: u64) -> Result<()> {
    Err(MediaError::InvalidState(
      "container has no subtitle tracks".into(),
    ))
  }

  /// Spawn the extraction loops, delivering into `sink`.
  fn start_extraction(&mut self, sink: EventSink) -> Result<()>;

  fn pause_extraction(&self);

  fn resume_extraction(&self);

  /// Stop extraction and abort the underlying byte source.
  async fn stop(&mut self);
}

/// Detected container kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
  Mp4,
  Mkv,
  Ts,
}

impl ContainerFormat {
  /// Whether a native media-element pipeline could take over when the
  /// demux path fails. MKV/TS have no such fallback.
  pub fn natively_playable(self) -> bool {
    matches!(self, ContainerFormat::Mp4)
  }
}

/// Detect the container from a path/URL suffix or an explicit media type.
pub fn detect_container(location: &str, media_type: Option<&str>) -> Option<ContainerFormat> {
  if let Some(mime) = media_type {
    let mime = mime.split(';').next().unwrap_or(mime).trim();
    match mime {
      "video/mp4" | "audio/mp4" | "video/quicktime" => return Some(ContainerFormat::Mp4),
      "video/webm" | "audio/webm" | "video/x-matroska" | "audio/x-matroska" => {
        return Some(ContainerFormat::Mkv)
      }
      "video/mp2t" => return Some(ContainerFormat::Ts),
      _ => {}
    }
  }

  let path = location
    .split(['?', '#'])
    .next()
    .unwrap_or(location)
    .to_ascii_lowercase();
  let ext = path.rsplit('.').next()?;
  match ext {
    "mp4" | "m4v" | "m4a" | "mov" => Some(ContainerFormat::Mp4),
    "mkv" | "mka" | "webm" => Some(ContainerFormat::Mkv),
    "ts" | "m2ts" | "mts" => Some(ContainerFormat::Ts),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detection_by_extension_and_mime() {
    assert_eq!(detect_container("movie.mp4", None), Some(ContainerFormat::Mp4));
    assert_eq!(
      detect_container("https://cdn.example/stream.mkv?token=1", None),
      Some(ContainerFormat::Mkv)
    );
    assert_eq!(detect_container("capture.m2ts", None), Some(ContainerFormat::Ts));
    assert_eq!(detect_container("file.bin", None), None);
    assert_eq!(
      detect_container("file.bin", Some("video/mp2t")),
      Some(ContainerFormat::Ts)
    );
    assert_eq!(
      detect_container("file.bin", Some("video/webm; codecs=vp9")),
      Some(ContainerFormat::Mkv)
    );
  }

  #[tokio::test]
  async fn checkpoint_passes_while_running_and_fails_when_stopped() {
    let control = ExtractControl::new();
    control.checkpoint().await.unwrap();
    control.stop();
    assert!(matches!(control.checkpoint().await, Err(MediaError::Aborted)));
  }

  #[tokio::test]
  async fn checkpoint_parks_until_resume() {
    let control = ExtractControl::new();
    control.pause();

    let waiter = {
      let control = control.clone();
      tokio::spawn(async move { control.checkpoint().await })
    };
    // Give the waiter a chance to park.
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    control.resume();
    waiter.await.unwrap().unwrap();
  }
}
