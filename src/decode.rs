//! Decoder capability contract.
//!
//! Video/audio decoders are external black boxes: the orchestrator queries
//! configuration support, submits encoded chunks, and receives decoded
//! output through sinks. Output and error sinks must never call back into
//! the player synchronously; channel-backed sinks keep that property.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{MediaError, Result};
use crate::media::{AudioData, EncodedAudioChunk, EncodedVideoChunk, TrackDescriptor, VideoFrame};

/// Video decoder configuration derived from a [`TrackDescriptor`].
#[derive(Debug, Clone)]
pub struct VideoDecoderConfig {
  pub codec: String,
  pub coded_width: u32,
  pub coded_height: u32,
  /// Codec-specific description (avcC/hvcC/vpcC/av1C).
  pub description: Option<Bytes>,
}

impl VideoDecoderConfig {
  pub fn from_track(track: &TrackDescriptor) -> Self {
    Self {
      codec: track.codec.clone(),
      coded_width: track.width.unwrap_or(0),
      coded_height: track.height.unwrap_or(0),
      description: track.description.clone(),
    }
  }
}

/// Audio decoder configuration derived from a [`TrackDescriptor`].
#[derive(Debug, Clone)]
pub struct AudioDecoderConfig {
  pub codec: String,
  pub sample_rate: u32,
  pub number_of_channels: u32,
  /// Codec-specific description (AudioSpecificConfig, OpusHead, …).
  pub description: Option<Bytes>,
}

impl AudioDecoderConfig {
  pub fn from_track(track: &TrackDescriptor) -> Self {
    Self {
      codec: track.codec.clone(),
      sample_rate: track.sample_rate.unwrap_or(0),
      number_of_channels: track.channels.unwrap_or(0),
      description: track.description.clone(),
    }
  }
}

/// Capability-query result: whether the configuration is supported, plus
/// the decoder's normalized view of it.
#[derive(Debug, Clone)]
pub struct DecoderSupport<C> {
  pub supported: bool,
  pub config: C,
}

pub type VideoFrameSink = Box<dyn FnMut(VideoFrame) + Send>;
pub type AudioDataSink = Box<dyn FnMut(AudioData) + Send>;
pub type DecodeErrorSink = Box<dyn FnMut(MediaError) + Send>;

/// External video decoder.
#[async_trait]
pub trait VideoDecoder: Send {
  async fn is_config_supported(
    &self,
    config: &VideoDecoderConfig,
  ) -> Result<DecoderSupport<VideoDecoderConfig>>;

  /// Configure for decoding; decoded frames and runtime errors flow through
  /// the sinks. Implementations must accept a fresh `configure` after
  /// `close` so the session owner can reuse one decoder across loads.
  fn configure(
    &mut self,
    config: VideoDecoderConfig,
    output: VideoFrameSink,
    error: DecodeErrorSink,
  ) -> Result<()>;

  /// Submit one chunk. Chunks for a track arrive in non-decreasing
  /// timestamp order.
  fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<()>;

  /// Chunks submitted but not yet decoded.
  fn decode_queue_size(&self) -> usize;

  /// Drain everything submitted; best effort at end of stream.
  async fn flush(&mut self) -> Result<()>;

  /// Drop queued work without closing.
  fn reset(&mut self);

  fn close(&mut self);
}

/// External audio decoder.
#[async_trait]
pub trait AudioDecoder: Send {
  async fn is_config_supported(
    &self,
    config: &AudioDecoderConfig,
  ) -> Result<DecoderSupport<AudioDecoderConfig>>;

  fn configure(
    &mut self,
    config: AudioDecoderConfig,
    output: AudioDataSink,
    error: DecodeErrorSink,
  ) -> Result<()>;

  fn decode(&mut self, chunk: EncodedAudioChunk) -> Result<()>;

  fn decode_queue_size(&self) -> usize;

  async fn flush(&mut self) -> Result<()>;

  fn reset(&mut self);

  fn close(&mut self);
}

/// Synchronous pass-through decoders for exercising the orchestrator in
/// tests: every chunk becomes one frame/block immediately.
#[cfg(test)]
pub(crate) mod stub {
  use super::*;
  use crate::media::DecodedSurface;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  pub struct StubSurface(pub Arc<AtomicUsize>);

  impl DecodedSurface for StubSurface {
    fn close(&mut self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  pub struct StubVideoDecoder {
    pub supported: bool,
    pub closes: Arc<AtomicUsize>,
    output: Option<VideoFrameSink>,
  }

  // `output` is only ever touched from `&mut self` methods; the async_trait
  // methods that take `&self` (`is_config_supported`) never read it. Safe to
  // assert `Sync` so the generated futures satisfy the trait's `Send` bound.
  unsafe impl Sync for StubVideoDecoder {}

  impl StubVideoDecoder {
    pub fn new(supported: bool) -> Self {
      Self {
        supported,
        closes: Arc::new(AtomicUsize::new(0)),
        output: None,
      }
    }
  }

  #[async_trait]
  impl VideoDecoder for StubVideoDecoder {
    async fn is_config_supported(
      &self,
      config: &VideoDecoderConfig,
    ) -> Result<DecoderSupport<VideoDecoderConfig>> {
      Ok(DecoderSupport {
        supported: self.supported,
        config: config.clone(),
      })
    }

    fn configure(
      &mut self,
      _config: VideoDecoderConfig,
      output: VideoFrameSink,
      _error: DecodeErrorSink,
    ) -> Result<()> {
      self.output = Some(output);
      Ok(())
    }

    fn decode(&mut self, chunk: EncodedVideoChunk) -> Result<()> {
      let closes = self.closes.clone();
      if let Some(output) = &mut self.output {
        output(VideoFrame::new(
          chunk.timestamp_us,
          Box::new(StubSurface(closes)),
        ));
      }
      Ok(())
    }

    fn decode_queue_size(&self) -> usize {
      0
    }

    async fn flush(&mut self) -> Result<()> {
      Ok(())
    }

    fn reset(&mut self) {}

    fn close(&mut self) {
      self.output = None;
    }
  }

  pub struct StubAudioDecoder {
    pub supported: bool,
    pub sample_rate: u32,
    pub channels: u32,
    pub frames_per_chunk: usize,
    output: Option<AudioDataSink>,
  }

  // See `StubVideoDecoder`'s `Sync` impl: `output` is never touched from
  // the `&self` async methods.
  unsafe impl Sync for StubAudioDecoder {}

  impl StubAudioDecoder {
    pub fn new(supported: bool) -> Self {
      Self {
        supported,
        sample_rate: 48_000,
        channels: 2,
        frames_per_chunk: 960,
        output: None,
      }
    }
  }

  #[async_trait]
  impl AudioDecoder for StubAudioDecoder {
    async fn is_config_supported(
      &self,
      config: &AudioDecoderConfig,
    ) -> Result<DecoderSupport<AudioDecoderConfig>> {
      Ok(DecoderSupport {
        supported: self.supported,
        config: config.clone(),
      })
    }

    fn configure(
      &mut self,
      _config: AudioDecoderConfig,
      output: AudioDataSink,
      _error: DecodeErrorSink,
    ) -> Result<()> {
      self.output = Some(output);
      Ok(())
    }

    fn decode(&mut self, chunk: EncodedAudioChunk) -> Result<()> {
      if let Some(output) = &mut self.output {
        let samples = vec![0.0f32; self.frames_per_chunk * self.channels as usize];
        output(AudioData::new(
          chunk.timestamp_us,
          self.sample_rate,
          self.channels,
          samples,
        ));
      }
      Ok(())
    }

    fn decode_queue_size(&self) -> usize {
      0
    }

    async fn flush(&mut self) -> Result<()> {
      Ok(())
    }

    fn reset(&mut self) {}

    fn close(&mut self) {
      self.output = None;
    }
  }
}
