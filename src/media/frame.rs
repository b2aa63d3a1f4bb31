//! Decoded surfaces and PCM blocks.
//!
//! Both carry an exclusive handle that must be closed exactly once: frames
//! on render or drop-oldest eviction, audio after its samples are copied
//! into a device buffer. The holders close on drop so an early teardown
//! cannot leak decoder-owned memory.

use std::fmt;

/// Decoder-owned video surface. Implementations release GPU/decoder memory
/// in `close`; it is called at most once.
pub trait DecodedSurface: Send {
  fn close(&mut self);
}

/// Opaque decoded video frame with exclusive ownership of its surface.
pub struct VideoFrame {
  pub timestamp_us: i64,
  surface: Option<Box<dyn DecodedSurface>>,
}

impl VideoFrame {
  pub fn new(timestamp_us: i64, surface: Box<dyn DecodedSurface>) -> Self {
    Self {
      timestamp_us,
      surface: Some(surface),
    }
  }

  /// Borrow the surface for rendering. None once closed.
  pub fn surface(&mut self) -> Option<&mut Box<dyn DecodedSurface>> {
    self.surface.as_mut()
  }

  /// Release the underlying surface. Idempotent.
  pub fn close(&mut self) {
    if let Some(mut surface) = self.surface.take() {
      surface.close();
    }
  }
}

impl Drop for VideoFrame {
  fn drop(&mut self) {
    self.close();
  }
}

impl fmt::Debug for VideoFrame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("VideoFrame")
      .field("timestamp_us", &self.timestamp_us)
      .field("closed", &self.surface.is_none())
      .finish()
  }
}

/// Decoded PCM block: interleaved f32 samples.
pub struct AudioData {
  pub timestamp_us: i64,
  pub sample_rate: u32,
  pub channels: u32,
  samples: Option<Vec<f32>>,
}

impl AudioData {
  pub fn new(timestamp_us: i64, sample_rate: u32, channels: u32, samples: Vec<f32>) -> Self {
    debug_assert!(channels > 0 && sample_rate > 0);
    Self {
      timestamp_us,
      sample_rate,
      channels,
      samples: Some(samples),
    }
  }

  /// Frames (samples per channel) in this block.
  pub fn frame_count(&self) -> usize {
    self
      .samples
      .as_ref()
      .map(|s| s.len() / self.channels.max(1) as usize)
      .unwrap_or(0)
  }

  /// Block duration in seconds.
  pub fn duration_sec(&self) -> f64 {
    self.frame_count() as f64 / self.sample_rate as f64
  }

  /// Interleaved samples. None once closed.
  pub fn samples(&self) -> Option<&[f32]> {
    self.samples.as_deref()
  }

  /// Release the PCM. Idempotent.
  pub fn close(&mut self) {
    self.samples = None;
  }
}

impl fmt::Debug for AudioData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AudioData")
      .field("timestamp_us", &self.timestamp_us)
      .field("sample_rate", &self.sample_rate)
      .field("channels", &self.channels)
      .field("frames", &self.frame_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  struct CountingSurface(Arc<AtomicUsize>);

  impl DecodedSurface for CountingSurface {
    fn close(&mut self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn frame_closes_exactly_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut frame = VideoFrame::new(0, Box::new(CountingSurface(closes.clone())));
    frame.close();
    frame.close();
    drop(frame);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn frame_closes_on_drop() {
    let closes = Arc::new(AtomicUsize::new(0));
    {
      let _frame = VideoFrame::new(0, Box::new(CountingSurface(closes.clone())));
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn audio_data_duration() {
    let data = AudioData::new(0, 48_000, 2, vec![0.0; 960 * 2]);
    assert_eq!(data.frame_count(), 960);
    assert!((data.duration_sec() - 0.02).abs() < 1e-9);
  }
}
