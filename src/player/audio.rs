//! Audio output scheduling.
//!
//! Decoded PCM blocks are copied onto the device timeline so that the audio
//! clock doubles as the session's wall clock. Blocks landing entirely in
//! the past are dropped; blocks landing partially late are trimmed, never
//! deferred.

use crate::clock::MediaClock;
use crate::media::AudioData;

/// Delay applied before the very first scheduled block, giving the decoder
/// a head start against the device clock.
const START_DELAY_SEC: f64 = 0.05;

/// A device-clock regression beyond this is treated as a device reset and
/// re-anchors the media clock.
const DEVICE_RESET_SEC: f64 = 0.25;

/// PCM block handed to the audio device.
pub struct AudioBlock {
  /// Interleaved samples.
  pub samples: Vec<f32>,
  pub channels: u32,
  pub sample_rate: u32,
}

/// Audio output device. The implementation owns the real output (an audio
/// context, a sound server connection); the scheduler only needs its clock
/// and a way to queue buffers on it.
pub trait AudioOutput: Send {
  /// Device output sample rate.
  fn sample_rate(&self) -> u32;

  /// Device clock in seconds. Monotonic while the device runs.
  fn current_time(&self) -> f64;

  /// Queue `block` to start playing at `when_sec` on the device clock,
  /// skipping the first `offset_sec` of the buffer and playing
  /// `duration_sec` from there.
  fn schedule(&mut self, block: AudioBlock, when_sec: f64, offset_sec: f64, duration_sec: f64);

  /// Stop every scheduled source.
  fn stop_all(&mut self);
}

/// What [`AudioScheduler::schedule_block`] did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
  Scheduled,
  /// The block's whole window was already in the past.
  DroppedLate,
}

/// Implements the audio-anchored scheduling policy.
pub struct AudioScheduler {
  last_scheduled_end_sec: f64,
  last_device_time: f64,
}

impl Default for AudioScheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl AudioScheduler {
  pub fn new() -> Self {
    Self {
      last_scheduled_end_sec: 0.0,
      last_device_time: 0.0,
    }
  }

  /// Seconds of audio queued beyond the device's current time. The pump
  /// stops decoding ahead once this exceeds its lookahead limit.
  pub fn scheduled_lookahead_sec(&self, output: &dyn AudioOutput) -> f64 {
    (self.last_scheduled_end_sec - output.current_time()).max(0.0)
  }

  pub fn reset(&mut self) {
    self.last_scheduled_end_sec = 0.0;
    self.last_device_time = 0.0;
  }

  /// Copy one decoded block onto the device timeline.
  ///
  /// Starts the media clock off the first block (with a small start delay)
  /// and re-anchors if the device clock reset. The block is closed in every
  /// outcome.
  pub fn schedule_block(
    &mut self,
    output: &mut dyn AudioOutput,
    clock: &mut MediaClock,
    mut data: AudioData,
  ) -> ScheduleOutcome {
    let device_now = output.current_time();
    if device_now + DEVICE_RESET_SEC < self.last_device_time {
      tracing::warn!(target: "player::audio", "audio device clock reset, re-anchoring");
      self.last_scheduled_end_sec = 0.0;
      clock.start(data.timestamp_us, (device_now + START_DELAY_SEC) * 1000.0);
    }
    self.last_device_time = device_now;

    if !clock.started() {
      clock.start(data.timestamp_us, (device_now + START_DELAY_SEC) * 1000.0);
    }

    let duration_sec = data.duration_sec();
    let base_time_sec = clock.base_wall_ms() / 1000.0;
    let ideal_start_sec =
      base_time_sec + (data.timestamp_us - clock.base_timestamp_us()) as f64 / 1_000_000.0;
    let min_start_sec = device_now.max(self.last_scheduled_end_sec);
    let offset_sec = (min_start_sec - ideal_start_sec).max(0.0);

    if offset_sec >= duration_sec {
      tracing::debug!(
        target: "player::audio",
        timestamp_us = data.timestamp_us,
        offset_sec,
        "dropping late audio block"
      );
      data.close();
      return ScheduleOutcome::DroppedLate;
    }

    let samples = data.samples().map(<[f32]>::to_vec).unwrap_or_default();
    let block = AudioBlock {
      samples,
      channels: data.channels,
      sample_rate: data.sample_rate,
    };
    output.schedule(
      block,
      ideal_start_sec + offset_sec,
      offset_sec,
      duration_sec - offset_sec,
    );
    self.last_scheduled_end_sec = self.last_scheduled_end_sec.max(ideal_start_sec + duration_sec);
    data.close();
    ScheduleOutcome::Scheduled
  }
}
