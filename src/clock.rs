//! MediaClock - pausable, seekable, rate-scalable mapping from a wall clock
//! to a media timestamp.
//!
//! The wall clock is whatever the session anchors on: the audio device's
//! current time (when audio is live) or the monotonic system clock. Both are
//! fed in as `f64` milliseconds so the clock itself stays source-agnostic.

/// Maps wall-clock milliseconds to media microseconds.
///
/// While running: `now_us(w) = base_ts + (w - base_wall) * 1000 * rate`.
/// While paused the timestamp is latched.
#[derive(Debug, Clone)]
pub struct MediaClock {
  base_timestamp_us: i64,
  base_wall_ms: f64,
  rate: f64,
  paused_at_wall_ms: Option<f64>,
  paused_at_timestamp_us: i64,
  started: bool,
}

impl Default for MediaClock {
  fn default() -> Self {
    Self::new()
  }
}

impl MediaClock {
  pub fn new() -> Self {
    Self {
      base_timestamp_us: 0,
      base_wall_ms: 0.0,
      rate: 1.0,
      paused_at_wall_ms: None,
      paused_at_timestamp_us: 0,
      started: false,
    }
  }

  /// True once `start` has been called for this session.
  pub fn started(&self) -> bool {
    self.started
  }

  pub fn paused(&self) -> bool {
    self.paused_at_wall_ms.is_some()
  }

  pub fn rate(&self) -> f64 {
    self.rate
  }

  /// Media timestamp of the current anchor.
  pub fn base_timestamp_us(&self) -> i64 {
    self.base_timestamp_us
  }

  /// Wall time of the current anchor, in milliseconds.
  pub fn base_wall_ms(&self) -> f64 {
    self.base_wall_ms
  }

  /// Anchor the clock: media time `ts_us` corresponds to wall time `wall_ms`.
  pub fn start(&mut self, ts_us: i64, wall_ms: f64) {
    self.base_timestamp_us = ts_us;
    self.base_wall_ms = wall_ms;
    self.paused_at_wall_ms = None;
    self.started = true;
  }

  /// Latch the current media time. No-op when already paused.
  pub fn pause(&mut self, wall_ms: f64) {
    if self.paused_at_wall_ms.is_some() {
      return;
    }
    self.paused_at_timestamp_us = self.now_us(wall_ms);
    self.paused_at_wall_ms = Some(wall_ms);
  }

  /// Resume from the latched timestamp. No-op when not paused.
  pub fn resume(&mut self, wall_ms: f64) {
    if self.paused_at_wall_ms.take().is_some() {
      self.base_timestamp_us = self.paused_at_timestamp_us;
      self.base_wall_ms = wall_ms;
    }
  }

  /// Reset both anchors without changing the paused state.
  pub fn seek(&mut self, ts_us: i64, wall_ms: f64) {
    self.base_timestamp_us = ts_us;
    self.base_wall_ms = wall_ms;
    self.paused_at_timestamp_us = ts_us;
    if self.paused_at_wall_ms.is_some() {
      self.paused_at_wall_ms = Some(wall_ms);
    }
  }

  /// Change the playback rate, rebasing so media time is continuous across
  /// the change.
  pub fn set_rate(&mut self, rate: f64, wall_ms: f64) {
    debug_assert!(rate > 0.0);
    if self.paused_at_wall_ms.is_none() {
      self.base_timestamp_us = self.now_us(wall_ms);
      self.base_wall_ms = wall_ms;
    }
    self.rate = rate;
  }

  /// Current media time for the given wall time.
  pub fn now_us(&self, wall_ms: f64) -> i64 {
    if self.paused_at_wall_ms.is_some() {
      return self.paused_at_timestamp_us;
    }
    let elapsed_ms = wall_ms - self.base_wall_ms;
    self.base_timestamp_us + (elapsed_ms * 1000.0 * self.rate).round() as i64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn running_clock_advances_linearly() {
    let mut clock = MediaClock::new();
    clock.start(1_000_000, 500.0);
    assert_eq!(clock.now_us(500.0), 1_000_000);
    assert_eq!(clock.now_us(600.0), 1_100_000);
    // delta(now_us) == delta(wall) * 1000 * rate
    let d = clock.now_us(900.0) - clock.now_us(600.0);
    assert_eq!(d, 300 * 1000);
  }

  #[test]
  fn pause_latches_and_resume_restores() {
    let mut clock = MediaClock::new();
    clock.start(0, 0.0);
    clock.pause(250.0);
    assert_eq!(clock.now_us(250.0), 250_000);
    // Constant while paused, regardless of wall time.
    assert_eq!(clock.now_us(9_999.0), 250_000);

    clock.resume(1_000.0);
    // Immediately after resume the timestamp is unchanged.
    assert_eq!(clock.now_us(1_000.0), 250_000);
    assert_eq!(clock.now_us(1_100.0), 350_000);
  }

  #[test]
  fn pause_resume_without_time_advance_is_idempotent() {
    let mut clock = MediaClock::new();
    clock.start(42_000, 100.0);
    let before = clock.now_us(200.0);
    clock.pause(200.0);
    clock.resume(200.0);
    clock.pause(200.0);
    clock.resume(200.0);
    assert_eq!(clock.now_us(200.0), before);
  }

  #[test]
  fn set_rate_keeps_time_continuous() {
    let mut clock = MediaClock::new();
    clock.start(0, 0.0);
    let at_change = clock.now_us(1_000.0);
    clock.set_rate(2.0, 1_000.0);
    assert_eq!(clock.now_us(1_000.0), at_change);
    // Afterwards it advances at double speed.
    assert_eq!(clock.now_us(1_100.0) - at_change, 200_000);
  }

  #[test]
  fn seek_resets_anchors() {
    let mut clock = MediaClock::new();
    clock.start(0, 0.0);
    clock.seek(5_000_000, 2_000.0);
    assert_eq!(clock.now_us(2_000.0), 5_000_000);
    assert_eq!(clock.now_us(2_500.0), 5_500_000);

    // Seeking while paused does not unpause.
    clock.pause(3_000.0);
    clock.seek(1_000_000, 3_500.0);
    assert!(clock.paused());
    assert_eq!(clock.now_us(4_000.0), 1_000_000);
  }
}
