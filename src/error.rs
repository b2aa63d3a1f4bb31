//! Error model for the player core.
//!
//! Mirrors the failure classes the pipeline distinguishes at runtime:
//! format errors are fatal to the current load, `Aborted` is swallowed after
//! teardown, decoder errors are scoped to their track.

use thiserror::Error;

/// Errors produced by byte sources, demuxers and the playback session.
#[derive(Debug, Error)]
pub enum MediaError {
  /// Malformed container data, missing sync, or no supported track.
  #[error("format error: {0}")]
  Format(String),

  /// A decoder rejected the track configuration.
  #[error("unsupported: {0}")]
  Unsupported(String),

  /// Underlying I/O failure from a byte source.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// HTTP transport failure from the URL byte source.
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// Read issued against an aborted source or a stopped session.
  #[error("aborted")]
  Aborted,

  /// Decoder runtime failure (after successful configuration).
  #[error("decoder error: {0}")]
  Decoder(String),

  /// API misuse, e.g. loading while a session is live.
  #[error("invalid state: {0}")]
  InvalidState(String),
}

impl MediaError {
  /// Shorthand for a [`MediaError::Format`] with a formatted message.
  pub fn format(msg: impl Into<String>) -> Self {
    MediaError::Format(msg.into())
  }

  /// True when this error is the expected result of `abort()`/`stop()` and
  /// should be swallowed rather than surfaced.
  pub fn is_aborted(&self) -> bool {
    matches!(self, MediaError::Aborted)
  }
}

pub type Result<T> = std::result::Result<T, MediaError>;
