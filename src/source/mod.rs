//! Byte sources - random-access read-only views over a sized byte stream.
//!
//! The demuxers only ever see this trait: a fixed length, async range reads,
//! and an abort switch that fails everything in flight. Local files and
//! in-memory blobs use [`MemoryByteSource`]; URLs use
//! [`http::HttpByteSource`].

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{MediaError, Result};

/// Random-access read-only view over a sized byte stream.
///
/// Implementations must be safe under concurrent `slice` calls: the demuxers
/// issue sequential small reads plus occasional seeks, and the MP4 pull loop
/// may overlap with sample reads.
#[async_trait]
pub trait ByteSource: Send + Sync {
  /// Total size of the stream in bytes. Constant for the source's lifetime.
  fn len(&self) -> u64;

  /// True when the stream is empty.
  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Read the byte range `[start, end)`.
  ///
  /// Reads past the end are clamped. After [`abort`](ByteSource::abort) every
  /// call fails with [`MediaError::Aborted`].
  async fn slice(&self, start: u64, end: u64) -> Result<Bytes>;

  /// Cancel in-flight reads and mark subsequent reads failing.
  fn abort(&self);
}

/// In-memory byte source over an owned blob.
///
/// Slices are zero-copy (`Bytes` sub-ranges), independent and repeatable.
pub struct MemoryByteSource {
  data: Bytes,
  cancel: CancellationToken,
}

impl MemoryByteSource {
  pub fn new(data: impl Into<Bytes>) -> Self {
    Self {
      data: data.into(),
      cancel: CancellationToken::new(),
    }
  }
}

#[async_trait]
impl ByteSource for MemoryByteSource {
  fn len(&self) -> u64 {
    self.data.len() as u64
  }

  async fn slice(&self, start: u64, end: u64) -> Result<Bytes> {
    if self.cancel.is_cancelled() {
      return Err(MediaError::Aborted);
    }
    let len = self.data.len() as u64;
    let start = start.min(len) as usize;
    let end = end.clamp(start as u64, len) as usize;
    Ok(self.data.slice(start..end))
  }

  fn abort(&self) {
    self.cancel.cancel();
  }
}

/// Shared handle type the demuxers hold.
pub type SharedByteSource = Arc<dyn ByteSource>;
