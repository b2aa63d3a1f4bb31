//! HTTP byte source with `Range` probing and full-download fallback.
//!
//! The probe issues a one-byte `Range: bytes=0-1` request. A `206` response
//! with a parseable `Content-Range` total enables true range reads; a server
//! that ignores `Range` but advertises `Accept-Ranges: bytes` is also taken
//! at its word. Everything else degrades to a single whole-resource fetch
//! cached in memory, which is acceptable only when the size is known up
//! front (`Content-Length` / `X-Content-Length`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE, REFERER};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{MediaError, Result};
use crate::source::ByteSource;

/// Request policy for the URL byte source.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
  /// `Referer` header value. `None` sends no referrer, the default for
  /// cross-origin sources.
  pub referer: Option<String>,
  /// Retries per request on top of the initial attempt.
  pub retries: u32,
  /// Exponential backoff base between attempts.
  pub backoff_base: Duration,
}

impl Default for RequestPolicy {
  fn default() -> Self {
    Self {
      referer: None,
      retries: 1,
      backoff_base: Duration::from_millis(300),
    }
  }
}

enum ReadMode {
  /// Server honors byte ranges; every `slice` is its own request.
  Range,
  /// Degraded mode: the whole resource is fetched once and cached.
  Full(Mutex<Option<Bytes>>),
}

/// [`ByteSource`] over an HTTP resource.
pub struct HttpByteSource {
  client: Client,
  url: String,
  size: u64,
  mode: ReadMode,
  policy: RequestPolicy,
  cancel: CancellationToken,
}

impl HttpByteSource {
  /// Probe `url` and build a source. Fails when neither range support nor a
  /// known content length is available.
  pub async fn open(url: impl Into<String>, policy: RequestPolicy) -> Result<Arc<Self>> {
    let url = url.into();
    let client = Client::new();
    let cancel = CancellationToken::new();

    let probe = send_with_retry(&client, &url, &policy, &cancel, Some((0, 1))).await?;
    let status = probe.status();
    let headers = probe.headers().clone();

    let content_range_total = headers
      .get(CONTENT_RANGE)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_content_range_total);

    if status == StatusCode::PARTIAL_CONTENT {
      if let Some(total) = content_range_total {
        return Ok(Arc::new(Self {
          client,
          url,
          size: total,
          mode: ReadMode::Range,
          policy,
          cancel,
        }));
      }
    }

    // Not a usable 206. Size must come from a length header.
    let size = content_length(&headers)
      .ok_or_else(|| MediaError::format("server reports neither range support nor a content length"))?;

    let accepts_ranges = headers
      .get(ACCEPT_RANGES)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.eq_ignore_ascii_case("bytes"))
      .unwrap_or(false);

    let mode = if accepts_ranges {
      ReadMode::Range
    } else {
      tracing::warn!(target: "source", url = %url, "server ignores Range, falling back to full download");
      ReadMode::Full(Mutex::new(None))
    };

    Ok(Arc::new(Self {
      client,
      url,
      size,
      mode,
      policy,
      cancel,
    }))
  }

  async fn fetch_full(&self) -> Result<Bytes> {
    let resp = send_with_retry(&self.client, &self.url, &self.policy, &self.cancel, None).await?;
    let body = tokio::select! {
      _ = self.cancel.cancelled() => return Err(MediaError::Aborted),
      body = resp.bytes() => body?,
    };
    Ok(body)
  }
}

#[async_trait]
impl ByteSource for HttpByteSource {
  fn len(&self) -> u64 {
    self.size
  }

  async fn slice(&self, start: u64, end: u64) -> Result<Bytes> {
    if self.cancel.is_cancelled() {
      return Err(MediaError::Aborted);
    }
    let start = start.min(self.size);
    let end = end.clamp(start, self.size);
    if start == end {
      return Ok(Bytes::new());
    }

    match &self.mode {
      ReadMode::Range => {
        // Range header is inclusive on both ends.
        let resp = send_with_retry(
          &self.client,
          &self.url,
          &self.policy,
          &self.cancel,
          Some((start, end - 1)),
        )
        .await?;
        let body = tokio::select! {
          _ = self.cancel.cancelled() => return Err(MediaError::Aborted),
          body = resp.bytes() => body?,
        };
        Ok(body)
      }
      ReadMode::Full(cache) => {
        let mut guard = cache.lock().await;
        if guard.is_none() {
          *guard = Some(self.fetch_full().await?);
        }
        let data = guard.as_ref().expect("cache filled above");
        let s = (start as usize).min(data.len());
        let e = (end as usize).min(data.len());
        Ok(data.slice(s..e))
      }
    }
  }

  fn abort(&self) {
    self.cancel.cancel();
  }
}

/// Issue a GET with optional inclusive byte range, retrying with exponential
/// backoff per the policy. Aborts promptly when the token fires.
async fn send_with_retry(
  client: &Client,
  url: &str,
  policy: &RequestPolicy,
  cancel: &CancellationToken,
  range: Option<(u64, u64)>,
) -> Result<Response> {
  let mut attempt = 0u32;
  loop {
    if cancel.is_cancelled() {
      return Err(MediaError::Aborted);
    }

    let mut req = client.get(url);
    if let Some((a, b)) = range {
      req = req.header(RANGE, format!("bytes={}-{}", a, b));
    }
    if let Some(referer) = &policy.referer {
      req = req.header(REFERER, referer.clone());
    }

    let outcome = tokio::select! {
      _ = cancel.cancelled() => return Err(MediaError::Aborted),
      resp = req.send() => resp,
    };

    match outcome {
      Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::PARTIAL_CONTENT => {
        return Ok(resp);
      }
      Ok(resp) if attempt >= policy.retries => {
        return Err(MediaError::format(format!(
          "request failed with status {}",
          resp.status()
        )));
      }
      Err(err) if attempt >= policy.retries => return Err(err.into()),
      Ok(_) | Err(_) => {
        let delay = policy.backoff_base * 2u32.saturating_pow(attempt);
        tracing::debug!(target: "source", url, attempt, ?delay, "retrying request");
        tokio::select! {
          _ = cancel.cancelled() => return Err(MediaError::Aborted),
          _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
      }
    }
  }
}

/// Parse the total from `Content-Range: bytes a-b/<total>`.
fn parse_content_range_total(value: &str) -> Option<u64> {
  let rest = value.trim().strip_prefix("bytes")?.trim_start();
  let total = rest.rsplit('/').next()?;
  if total == "*" {
    return None;
  }
  total.parse().ok()
}

fn content_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
  headers
    .get(CONTENT_LENGTH)
    .or_else(|| headers.get("x-content-length"))
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn content_range_total_parses() {
    assert_eq!(parse_content_range_total("bytes 0-1/4242"), Some(4242));
    assert_eq!(parse_content_range_total("bytes 100-199/12345678"), Some(12345678));
    assert_eq!(parse_content_range_total("bytes 0-1/*"), None);
    assert_eq!(parse_content_range_total("items 0-1/5"), None);
    assert_eq!(parse_content_range_total("garbage"), None);
  }

  #[test]
  fn content_length_prefers_standard_header() {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(CONTENT_LENGTH, "123".parse().unwrap());
    headers.insert("x-content-length", "456".parse().unwrap());
    assert_eq!(content_length(&headers), Some(123));

    headers.remove(CONTENT_LENGTH);
    assert_eq!(content_length(&headers), Some(456));
  }

  #[test]
  fn default_policy_matches_contract() {
    let policy = RequestPolicy::default();
    assert!(policy.referer.is_none());
    assert_eq!(policy.retries, 1);
    assert_eq!(policy.backoff_base, Duration::from_millis(300));
  }
}
