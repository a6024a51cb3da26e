use crate::{config::Config, error::Error};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

/// What one metadata round-trip to the origin established.
#[derive(Debug, Clone)]
pub(crate) struct FileInfo {
  /// Final URL after redirects; slice workers fetch this one.
  pub effective_url: String,
  /// -1 when the origin reported no length.
  pub content_length: i64,
  pub accepts_ranges: bool,
  /// Raw-hex Content-MD5, when enabled and the origin sends one.
  pub content_md5: Option<String>,
  pub last_modified: Option<String>,
}

enum ProbeFailure {
  Transient(String),
  /// Definitive origin answer; retrying cannot change it.
  Definitive(String),
}

/// Discover size, range support and the post-redirect URL, with up to
/// `fetch_info_retries` retries on transient failures.
pub(crate) async fn fetch_file_info(
  client: &reqwest::Client,
  cfg: &Config,
  url: &Url,
) -> Result<FileInfo, Error> {
  if url.scheme() == "file" {
    return probe_local_file(url);
  }

  let attempts = cfg.fetch_info_retries + 1;
  let mut last_err = String::from("no probe attempt made");
  for attempt in 0..attempts {
    if attempt > 0 {
      tokio::time::sleep(Duration::from_millis(500)).await;
    }
    match probe_once(client, cfg, url).await {
      Ok(info) => {
        tracing::debug!(
          url = %info.effective_url,
          content_length = info.content_length,
          accepts_ranges = info.accepts_ranges,
          last_modified = info.last_modified.as_deref().unwrap_or(""),
          "file info probe ok"
        );
        return Ok(info);
      }
      Err(ProbeFailure::Definitive(msg)) => return Err(Error::FetchFileInfoFailed(msg)),
      Err(ProbeFailure::Transient(msg)) => {
        tracing::warn!(attempt, error = %msg, "file info probe failed");
        last_err = msg;
      }
    }
  }
  Err(Error::FetchFileInfoFailed(last_err))
}

fn probe_local_file(url: &Url) -> Result<FileInfo, Error> {
  let path = url
    .to_file_path()
    .map_err(|_| Error::InvalidUrl(format!("not a local file path: {url}")))?;
  let meta =
    std::fs::metadata(&path).map_err(|e| Error::FetchFileInfoFailed(format!("stat: {e}")))?;
  Ok(FileInfo {
    effective_url: url.to_string(),
    content_length: meta.len() as i64,
    accepts_ranges: true,
    content_md5: None,
    last_modified: None,
  })
}

async fn probe_once(
  client: &reqwest::Client,
  cfg: &Config,
  url: &Url,
) -> Result<FileInfo, ProbeFailure> {
  let req = if cfg.fetch_info_use_head {
    client.head(url.clone())
  } else {
    client.get(url.clone()).header(RANGE, "bytes=0-0")
  };
  let resp = req.send().await.map_err(|e| ProbeFailure::Transient(e.to_string()))?;

  let status = resp.status();
  if status.is_client_error() {
    let msg = format!("http {}", status.as_u16());
    return if matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS) {
      Err(ProbeFailure::Transient(msg))
    } else {
      Err(ProbeFailure::Definitive(msg))
    };
  }
  if !status.is_success() {
    return Err(ProbeFailure::Transient(format!("http {}", status.as_u16())));
  }

  let effective_url = resp.url().to_string();
  let headers = resp.headers();
  let accepts_ranges = status == StatusCode::PARTIAL_CONTENT || header_says_ranges(headers);
  let content_length = if status == StatusCode::PARTIAL_CONTENT {
    content_range_total(headers).unwrap_or(-1)
  } else {
    headers
      .get(CONTENT_LENGTH)
      .and_then(|v| v.to_str().ok())
      .and_then(|s| s.parse::<i64>().ok())
      .unwrap_or(-1)
  };
  let content_md5 = if cfg.content_md5_enabled { content_md5_hex(headers) } else { None };
  let last_modified = headers
    .get(reqwest::header::LAST_MODIFIED)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_string());

  Ok(FileInfo { effective_url, content_length, accepts_ranges, content_md5, last_modified })
}

fn header_says_ranges(headers: &HeaderMap) -> bool {
  headers
    .get(ACCEPT_RANGES)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_ascii_lowercase().contains("bytes"))
    .unwrap_or(false)
}

/// Total length from `Content-Range: bytes 0-0/N`; `*` means unknown.
fn content_range_total(headers: &HeaderMap) -> Option<i64> {
  let raw = headers.get(CONTENT_RANGE)?.to_str().ok()?;
  let total = raw.trim().rsplit('/').next()?;
  if total == "*" {
    return None;
  }
  total.parse::<i64>().ok()
}

/// `Content-MD5` is accepted as raw hex only; base64 values are ignored.
fn content_md5_hex(headers: &HeaderMap) -> Option<String> {
  let raw = headers.get("content-md5")?.to_str().ok()?.trim();
  if raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
    Some(raw.to_ascii_lowercase())
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
      map.append(
        reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
        HeaderValue::from_str(v).unwrap(),
      );
    }
    map
  }

  #[test]
  fn content_range_total_parses_bounded_and_unknown() {
    assert_eq!(content_range_total(&headers(&[("content-range", "bytes 0-0/12345")])), Some(12345));
    assert_eq!(content_range_total(&headers(&[("content-range", "bytes 0-0/*")])), None);
    assert_eq!(content_range_total(&headers(&[])), None);
  }

  #[test]
  fn accept_ranges_requires_bytes() {
    assert!(header_says_ranges(&headers(&[("accept-ranges", "bytes")])));
    assert!(header_says_ranges(&headers(&[("accept-ranges", "Bytes")])));
    assert!(!header_says_ranges(&headers(&[("accept-ranges", "none")])));
    assert!(!header_says_ranges(&headers(&[])));
  }

  #[test]
  fn content_md5_rejects_base64() {
    let hex = "d41d8cd98f00b204e9800998ecf8427e";
    assert_eq!(content_md5_hex(&headers(&[("content-md5", hex)])).as_deref(), Some(hex));
    // Typical base64 form has padding and is not 32 hex chars.
    assert_eq!(content_md5_hex(&headers(&[("content-md5", "1B2M2Y8AsgTpgAmY7PhCfg==")])), None);
  }
}
