use crate::error::Error;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONN_TIMEOUT_MS: i32 = 3000;
pub const DEFAULT_FETCH_INFO_RETRIES: u32 = 1;
pub const DEFAULT_DISK_CACHE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_SLICE_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_THREAD_NUM: i32 = 100;

/// How the remote file is partitioned into slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum SlicePolicy {
  /// Even split per worker, clamped to [1 MiB, 10 MiB] per slice.
  Auto,
  FixedSize(u64),
  FixedNum(u32),
}

impl Default for SlicePolicy {
  fn default() -> Self {
    SlicePolicy::FixedSize(DEFAULT_SLICE_SIZE)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
  Md5,
  Crc32,
  Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVerifyPolicy {
  AlwaysVerify,
  /// Verify only when the origin never reported a content length. In that
  /// case the hash is the sole proof that the transfer is complete.
  OnlyIfNoSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncompletedSliceSavePolicy {
  /// Progress of non-Done slices is dropped at save time. A partial slice on
  /// disk cannot be verified without a full-file hash.
  AlwaysDiscard,
  /// Keep progress of slices that ended Pending or in flight; reset Failed ones.
  SaveExceptFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashVerify {
  pub policy: HashVerifyPolicy,
  pub kind: HashKind,
  /// Lowercase hex. Comparison is case-insensitive.
  pub value: String,
}

/// Immutable per-download configuration, snapshotted at `start`.
#[derive(Debug, Clone)]
pub(crate) struct Config {
  pub thread_num: u32,
  pub conn_timeout: Duration,
  pub read_timeout: Option<Duration>,
  pub fetch_info_retries: u32,
  pub fetch_info_use_head: bool,
  /// Seconds; -1 = never expire.
  pub tmp_expiry_seconds: i64,
  /// Bytes per second; -1 = unlimited.
  pub max_speed_bps: i64,
  /// Bytes per second; -1 = disabled.
  pub min_speed_bps: i64,
  pub min_speed_duration: Duration,
  pub disk_cache_bytes: u64,
  pub slice_policy: SlicePolicy,
  pub hash_verify: Option<HashVerify>,
  pub redirect_check_enabled: bool,
  pub content_md5_enabled: bool,
  pub verify_ca_enabled: bool,
  pub ca_path: Option<PathBuf>,
  pub verify_host_enabled: bool,
  pub proxy: Option<String>,
  pub cookie_list: Option<String>,
  /// Multimap; order is preserved within a repeated key.
  pub http_headers: Vec<(String, String)>,
  pub save_policy: UncompletedSliceSavePolicy,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      thread_num: default_thread_num(),
      conn_timeout: Duration::from_millis(DEFAULT_CONN_TIMEOUT_MS as u64),
      read_timeout: None,
      fetch_info_retries: DEFAULT_FETCH_INFO_RETRIES,
      fetch_info_use_head: true,
      tmp_expiry_seconds: -1,
      max_speed_bps: -1,
      min_speed_bps: -1,
      min_speed_duration: Duration::from_secs(5),
      disk_cache_bytes: DEFAULT_DISK_CACHE_BYTES,
      slice_policy: SlicePolicy::default(),
      hash_verify: None,
      redirect_check_enabled: true,
      content_md5_enabled: false,
      verify_ca_enabled: false,
      ca_path: None,
      verify_host_enabled: false,
      proxy: None,
      cookie_list: None,
      http_headers: Vec::new(),
      save_policy: UncompletedSliceSavePolicy::AlwaysDiscard,
    }
  }
}

pub(crate) fn default_thread_num() -> u32 {
  let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
  (cpus * 2).clamp(1, 8)
}

impl Config {
  pub fn set_thread_num(&mut self, n: i32) -> Result<(), Error> {
    if n > MAX_THREAD_NUM {
      return Err(Error::InvalidThreadNum(n));
    }
    self.thread_num = if n <= 0 { default_thread_num() } else { n as u32 };
    Ok(())
  }

  pub fn set_conn_timeout_ms(&mut self, ms: i32) -> Result<(), Error> {
    let ms = if ms <= 0 { DEFAULT_CONN_TIMEOUT_MS } else { ms };
    self.conn_timeout = Duration::from_millis(ms as u64);
    Ok(())
  }

  pub fn set_read_timeout_ms(&mut self, ms: i32) -> Result<(), Error> {
    self.read_timeout = if ms <= 0 { None } else { Some(Duration::from_millis(ms as u64)) };
    Ok(())
  }

  pub fn set_fetch_info_retries(&mut self, retries: i32) -> Result<(), Error> {
    self.fetch_info_retries =
      if retries <= 0 { DEFAULT_FETCH_INFO_RETRIES } else { retries as u32 };
    Ok(())
  }

  pub fn set_tmp_expiry_seconds(&mut self, seconds: i32) -> Result<(), Error> {
    self.tmp_expiry_seconds = if seconds < 0 { -1 } else { seconds as i64 };
    Ok(())
  }

  pub fn set_max_speed_bps(&mut self, bps: i64) -> Result<(), Error> {
    self.max_speed_bps = if bps <= 0 { -1 } else { bps };
    Ok(())
  }

  pub fn set_min_speed(&mut self, bps: i64, duration_s: i32) -> Result<(), Error> {
    if bps <= 0 {
      self.min_speed_bps = -1;
      return Ok(());
    }
    self.min_speed_bps = bps;
    if duration_s > 0 {
      self.min_speed_duration = Duration::from_secs(duration_s as u64);
    }
    Ok(())
  }

  pub fn set_disk_cache_bytes(&mut self, bytes: i64) -> Result<(), Error> {
    self.disk_cache_bytes = if bytes <= 0 { DEFAULT_DISK_CACHE_BYTES } else { bytes as u64 };
    Ok(())
  }

  pub fn set_slice_policy(&mut self, policy: SlicePolicy) -> Result<(), Error> {
    match policy {
      SlicePolicy::FixedSize(0) | SlicePolicy::FixedNum(0) => Err(Error::InvalidSlicePolicy),
      _ => {
        self.slice_policy = policy;
        Ok(())
      }
    }
  }

  /// An empty hash value disables verification.
  pub fn set_hash_verify(
    &mut self,
    policy: HashVerifyPolicy,
    kind: HashKind,
    value: &str,
  ) -> Result<(), Error> {
    let value = value.trim();
    if value.is_empty() {
      self.hash_verify = None;
      return Ok(());
    }
    let expect_len = match kind {
      HashKind::Md5 => 32,
      HashKind::Crc32 => 8,
      HashKind::Sha256 => 64,
    };
    if value.len() != expect_len || !value.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(Error::InvalidHashPolicy);
    }
    self.hash_verify = Some(HashVerify { policy, kind, value: value.to_ascii_lowercase() });
    Ok(())
  }

  /// Whether the whole-file hash must be checked given the (possibly unknown)
  /// content length observed for this run.
  pub fn hash_required(&self, content_length: i64) -> bool {
    match &self.hash_verify {
      None => false,
      Some(h) => match h.policy {
        HashVerifyPolicy::AlwaysVerify => true,
        HashVerifyPolicy::OnlyIfNoSize => content_length < 0,
      },
    }
  }
}
