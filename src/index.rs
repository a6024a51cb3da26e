use crate::{
  config::{Config, SlicePolicy, UncompletedSliceSavePolicy},
  error::Error,
  file_util,
  slice::{Slice, SliceStatus},
};
use anyhow::Context;
use std::io::Write;
use std::path::Path;

pub(crate) const SCHEMA_VERSION: u32 = 1;

/// The persisted resume plan, one JSON record per download target.
/// Read and written only through this module; writes are atomic
/// (sibling tmp + fsync + rename) so a crash leaves the previous record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) struct IndexFile {
  pub schema_version: u32,
  pub origin_url: String,
  pub effective_url: String,
  /// -1 when the origin never reported a length.
  pub content_length: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_md5: Option<String>,
  /// Unix seconds.
  pub saved_at: i64,
  pub slice_policy: SlicePolicy,
  pub slices: Vec<IndexSlice>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) struct IndexSlice {
  pub begin: u64,
  /// Exclusive; -1 = open-ended.
  pub end: i64,
  pub completed: u64,
}

fn now_unix() -> i64 {
  time::OffsetDateTime::now_utc().unix_timestamp()
}

impl IndexFile {
  /// Capture the live slice table, applying the uncompleted-slice save policy:
  /// Done slices persist their full length; others persist flushed progress
  /// (`SaveExceptFailed`, Failed reset to zero) or nothing (`AlwaysDiscard`).
  pub fn snapshot(
    origin_url: &str,
    effective_url: &str,
    content_length: i64,
    content_md5: Option<&str>,
    slice_policy: SlicePolicy,
    save_policy: UncompletedSliceSavePolicy,
    slices: &[Slice],
  ) -> Self {
    let slices = slices
      .iter()
      .map(|s| {
        let completed = match s.status {
          SliceStatus::Done => s.len().unwrap_or(s.completed),
          SliceStatus::Failed => 0,
          SliceStatus::Pending | SliceStatus::InFlight => match save_policy {
            UncompletedSliceSavePolicy::AlwaysDiscard => 0,
            UncompletedSliceSavePolicy::SaveExceptFailed => s.flushed,
          },
        };
        IndexSlice { begin: s.begin, end: s.end.map(|e| e as i64).unwrap_or(-1), completed }
      })
      .collect();
    Self {
      schema_version: SCHEMA_VERSION,
      origin_url: origin_url.to_string(),
      effective_url: effective_url.to_string(),
      content_length,
      content_md5: content_md5.map(|s| s.to_ascii_lowercase()),
      saved_at: now_unix(),
      slice_policy,
      slices,
    }
  }

  pub fn save(&self, path: &Path) -> anyhow::Result<()> {
    let mut staging = path.as_os_str().to_os_string();
    staging.push(".tmp");
    let staging = std::path::PathBuf::from(staging);

    let json = serde_json::to_vec(self).context("failed to serialize index record")?;
    {
      let mut f = std::fs::File::create(&staging).context("failed to create index staging file")?;
      f.write_all(&json).context("failed to write index staging file")?;
      f.sync_all().context("failed to sync index staging file")?;
    }
    std::fs::rename(&staging, path).context("failed to rename index staging file")?;
    Ok(())
  }

  pub fn load(path: &Path) -> Result<Self, Error> {
    let raw = std::fs::read_to_string(path)
      .map_err(|e| Error::OpenIndexFileFailed(format!("{}: {e}", path.display())))?;
    let idx: IndexFile = serde_json::from_str(&raw).map_err(|_| Error::InvalidIndexFormat)?;
    idx.check_structure()?;
    Ok(idx)
  }

  /// Structural validation: version stamp, range sanity, contiguous coverage
  /// of `[0, content_length)` in index order when the length is known.
  fn check_structure(&self) -> Result<(), Error> {
    if self.schema_version != SCHEMA_VERSION || self.slices.is_empty() {
      return Err(Error::InvalidIndexFormat);
    }
    if self.content_length < 0 {
      // Unknown length downloads run as a single open-ended slice.
      let only = &self.slices[0];
      if self.slices.len() != 1 || only.begin != 0 || only.end != -1 {
        return Err(Error::InvalidIndexFormat);
      }
      return Ok(());
    }
    let mut cursor = 0u64;
    for s in &self.slices {
      if s.end < 0 {
        return Err(Error::InvalidIndexFormat);
      }
      let end = s.end as u64;
      if s.begin != cursor || end <= s.begin || s.completed > end - s.begin {
        return Err(Error::InvalidIndexFormat);
      }
      cursor = end;
    }
    if cursor != self.content_length as u64 {
      return Err(Error::InvalidIndexFormat);
    }
    Ok(())
  }

  /// Resume preconditions against the current run: same origin URL, not
  /// expired, and a temp file whose size matches the record.
  pub fn validate_for_resume(
    &self,
    cfg: &Config,
    origin_url: &str,
    tmp: &Path,
  ) -> Result<(), Error> {
    if cfg.redirect_check_enabled && self.origin_url != origin_url {
      return Err(Error::UrlDifferent);
    }
    if cfg.tmp_expiry_seconds >= 0 && now_unix() - self.saved_at >= cfg.tmp_expiry_seconds {
      return Err(Error::TmpFileExpired);
    }
    let on_disk = file_util::file_size(tmp).unwrap_or(0);
    let expected = if self.content_length >= 0 {
      self.content_length as u64
    } else {
      self.slices.iter().map(|s| s.completed).sum()
    };
    if on_disk != expected {
      return Err(Error::TmpFileSizeError);
    }
    Ok(())
  }
}
