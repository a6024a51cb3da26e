use crate::{
  config::{Config, SlicePolicy, UncompletedSliceSavePolicy},
  error::Error,
  index::IndexFile,
  probe::FileInfo,
  slice::{Slice, SliceStatus},
};

const AUTO_MAX_SLICE: u64 = 10 * 1024 * 1024;
const AUTO_MIN_SLICE: u64 = 1024 * 1024;

/// Cold-start partition of the remote file per the configured policy.
/// Without a known length or range support everything rides one slice.
pub(crate) fn plan(cfg: &Config, info: &FileInfo) -> Vec<Slice> {
  if info.content_length < 0 || !info.accepts_ranges {
    return vec![Slice::new(0, 0, if info.content_length < 0 { None } else { Some(info.content_length as u64) })];
  }
  let total = info.content_length as u64;
  if total == 0 {
    return vec![Slice::new(0, 0, Some(0))];
  }

  let slice_size = match cfg.slice_policy {
    SlicePolicy::FixedSize(s) => s.max(1),
    SlicePolicy::FixedNum(n) => {
      // A request for more slices than the pool can keep busy just adds
      // per-request overhead; cap at 4x the worker count.
      let n = (n as u64).clamp(1, cfg.thread_num as u64 * 4);
      total.div_ceil(n)
    }
    SlicePolicy::Auto => (total / cfg.thread_num as u64).clamp(AUTO_MIN_SLICE, AUTO_MAX_SLICE),
  };

  let count = total.div_ceil(slice_size);
  let mut slices = Vec::with_capacity(count as usize);
  for i in 0..count {
    let begin = i * slice_size;
    let end = ((i + 1) * slice_size).min(total);
    slices.push(Slice::new(i as u32, begin, Some(end)));
  }
  slices
}

/// Warm-start reconciliation of a loaded index against the refreshed
/// descriptor. `Ok(None)` means the plan is stale and the caller should cold
/// start; `Err` is terminal.
pub(crate) fn reconcile(
  cfg: &Config,
  info: &FileInfo,
  idx: &IndexFile,
) -> Result<Option<Vec<Slice>>, Error> {
  if cfg.redirect_check_enabled && idx.effective_url != info.effective_url {
    return Err(Error::RedirectUrlDifferent);
  }
  // A changed policy or a changed remote invalidates the partition wholesale.
  if idx.slice_policy != cfg.slice_policy || idx.content_length != info.content_length {
    return Ok(None);
  }
  if cfg.content_md5_enabled {
    if let (Some(stored), Some(fresh)) = (idx.content_md5.as_deref(), info.content_md5.as_deref())
    {
      if !stored.eq_ignore_ascii_case(fresh) {
        tracing::info!("remote content-md5 changed, discarding saved plan");
        return Ok(None);
      }
    }
  }

  let mut slices = Vec::with_capacity(idx.slices.len());
  for (i, rec) in idx.slices.iter().enumerate() {
    let end = if rec.end < 0 { None } else { Some(rec.end as u64) };
    let mut s = Slice::new(i as u32, rec.begin, end);
    s.completed = match cfg.save_policy {
      UncompletedSliceSavePolicy::AlwaysDiscard => 0,
      UncompletedSliceSavePolicy::SaveExceptFailed => rec.completed,
    };
    if s.is_byte_complete() {
      s.completed = s.len().unwrap_or(s.completed);
      s.status = SliceStatus::Done;
    }
    s.flushed = s.completed;
    slices.push(s);
  }
  Ok(Some(slices))
}
