use crate::{
  bandwidth::{MinSpeedWatchdog, RateLimiter, SpeedMeter},
  cache::{self, DiskCache},
  config::{Config, UncompletedSliceSavePolicy},
  error::{DownloadResult, Error},
  file_util,
  hasher,
  index::IndexFile,
  net::NetGuard,
  planner,
  probe::{self, FileInfo},
  slice::{Slice, SliceStatus},
  worker::{self, SliceJob, SliceSource, WorkerCtx, WorkerEvent},
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use url::Url;

const TICK: Duration = Duration::from_millis(100);
const SPEED_EVERY_TICKS: u64 = 10;
const INDEX_FLUSH_EVERY: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
  Stopped,
  Downloading,
  Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlSignal {
  Run,
  Pause,
  Stop,
}

pub type ProgressCallback = Box<dyn Fn(i64, i64) + Send + Sync>;
pub type SpeedCallback = Box<dyn Fn(i64) + Send + Sync>;
pub type ResultCallback = Box<dyn FnOnce(DownloadResult) + Send>;
pub type VerboseCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Observer hooks for one download run. All of them are dispatched from the
/// controller task, never concurrently for the same instance, and must not
/// call back into the same instance (such calls are no-ops).
#[derive(Default)]
pub struct Callbacks {
  pub on_result: Option<ResultCallback>,
  pub on_progress: Option<ProgressCallback>,
  pub on_speed: Option<SpeedCallback>,
}

/// State shared between the façade and the controller task.
pub(crate) struct SharedStatus {
  pub state: Mutex<DownloadState>,
  /// -1 until the probe learns the length (and if it never does).
  pub origin_size: AtomicI64,
  pub in_callback: AtomicBool,
}

impl SharedStatus {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(DownloadState::Stopped),
      origin_size: AtomicI64::new(-1),
      in_callback: AtomicBool::new(false),
    })
  }

  /// Reentrancy guard around callback dispatch.
  pub fn dispatch(&self, f: impl FnOnce()) {
    self.in_callback.store(true, Ordering::SeqCst);
    f();
    self.in_callback.store(false, Ordering::SeqCst);
  }
}

pub(crate) struct ControllerCtx {
  pub cfg: Config,
  pub origin_url: Url,
  pub target: PathBuf,
  pub control: watch::Receiver<ControlSignal>,
  pub stop_event: Option<watch::Receiver<bool>>,
  pub status: Arc<SharedStatus>,
  pub on_progress: Option<ProgressCallback>,
  pub on_speed: Option<SpeedCallback>,
  pub verbose: Option<VerboseCallback>,
}

impl ControllerCtx {
  fn verbose(&self, line: &str) {
    tracing::debug!(file = %self.target.display(), "{line}");
    if let Some(cb) = &self.verbose {
      let cb = cb.clone();
      self.status.dispatch(|| cb(line));
    }
  }

  fn emit_progress(&self, total: i64, downloaded: u64) {
    if let Some(cb) = &self.on_progress {
      self.status.dispatch(|| cb(total, downloaded as i64));
    }
  }

  fn emit_speed(&self, bps: i64) {
    if let Some(cb) = &self.on_speed {
      self.status.dispatch(|| cb(bps));
    }
  }

  fn signal_now(&self) -> ControlSignal {
    if let Some(stop) = &self.stop_event {
      if *stop.borrow() {
        return ControlSignal::Stop;
      }
    }
    *self.control.borrow()
  }

  /// Resolves when the effective signal may have changed. A dropped sender
  /// counts as Stop.
  async fn signal_changed(&mut self) {
    match &mut self.stop_event {
      Some(stop) => {
        tokio::select! {
          _ = self.control.changed() => {}
          _ = stop.changed() => {}
        }
      }
      None => {
        let _ = self.control.changed().await;
      }
    }
  }

  fn check_canceled(&self) -> Result<(), Error> {
    if self.signal_now() == ControlSignal::Stop {
      Err(Error::Canceled)
    } else {
      Ok(())
    }
  }
}

enum ActiveOutcome {
  Completed,
  Failed(Error),
  PauseRequested,
  StopRequested,
}

/// Entry point of the controller task. Runs the whole lifecycle and applies
/// the on-disk policy for the terminal result.
pub(crate) async fn run(mut ctx: ControllerCtx) -> DownloadResult {
  let guard = NetGuard::acquire();
  let tmp = file_util::tmp_path(&ctx.target);
  let idx_path = file_util::index_path(&ctx.target);

  let result = drive(&mut ctx, &guard, &tmp, &idx_path).await;

  match &result {
    Ok(()) => {}
    Err(Error::Canceled) if ctx.cfg.save_policy == UncompletedSliceSavePolicy::AlwaysDiscard => {
      // A partial slice cannot be verified later, so a canceled discard-mode
      // run leaves no trace.
      file_util::remove_if_exists(&tmp);
      file_util::remove_if_exists(&idx_path);
    }
    Err(e) if !e.preserves_resume_data() => {
      file_util::remove_if_exists(&tmp);
      file_util::remove_if_exists(&idx_path);
    }
    Err(_) => {}
  }
  result
}

async fn drive(
  ctx: &mut ControllerCtx,
  guard: &NetGuard,
  tmp: &Path,
  idx_path: &Path,
) -> DownloadResult {
  ctx.verbose(&format!("start: {} -> {}", ctx.origin_url, ctx.target.display()));

  if let Some(parent) = ctx.target.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::CreateTargetFileFailed(format!("{}: {e}", parent.display())))?;
    }
  }

  let client = guard.stack().client_for(&ctx.cfg)?;
  ctx.check_canceled()?;

  let info = probe::fetch_file_info(&client, &ctx.cfg, &ctx.origin_url).await?;
  ctx.status.origin_size.store(info.content_length, Ordering::Relaxed);
  ctx.verbose(&format!(
    "probe: length={} ranges={} url={}",
    info.content_length, info.accepts_ranges, info.effective_url
  ));
  ctx.check_canceled()?;

  // Load and reconcile a previous plan, if one is on disk.
  let mut resumed = false;
  let mut slices = match load_saved_plan(ctx, &info, tmp, idx_path)? {
    Some(saved) => {
      resumed = true;
      saved
    }
    None => planner::plan(&ctx.cfg, &info),
  };
  ctx.verbose(&format!("plan: {} slice(s), resumed={resumed}", slices.len()));

  // Byte-complete plan: only verification and rename remain.
  if !slices.is_empty() && slices.iter().all(|s| s.status == SliceStatus::Done) {
    return finalize(ctx, &info, None, tmp, idx_path).await;
  }

  let file = open_tmp_file(&info, tmp, resumed)?;
  save_index(ctx, &info, &slices, idx_path)
    .map_err(|e| Error::UpdateIndexFileFailed(e.to_string()))?;

  let cache = DiskCache::new(file);
  let limiter = RateLimiter::new(ctx.cfg.max_speed_bps);
  let source = slice_source(&ctx.origin_url, &info, client)?;
  let mut watchdog = MinSpeedWatchdog::new(ctx.cfg.min_speed_bps, ctx.cfg.min_speed_duration);

  loop {
    match run_active(ctx, &info, &mut slices, &cache, &limiter, &source, idx_path, &mut watchdog)
      .await
    {
      ActiveOutcome::Completed => {
        let downloaded = total_completed(&slices);
        ctx.emit_progress(info.content_length, downloaded);
        return finalize(ctx, &info, Some(&cache), tmp, idx_path).await;
      }
      ActiveOutcome::Failed(e) => {
        quiesce_to_disk(ctx, &info, &slices, &cache, idx_path);
        return Err(e);
      }
      ActiveOutcome::StopRequested => {
        quiesce_to_disk(ctx, &info, &slices, &cache, idx_path);
        ctx.verbose("stopped");
        return Err(Error::Canceled);
      }
      ActiveOutcome::PauseRequested => {
        quiesce_to_disk(ctx, &info, &slices, &cache, idx_path);
        *ctx.status.state.lock() = DownloadState::Paused;
        ctx.verbose("paused");
        match wait_while_paused(ctx).await {
          ControlSignal::Run => {
            *ctx.status.state.lock() = DownloadState::Downloading;
            watchdog.reset();
            ctx.verbose("resumed");
          }
          _ => {
            ctx.verbose("stopped while paused");
            return Err(Error::Canceled);
          }
        }
      }
    }
  }
}

fn load_saved_plan(
  ctx: &ControllerCtx,
  info: &FileInfo,
  tmp: &Path,
  idx_path: &Path,
) -> Result<Option<Vec<Slice>>, Error> {
  if !idx_path.exists() {
    return Ok(None);
  }
  let idx = IndexFile::load(idx_path)?;
  idx.validate_for_resume(&ctx.cfg, ctx.origin_url.as_str(), tmp)?;
  match planner::reconcile(&ctx.cfg, info, &idx)? {
    Some(slices) => Ok(Some(slices)),
    None => {
      // Stale plan: start over from nothing.
      file_util::remove_if_exists(tmp);
      file_util::remove_if_exists(idx_path);
      Ok(None)
    }
  }
}

fn open_tmp_file(info: &FileInfo, tmp: &Path, resumed: bool) -> Result<std::fs::File, Error> {
  let existed = tmp.exists();
  let file = std::fs::OpenOptions::new()
    .create(true)
    .read(true)
    .write(true)
    .open(tmp)
    .map_err(|e| {
      let detail = format!("{}: {e}", tmp.display());
      if existed {
        Error::OpenTmpFileFailed(detail)
      } else {
        Error::CreateTmpFileFailed(detail)
      }
    })?;
  if info.content_length >= 0 {
    file.set_len(info.content_length as u64).map_err(|_| Error::TmpFileCannotRw)?;
  } else if !resumed {
    file.set_len(0).map_err(|_| Error::TmpFileCannotRw)?;
  }
  Ok(file)
}

fn slice_source(
  origin_url: &Url,
  info: &FileInfo,
  client: reqwest::Client,
) -> Result<SliceSource, Error> {
  if origin_url.scheme() == "file" {
    let path = origin_url
      .to_file_path()
      .map_err(|_| Error::InvalidUrl(format!("not a local file path: {origin_url}")))?;
    Ok(SliceSource::LocalFile { path })
  } else {
    Ok(SliceSource::Http {
      client,
      url: info.effective_url.clone(),
      accepts_ranges: info.accepts_ranges,
    })
  }
}

fn total_completed(slices: &[Slice]) -> u64 {
  slices.iter().map(|s| s.completed).sum()
}

fn build_queue(cfg: &Config, slices: &[Slice], workers: u32) -> VecDeque<SliceJob> {
  let total_remaining: u64 =
    slices.iter().filter_map(|s| s.remaining()).sum::<u64>();
  slices
    .iter()
    .filter(|s| s.status == SliceStatus::Pending)
    .map(|s| SliceJob {
      index: s.index,
      begin: s.begin,
      end: s.end,
      completed: s.completed,
      cache_share: cache::compute_share(
        cfg.disk_cache_bytes,
        s.remaining(),
        total_remaining,
        workers,
      ),
    })
    .collect()
}

/// One active transfer phase: spawn workers over the Pending slices, drain
/// their events, react to control signals and the speed watchdog. Always
/// joins every spawned worker before returning. The watchdog outlives the
/// phase; the resume path resets it so paused time never reads as slow time.
#[allow(clippy::too_many_arguments)]
async fn run_active(
  ctx: &mut ControllerCtx,
  info: &FileInfo,
  slices: &mut [Slice],
  cache: &Arc<DiskCache>,
  limiter: &RateLimiter,
  source: &SliceSource,
  idx_path: &Path,
  watchdog: &mut MinSpeedWatchdog,
) -> ActiveOutcome {
  match ctx.signal_now() {
    ControlSignal::Run => {}
    ControlSignal::Pause => return ActiveOutcome::PauseRequested,
    ControlSignal::Stop => return ActiveOutcome::StopRequested,
  }

  let pending = slices.iter().filter(|s| s.status == SliceStatus::Pending).count();
  let workers = (pending as u32).min(ctx.cfg.thread_num).max(1);
  let queue = Arc::new(Mutex::new(build_queue(&ctx.cfg, slices, workers)));
  let (ev_tx, mut ev_rx) = mpsc::channel::<WorkerEvent>(EVENT_CHANNEL_CAPACITY);
  let worker_ctl = watch::Sender::new(ControlSignal::Run);

  let mut join = JoinSet::new();
  for _ in 0..workers {
    join.spawn(worker::run_worker(WorkerCtx {
      source: source.clone(),
      cache: cache.clone(),
      limiter: limiter.clone(),
      queue: queue.clone(),
      events: ev_tx.clone(),
      control: worker_ctl.subscribe(),
    }));
  }
  drop(ev_tx);
  tracing::debug!(workers, pending, "workers spawned");

  let mut tick = tokio::time::interval(TICK);
  tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
  let mut speed = SpeedMeter::new(total_completed(slices));
  let mut last_index_save = Instant::now();
  let mut index_dirty = false;
  let mut last_reported: Option<u64> = None;
  let mut ticks: u64 = 0;

  // First failure wins; later ones are consequences of the shutdown.
  let mut failure: Option<Error> = None;
  // Pause/stop observed mid-phase; workers are quiescing.
  let mut requested: Option<ActiveOutcome> = None;

  loop {
    tokio::select! {
      event = ev_rx.recv() => {
        match event {
          Some(event) => {
            let done_transition = matches!(event, WorkerEvent::Done { .. });
            if let Some(e) = apply_event(slices, event, &mut index_dirty) {
              if failure.is_none() {
                failure = Some(e);
                let _ = worker_ctl.send(ControlSignal::Stop);
              }
            }
            // Persist every Done transition promptly.
            if done_transition {
              flush_index_if_due(ctx, info, slices, idx_path, &mut last_index_save, &mut index_dirty, &mut failure, &worker_ctl);
            }
          }
          // All senders gone: every worker has exited.
          None => break,
        }
      }
      _ = ctx.signal_changed(), if requested.is_none() => {
        match ctx.signal_now() {
          ControlSignal::Run => {}
          ControlSignal::Pause => {
            requested = Some(ActiveOutcome::PauseRequested);
            let _ = worker_ctl.send(ControlSignal::Pause);
          }
          ControlSignal::Stop => {
            requested = Some(ActiveOutcome::StopRequested);
            let _ = worker_ctl.send(ControlSignal::Stop);
          }
        }
      }
      _ = tick.tick() => {
        ticks += 1;
        let downloaded = total_completed(slices);
        if last_reported != Some(downloaded) {
          last_reported = Some(downloaded);
          ctx.emit_progress(info.content_length, downloaded);
        }
        let bps = speed.update(downloaded);
        if ticks % SPEED_EVERY_TICKS == 0 {
          ctx.emit_speed(bps);
        }
        if failure.is_none() && requested.is_none() && watchdog.observe(bps) {
          tracing::warn!(bps, floor = ctx.cfg.min_speed_bps, "minimum speed not sustained");
          failure = Some(Error::SliceDownloadFailed);
          let _ = worker_ctl.send(ControlSignal::Stop);
        }
        if index_dirty && last_index_save.elapsed() >= INDEX_FLUSH_EVERY {
          flush_index_if_due(ctx, info, slices, idx_path, &mut last_index_save, &mut index_dirty, &mut failure, &worker_ctl);
        }
      }
    }
  }

  while let Some(res) = join.join_next().await {
    if let Err(e) = res {
      tracing::error!(error = %e, "worker task aborted");
    }
  }

  if let Some(e) = failure {
    return ActiveOutcome::Failed(e);
  }
  if let Some(outcome) = requested {
    return outcome;
  }
  if slices.iter().all(|s| s.status == SliceStatus::Done) {
    return ActiveOutcome::Completed;
  }
  // Workers drained without finishing every slice and without an explicit
  // failure event; treat it as a slice failure.
  tracing::error!("workers exited with unfinished slices");
  ActiveOutcome::Failed(Error::SliceDownloadFailed)
}

#[allow(clippy::too_many_arguments)]
fn flush_index_if_due(
  ctx: &ControllerCtx,
  info: &FileInfo,
  slices: &[Slice],
  idx_path: &Path,
  last_save: &mut Instant,
  dirty: &mut bool,
  failure: &mut Option<Error>,
  worker_ctl: &watch::Sender<ControlSignal>,
) {
  match save_index(ctx, info, slices, idx_path) {
    Ok(()) => {
      *last_save = Instant::now();
      *dirty = false;
    }
    Err(e) => {
      tracing::error!(error = %e, "index update failed");
      if failure.is_none() {
        *failure = Some(Error::UpdateIndexFileFailed(e.to_string()));
        let _ = worker_ctl.send(ControlSignal::Stop);
      }
    }
  }
}

/// Returns a terminal failure carried by the event, if any.
fn apply_event(slices: &mut [Slice], event: WorkerEvent, index_dirty: &mut bool) -> Option<Error> {
  match event {
    WorkerEvent::Claimed { slice } => {
      slices[slice as usize].status = SliceStatus::InFlight;
      None
    }
    WorkerEvent::Progress { slice, delta } => {
      slices[slice as usize].completed += delta;
      None
    }
    WorkerEvent::Flushed { slice, durable } => {
      slices[slice as usize].flushed = durable;
      *index_dirty = true;
      None
    }
    WorkerEvent::Done { slice, completed } => {
      let s = &mut slices[slice as usize];
      s.completed = completed;
      s.flushed = completed;
      s.status = SliceStatus::Done;
      *index_dirty = true;
      None
    }
    WorkerEvent::Failed { slice, durable, error } => {
      let s = &mut slices[slice as usize];
      s.flushed = durable;
      s.status = SliceStatus::Failed;
      *index_dirty = true;
      Some(error)
    }
    WorkerEvent::Quiesced { slice, completed, durable } => {
      let s = &mut slices[slice as usize];
      s.completed = completed;
      s.flushed = durable;
      s.status = SliceStatus::Pending;
      *index_dirty = true;
      None
    }
  }
}

/// Flush the cache and persist the index; used on pause, stop and failure.
fn quiesce_to_disk(
  ctx: &ControllerCtx,
  info: &FileInfo,
  slices: &[Slice],
  cache: &Arc<DiskCache>,
  idx_path: &Path,
) {
  if info.content_length < 0 {
    // Open-ended temp files grow as bytes arrive; keep the on-disk length in
    // step with what the index will claim, or the next resume would reject
    // the pair as inconsistent.
    let recorded: u64 = match ctx.cfg.save_policy {
      UncompletedSliceSavePolicy::SaveExceptFailed => slices
        .iter()
        .map(|s| if s.status == SliceStatus::Failed { 0 } else { s.flushed })
        .sum(),
      UncompletedSliceSavePolicy::AlwaysDiscard => 0,
    };
    if let Err(e) = cache.file().set_len(recorded) {
      tracing::warn!(error = %e, "truncate on quiesce failed");
    }
  }
  if let Err(e) = cache.sync() {
    tracing::warn!(error = %e, "fsync on quiesce failed");
  }
  if let Err(e) = save_index(ctx, info, slices, idx_path) {
    tracing::warn!(error = %e, "index save on quiesce failed");
  }
}

async fn wait_while_paused(ctx: &mut ControllerCtx) -> ControlSignal {
  loop {
    match ctx.signal_now() {
      ControlSignal::Pause => ctx.signal_changed().await,
      other => return other,
    }
  }
}

fn save_index(
  ctx: &ControllerCtx,
  info: &FileInfo,
  slices: &[Slice],
  idx_path: &Path,
) -> anyhow::Result<()> {
  let idx = IndexFile::snapshot(
    ctx.origin_url.as_str(),
    &info.effective_url,
    info.content_length,
    info.content_md5.as_deref(),
    ctx.cfg.slice_policy,
    ctx.cfg.save_policy,
    slices,
  );
  idx.save(idx_path)
}

async fn finalize(
  ctx: &mut ControllerCtx,
  info: &FileInfo,
  cache: Option<&Arc<DiskCache>>,
  tmp: &Path,
  idx_path: &Path,
) -> DownloadResult {
  if let Some(cache) = cache {
    cache.sync().map_err(|e| Error::FlushTmpFileFailed(e.to_string()))?;
  }

  if ctx.cfg.hash_required(info.content_length) {
    let expected = ctx.cfg.hash_verify.as_ref().expect("hash_required implies config").clone();
    let actual = hasher::file_hash(tmp, expected.kind)
      .await
      .map_err(|e| Error::CalculateHashFailed(e.to_string()))?;
    if !actual.eq_ignore_ascii_case(&expected.value) {
      // Keep the bytes for post-mortem, but make the next start a cold one.
      let mut bad = tmp.as_os_str().to_os_string();
      bad.push(file_util::BAD_SUFFIX);
      let bad = PathBuf::from(bad);
      file_util::remove_if_exists(&bad);
      if let Err(e) = std::fs::rename(tmp, &bad) {
        tracing::warn!(error = %e, "failed to set aside mismatching tmp file");
      }
      file_util::remove_if_exists(idx_path);
      return Err(Error::HashVerifyNotPass { expected: expected.value, actual });
    }
    ctx.verbose("hash verified");
  } else if info.content_length < 0 {
    // No length and no applicable hash: the transfer cannot be proven
    // complete, so it is reported as unclear rather than successful.
    return Err(Error::NotClearlyResult);
  }

  std::fs::rename(tmp, &ctx.target)
    .map_err(|e| Error::RenameTmpFileFailed(format!("{} -> {}: {e}", tmp.display(), ctx.target.display())))?;
  file_util::remove_if_exists(idx_path);
  ctx.verbose("completed");
  Ok(())
}
