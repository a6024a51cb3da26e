//! Resumable, multi-connection file downloader.
//!
//! A [`Downloader`] fetches one URL to one target path, optionally across
//! several parallel HTTP range requests, and persists its slice plan in a
//! sidecar index file (`<target>.zoe.idx`) so an interrupted transfer resumes
//! byte-exact across process restarts. Bytes land in `<target>.zoe.tmp` and
//! are promoted to the target only on full success.
//!
//! ```no_run
//! use zoe::{Callbacks, Downloader};
//!
//! # async fn demo() -> Result<(), zoe::Error> {
//! let dl = Downloader::new();
//! dl.set_thread_num(4)?;
//! let fut = dl.start(
//!   "https://example.com/big.bin",
//!   "/tmp/big.bin",
//!   Callbacks {
//!     on_progress: Some(Box::new(|total, done| println!("{done}/{total}"))),
//!     ..Default::default()
//!   },
//! )?;
//! fut.wait().await?;
//! # Ok(())
//! # }
//! ```

mod bandwidth;
mod cache;
mod config;
mod controller;
mod error;
mod file_util;
mod hasher;
mod index;
mod net;
mod planner;
mod probe;
mod slice;
mod worker;

pub use config::{
  HashKind, HashVerify, HashVerifyPolicy, SlicePolicy, UncompletedSliceSavePolicy,
};
pub use controller::{
  Callbacks, DownloadState, ProgressCallback, ResultCallback, SpeedCallback,
};
pub use error::{DownloadResult, Error};
pub use net::{global_init, global_shutdown, StopEvent};

use crate::config::Config;
use crate::controller::{ControlSignal, ControllerCtx, SharedStatus};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

/// Targets with a live download, across all instances in this process.
static ACTIVE_TARGETS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

struct TargetLease(PathBuf);

impl TargetLease {
  fn acquire(path: &Path) -> Result<Self, Error> {
    let mut active = ACTIVE_TARGETS.lock();
    if active.iter().any(|p| p == path) {
      return Err(Error::AlreadyDownloading);
    }
    active.push(path.to_path_buf());
    Ok(Self(path.to_path_buf()))
  }
}

impl Drop for TargetLease {
  fn drop(&mut self) {
    ACTIVE_TARGETS.lock().retain(|p| p != &self.0);
  }
}

struct Session {
  url: String,
  target: PathBuf,
}

struct Inner {
  cfg: Mutex<Config>,
  status: Arc<SharedStatus>,
  control: Mutex<Option<watch::Sender<ControlSignal>>>,
  result_rx: Mutex<Option<watch::Receiver<Option<DownloadResult>>>>,
  stop_event: Mutex<Option<StopEvent>>,
  verbose: Mutex<Option<controller::VerboseCallback>>,
  session: Mutex<Option<Session>>,
}

/// One download at a time per instance. Configure while Stopped, then
/// [`start`](Downloader::start); the configuration is snapshotted at start and
/// setters return [`Error::AlreadyDownloading`] until the run terminates.
pub struct Downloader {
  inner: Arc<Inner>,
}

impl Default for Downloader {
  fn default() -> Self {
    Self::new()
  }
}

impl Downloader {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        cfg: Mutex::new(Config::default()),
        status: SharedStatus::new(),
        control: Mutex::new(None),
        result_rx: Mutex::new(None),
        stop_event: Mutex::new(None),
        verbose: Mutex::new(None),
        session: Mutex::new(None),
      }),
    }
  }

  fn with_cfg(&self, f: impl FnOnce(&mut Config) -> Result<(), Error>) -> Result<(), Error> {
    if *self.inner.status.state.lock() != DownloadState::Stopped {
      return Err(Error::AlreadyDownloading);
    }
    f(&mut self.inner.cfg.lock())
  }

  /// Max concurrent slice workers, in [1, 100]. Zero or negative selects the
  /// built-in default.
  pub fn set_thread_num(&self, n: i32) -> Result<(), Error> {
    self.with_cfg(|c| c.set_thread_num(n))
  }

  pub fn thread_num(&self) -> u32 {
    self.inner.cfg.lock().thread_num
  }

  /// Connect-phase timeout in milliseconds; zero or negative selects the
  /// built-in default of 3000.
  pub fn set_network_connection_timeout(&self, ms: i32) -> Result<(), Error> {
    self.with_cfg(|c| c.set_conn_timeout_ms(ms))
  }

  pub fn network_connection_timeout(&self) -> Duration {
    self.inner.cfg.lock().conn_timeout
  }

  /// Per-connection read timeout in milliseconds; zero or negative disables.
  pub fn set_network_read_timeout(&self, ms: i32) -> Result<(), Error> {
    self.with_cfg(|c| c.set_read_timeout_ms(ms))
  }

  pub fn network_read_timeout(&self) -> Option<Duration> {
    self.inner.cfg.lock().read_timeout
  }

  pub fn set_fetch_file_info_retry_times(&self, retries: i32) -> Result<(), Error> {
    self.with_cfg(|c| c.set_fetch_info_retries(retries))
  }

  pub fn fetch_file_info_retry_times(&self) -> u32 {
    self.inner.cfg.lock().fetch_info_retries
  }

  /// Probe with `HEAD` (default) or with `GET Range: bytes=0-0`.
  pub fn set_fetch_file_info_use_head(&self, use_head: bool) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.fetch_info_use_head = use_head;
      Ok(())
    })
  }

  pub fn fetch_file_info_use_head(&self) -> bool {
    self.inner.cfg.lock().fetch_info_use_head
  }

  /// Discard a saved temp file older than this many seconds; negative = never.
  pub fn set_tmp_file_expired_seconds(&self, seconds: i32) -> Result<(), Error> {
    self.with_cfg(|c| c.set_tmp_expiry_seconds(seconds))
  }

  pub fn tmp_file_expired_seconds(&self) -> i64 {
    self.inner.cfg.lock().tmp_expiry_seconds
  }

  /// Pool-wide download ceiling in bytes per second; zero or negative =
  /// unlimited.
  pub fn set_max_download_speed(&self, bytes_per_sec: i64) -> Result<(), Error> {
    self.with_cfg(|c| c.set_max_speed_bps(bytes_per_sec))
  }

  pub fn max_download_speed(&self) -> i64 {
    self.inner.cfg.lock().max_speed_bps
  }

  /// Fail the transfer when throughput stays under `bytes_per_sec` for
  /// `duration_s` seconds. Zero or negative speed disables the floor.
  pub fn set_min_download_speed(&self, bytes_per_sec: i64, duration_s: i32) -> Result<(), Error> {
    self.with_cfg(|c| c.set_min_speed(bytes_per_sec, duration_s))
  }

  pub fn min_download_speed(&self) -> i64 {
    self.inner.cfg.lock().min_speed_bps
  }

  pub fn min_download_speed_duration(&self) -> Duration {
    self.inner.cfg.lock().min_speed_duration
  }

  /// Total write-buffer budget in bytes; zero or negative selects the
  /// built-in default of 20 MiB.
  pub fn set_disk_cache_size(&self, bytes: i64) -> Result<(), Error> {
    self.with_cfg(|c| c.set_disk_cache_bytes(bytes))
  }

  pub fn disk_cache_size(&self) -> u64 {
    self.inner.cfg.lock().disk_cache_bytes
  }

  pub fn set_slice_policy(&self, policy: SlicePolicy) -> Result<(), Error> {
    self.with_cfg(|c| c.set_slice_policy(policy))
  }

  pub fn slice_policy(&self) -> SlicePolicy {
    self.inner.cfg.lock().slice_policy
  }

  /// Whole-file hash check. An empty `value` disables verification. When the
  /// origin reports no size, a configured hash is the only proof of
  /// completion.
  pub fn set_hash_verify_policy(
    &self,
    policy: HashVerifyPolicy,
    kind: HashKind,
    value: &str,
  ) -> Result<(), Error> {
    self.with_cfg(|c| c.set_hash_verify(policy, kind, value))
  }

  pub fn hash_verify_policy(&self) -> Option<HashVerify> {
    self.inner.cfg.lock().hash_verify.clone()
  }

  /// When enabled (default), a resumed download whose redirected URL no
  /// longer matches the index record fails with `REDIRECT_URL_DIFFERENT`.
  pub fn set_redirected_url_check_enabled(&self, enabled: bool) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.redirect_check_enabled = enabled;
      Ok(())
    })
  }

  pub fn redirected_url_check_enabled(&self) -> bool {
    self.inner.cfg.lock().redirect_check_enabled
  }

  /// Parse the origin's raw-hex `Content-MD5` and expire saved slices when it
  /// changes. Default off.
  pub fn set_content_md5_enabled(&self, enabled: bool) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.content_md5_enabled = enabled;
      Ok(())
    })
  }

  pub fn content_md5_enabled(&self) -> bool {
    self.inner.cfg.lock().content_md5_enabled
  }

  pub fn set_verify_ca(&self, enabled: bool, ca_path: Option<PathBuf>) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.verify_ca_enabled = enabled;
      c.ca_path = ca_path;
      Ok(())
    })
  }

  pub fn verify_ca_enabled(&self) -> bool {
    self.inner.cfg.lock().verify_ca_enabled
  }

  pub fn ca_path(&self) -> Option<PathBuf> {
    self.inner.cfg.lock().ca_path.clone()
  }

  pub fn set_verify_host_enabled(&self, enabled: bool) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.verify_host_enabled = enabled;
      Ok(())
    })
  }

  pub fn verify_host_enabled(&self) -> bool {
    self.inner.cfg.lock().verify_host_enabled
  }

  /// Proxy URL such as `http://127.0.0.1:8888`; empty clears it.
  pub fn set_proxy(&self, proxy: &str) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.proxy = Some(proxy.trim().to_string()).filter(|p| !p.is_empty());
      Ok(())
    })
  }

  pub fn proxy(&self) -> Option<String> {
    self.inner.cfg.lock().proxy.clone()
  }

  /// Cookie header value sent with every request; empty clears it.
  pub fn set_cookie_list(&self, cookie_list: &str) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.cookie_list = Some(cookie_list.trim().to_string()).filter(|v| !v.is_empty());
      Ok(())
    })
  }

  pub fn cookie_list(&self) -> Option<String> {
    self.inner.cfg.lock().cookie_list.clone()
  }

  /// Extra request headers. Repeated keys are sent in the given order.
  pub fn set_http_headers(&self, headers: Vec<(String, String)>) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.http_headers = headers;
      Ok(())
    })
  }

  pub fn http_headers(&self) -> Vec<(String, String)> {
    self.inner.cfg.lock().http_headers.clone()
  }

  pub fn set_uncompleted_slice_save_policy(
    &self,
    policy: UncompletedSliceSavePolicy,
  ) -> Result<(), Error> {
    self.with_cfg(|c| {
      c.save_policy = policy;
      Ok(())
    })
  }

  pub fn uncompleted_slice_save_policy(&self) -> UncompletedSliceSavePolicy {
    self.inner.cfg.lock().save_policy
  }

  /// Attach an external stop signal; firing it is equivalent to `stop()`.
  pub fn set_stop_event(&self, event: StopEvent) -> Result<(), Error> {
    if *self.inner.status.state.lock() != DownloadState::Stopped {
      return Err(Error::AlreadyDownloading);
    }
    *self.inner.stop_event.lock() = Some(event);
    Ok(())
  }

  pub fn stop_event(&self) -> Option<StopEvent> {
    self.inner.stop_event.lock().clone()
  }

  /// Line-oriented diagnostics sink, called from the controller task.
  pub fn set_verbose_output(&self, verbose: impl Fn(&str) + Send + Sync + 'static) {
    *self.inner.verbose.lock() = Some(Arc::new(verbose));
  }

  /// Begin downloading `url` into `target_file_path`. Must be called inside a
  /// tokio runtime; the transfer runs on a spawned task and the returned
  /// future resolves with the terminal result. Precondition failures are
  /// returned synchronously and leave no trace on disk.
  pub fn start(
    &self,
    url: &str,
    target_file_path: impl Into<PathBuf>,
    mut callbacks: Callbacks,
  ) -> Result<ResultFuture, Error> {
    let url = url.trim().to_string();
    if url.is_empty() {
      return Err(Error::InvalidUrl("empty url".into()));
    }
    let origin_url = Url::parse(&url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    if !matches!(origin_url.scheme(), "http" | "https" | "file") {
      return Err(Error::InvalidUrl(format!("unsupported scheme: {}", origin_url.scheme())));
    }
    let target: PathBuf = target_file_path.into();
    if target.as_os_str().is_empty() {
      return Err(Error::InvalidTargetFilePath("empty path".into()));
    }

    {
      let mut state = self.inner.status.state.lock();
      if *state != DownloadState::Stopped {
        return Err(Error::AlreadyDownloading);
      }
      *state = DownloadState::Downloading;
    }
    let lease = match TargetLease::acquire(&target) {
      Ok(lease) => lease,
      Err(e) => {
        *self.inner.status.state.lock() = DownloadState::Stopped;
        return Err(e);
      }
    };

    let cfg = self.inner.cfg.lock().clone();
    let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
    let (result_tx, result_rx) = watch::channel(None::<DownloadResult>);
    *self.inner.control.lock() = Some(control_tx);
    *self.inner.result_rx.lock() = Some(result_rx.clone());
    *self.inner.session.lock() = Some(Session { url: url.clone(), target: target.clone() });
    self.inner.status.origin_size.store(-1, Ordering::Relaxed);

    let on_result = callbacks.on_result.take();
    let ctx = ControllerCtx {
      cfg,
      origin_url,
      target,
      control: control_rx,
      stop_event: self.inner.stop_event.lock().as_ref().map(|e| e.subscribe()),
      status: self.inner.status.clone(),
      on_progress: callbacks.on_progress,
      on_speed: callbacks.on_speed,
      verbose: self.inner.verbose.lock().clone(),
    };

    let status = self.inner.status.clone();
    tokio::spawn(async move {
      let result = controller::run(ctx).await;
      drop(lease);
      *status.state.lock() = DownloadState::Stopped;
      tracing::info!(code = error::result_code(&result), "download finished");
      if let Some(cb) = on_result {
        let result = result.clone();
        status.dispatch(move || cb(result));
      }
      let _ = result_tx.send(Some(result));
    });

    Ok(ResultFuture { rx: result_rx })
  }

  /// Quiesce the workers and persist progress. No-op unless Downloading.
  pub fn pause(&self) {
    if self.inner.status.in_callback.load(Ordering::SeqCst) {
      return;
    }
    if *self.inner.status.state.lock() == DownloadState::Downloading {
      self.send_signal(ControlSignal::Pause);
    }
  }

  /// Respawn workers over the Pending slices. No-op unless Paused.
  pub fn resume(&self) {
    if self.inner.status.in_callback.load(Ordering::SeqCst) {
      return;
    }
    if *self.inner.status.state.lock() == DownloadState::Paused {
      self.send_signal(ControlSignal::Run);
    }
  }

  /// Cancel the run; the result resolves to `CANCELED`.
  pub fn stop(&self) {
    if self.inner.status.in_callback.load(Ordering::SeqCst) {
      return;
    }
    if *self.inner.status.state.lock() != DownloadState::Stopped {
      self.send_signal(ControlSignal::Stop);
    }
  }

  fn send_signal(&self, signal: ControlSignal) {
    if let Some(tx) = self.inner.control.lock().as_ref() {
      let _ = tx.send(signal);
    }
  }

  pub fn state(&self) -> DownloadState {
    *self.inner.status.state.lock()
  }

  /// URL of the current or most recent download.
  pub fn url(&self) -> Option<String> {
    self.inner.session.lock().as_ref().map(|s| s.url.clone())
  }

  pub fn target_file_path(&self) -> Option<PathBuf> {
    self.inner.session.lock().as_ref().map(|s| s.target.clone())
  }

  /// Remote size learned by the probe; -1 while unknown.
  pub fn origin_file_size(&self) -> i64 {
    self.inner.status.origin_size.load(Ordering::Relaxed)
  }

  /// Another handle to the pending (or delivered) terminal result.
  pub fn future_result(&self) -> Option<ResultFuture> {
    self.inner.result_rx.lock().clone().map(|rx| ResultFuture { rx })
  }
}

/// One-shot, shareable handle to a download's terminal result.
#[derive(Clone)]
pub struct ResultFuture {
  rx: watch::Receiver<Option<DownloadResult>>,
}

impl ResultFuture {
  /// Wait for the run to terminate.
  pub async fn wait(mut self) -> DownloadResult {
    loop {
      if let Some(result) = self.rx.borrow_and_update().clone() {
        return result;
      }
      if self.rx.changed().await.is_err() {
        return Err(Error::Unknown("controller ended without a result".into()));
      }
    }
  }

  /// Non-blocking peek at the result.
  pub fn try_result(&self) -> Option<DownloadResult> {
    self.rx.borrow().clone()
  }
}
