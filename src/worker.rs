use crate::{
  bandwidth::RateLimiter,
  cache::{DiskCache, SliceWriter},
  controller::ControlSignal,
  error::Error,
  file_util::OffsetIo,
};
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

pub(crate) const SLICE_MAX_ATTEMPTS: u32 = 5;
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const LOCAL_READ_CHUNK: usize = 64 * 1024;

/// Unit of work pulled from the shared queue. Carries everything a worker
/// needs so it never touches the controller's slice table.
#[derive(Debug, Clone)]
pub(crate) struct SliceJob {
  pub index: u32,
  pub begin: u64,
  /// Exclusive; `None` = open-ended.
  pub end: Option<u64>,
  pub completed: u64,
  pub cache_share: usize,
}

impl SliceJob {
  fn len(&self) -> Option<u64> {
    self.end.map(|e| e - self.begin)
  }

  fn is_byte_complete(&self) -> bool {
    matches!(self.len(), Some(len) if self.completed >= len)
  }
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
  Claimed { slice: u32 },
  Progress { slice: u32, delta: u64 },
  /// Absolute durable byte count for the slice (flushed out of the cache).
  Flushed { slice: u32, durable: u64 },
  Done { slice: u32, completed: u64 },
  Failed { slice: u32, durable: u64, error: Error },
  /// Pause/stop observed; the slice goes back to Pending with its progress.
  Quiesced { slice: u32, completed: u64, durable: u64 },
}

#[derive(Clone)]
pub(crate) enum SliceSource {
  Http { client: reqwest::Client, url: String, accepts_ranges: bool },
  LocalFile { path: PathBuf },
}

pub(crate) struct WorkerCtx {
  pub source: SliceSource,
  pub cache: Arc<DiskCache>,
  pub limiter: RateLimiter,
  pub queue: Arc<parking_lot::Mutex<VecDeque<SliceJob>>>,
  pub events: mpsc::Sender<WorkerEvent>,
  pub control: watch::Receiver<ControlSignal>,
}

enum SliceOutcome {
  Done,
  Quiesced,
  Failed,
  ControllerGone,
}

enum StreamEnd {
  Done,
  Quiesced,
}

enum StreamFail {
  Transient(String),
  Fatal(Error),
}

/// Worker task: pull Pending slices until the queue drains or a signal stops
/// the run. One terminal event is emitted per claimed slice.
pub(crate) async fn run_worker(mut ctx: WorkerCtx) {
  loop {
    if *ctx.control.borrow() != ControlSignal::Run {
      return;
    }
    let Some(job) = ctx.queue.lock().pop_front() else {
      return;
    };
    if ctx.events.send(WorkerEvent::Claimed { slice: job.index }).await.is_err() {
      return;
    }
    match download_slice(&mut ctx, job).await {
      SliceOutcome::Done => continue,
      SliceOutcome::Quiesced | SliceOutcome::Failed | SliceOutcome::ControllerGone => return,
    }
  }
}

async fn download_slice(ctx: &mut WorkerCtx, mut job: SliceJob) -> SliceOutcome {
  let slice = job.index;
  let mut writer = ctx.cache.writer(job.begin + job.completed, job.cache_share);
  let mut backoff = BACKOFF_INITIAL;

  for attempt in 1..=SLICE_MAX_ATTEMPTS {
    match stream_once(ctx, &mut job, &mut writer).await {
      Ok(StreamEnd::Done) => {
        return match finalize_slice(ctx, &job, &mut writer, None).await {
          Some(outcome) => outcome,
          None => SliceOutcome::Done,
        };
      }
      Ok(StreamEnd::Quiesced) => {
        return quiesce_slice(ctx, &job, &mut writer).await;
      }
      Err(StreamFail::Fatal(error)) => {
        tracing::error!(slice, error = %error, "slice failed");
        return match finalize_slice(ctx, &job, &mut writer, Some(error)).await {
          Some(outcome) => outcome,
          None => SliceOutcome::Failed,
        };
      }
      Err(StreamFail::Transient(msg)) => {
        if attempt == SLICE_MAX_ATTEMPTS {
          tracing::error!(slice, attempt, error = %msg, "slice retries exhausted");
          return match finalize_slice(ctx, &job, &mut writer, Some(Error::SliceDownloadFailed))
            .await
          {
            Some(outcome) => outcome,
            None => SliceOutcome::Failed,
          };
        }
        tracing::warn!(slice, attempt, error = %msg, backoff_ms = backoff.as_millis() as u64, "slice attempt failed");
        tokio::select! {
          _ = tokio::time::sleep(backoff) => {}
          _ = wait_not_run(&mut ctx.control) => {
            return quiesce_slice(ctx, &job, &mut writer).await;
          }
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
      }
    }
  }
  unreachable!("retry loop always returns");
}

/// Flush and emit the terminal event for a slice. Returns `Some` only when
/// the flush itself failed or the controller went away.
async fn finalize_slice(
  ctx: &mut WorkerCtx,
  job: &SliceJob,
  writer: &mut SliceWriter,
  error: Option<Error>,
) -> Option<SliceOutcome> {
  let durable = match writer.flush() {
    Ok(offset) => offset - job.begin,
    Err(e) => {
      let event = WorkerEvent::Failed {
        slice: job.index,
        durable: writer.durable_offset() - job.begin,
        error: Error::FlushTmpFileFailed(e.to_string()),
      };
      let _ = ctx.events.send(event).await;
      return Some(SliceOutcome::Failed);
    }
  };
  let event = match error {
    None => WorkerEvent::Done { slice: job.index, completed: job.completed },
    Some(error) => WorkerEvent::Failed { slice: job.index, durable, error },
  };
  if ctx.events.send(event).await.is_err() {
    return Some(SliceOutcome::ControllerGone);
  }
  None
}

async fn quiesce_slice(
  ctx: &mut WorkerCtx,
  job: &SliceJob,
  writer: &mut SliceWriter,
) -> SliceOutcome {
  match writer.flush() {
    Ok(offset) => {
      let event = WorkerEvent::Quiesced {
        slice: job.index,
        completed: job.completed,
        durable: offset - job.begin,
      };
      if ctx.events.send(event).await.is_err() {
        return SliceOutcome::ControllerGone;
      }
      SliceOutcome::Quiesced
    }
    Err(e) => {
      let event = WorkerEvent::Failed {
        slice: job.index,
        durable: writer.durable_offset() - job.begin,
        error: Error::FlushTmpFileFailed(e.to_string()),
      };
      let _ = ctx.events.send(event).await;
      SliceOutcome::Failed
    }
  }
}

/// Resolves once the control signal leaves `Run` (or the sender is gone).
async fn wait_not_run(control: &mut watch::Receiver<ControlSignal>) {
  loop {
    if *control.borrow() != ControlSignal::Run {
      return;
    }
    if control.changed().await.is_err() {
      return;
    }
  }
}

async fn stream_once(
  ctx: &mut WorkerCtx,
  job: &mut SliceJob,
  writer: &mut SliceWriter,
) -> Result<StreamEnd, StreamFail> {
  if job.is_byte_complete() {
    return Ok(StreamEnd::Done);
  }
  match ctx.source.clone() {
    SliceSource::Http { client, url, accepts_ranges } => {
      stream_http(ctx, job, writer, &client, &url, accepts_ranges).await
    }
    SliceSource::LocalFile { path } => stream_local(ctx, job, writer, &path).await,
  }
}

async fn stream_http(
  ctx: &mut WorkerCtx,
  job: &mut SliceJob,
  writer: &mut SliceWriter,
  client: &reqwest::Client,
  url: &str,
  accepts_ranges: bool,
) -> Result<StreamEnd, StreamFail> {
  let start = job.begin + job.completed;
  let mut req = client.get(url);
  if accepts_ranges {
    let range = match job.end {
      Some(end) => format!("bytes={start}-{}", end - 1),
      None => format!("bytes={start}-"),
    };
    req = req.header(RANGE, HeaderValue::from_str(&range).expect("range header is ascii"));
  }

  let resp = req.send().await.map_err(|e| StreamFail::Transient(e.to_string()))?;
  let status = resp.status();

  // How many body bytes to silently drop before real payload starts. A 200
  // answer restarts the representation from byte zero even when we asked to
  // resume, so previously completed bytes are re-read but never re-counted.
  let mut skip: u64 = 0;
  match status {
    StatusCode::PARTIAL_CONTENT => {}
    StatusCode::OK => {
      if job.begin > 0 {
        return Err(StreamFail::Fatal(Error::SliceDownloadFailed));
      }
      skip = job.completed;
    }
    StatusCode::RANGE_NOT_SATISFIABLE => {
      return if job.is_byte_complete() {
        Ok(StreamEnd::Done)
      } else {
        Err(StreamFail::Fatal(Error::SliceDownloadFailed))
      };
    }
    s if s.is_client_error() => {
      return if matches!(s, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS) {
        Err(StreamFail::Transient(format!("http {}", s.as_u16())))
      } else {
        Err(StreamFail::Fatal(Error::SliceDownloadFailed))
      };
    }
    s => return Err(StreamFail::Transient(format!("http {}", s.as_u16()))),
  }

  let mut stream = resp.bytes_stream();
  loop {
    let next = tokio::select! {
      next = stream.next() => next,
      _ = wait_not_run(&mut ctx.control) => return Ok(StreamEnd::Quiesced),
    };
    let chunk: bytes::Bytes = match next {
      None => {
        return match job.len() {
          // Clean close is completion for an open-ended slice.
          None => Ok(StreamEnd::Done),
          Some(len) if job.completed >= len => Ok(StreamEnd::Done),
          Some(len) => Err(StreamFail::Transient(format!(
            "connection closed at {}/{len}",
            job.completed
          ))),
        };
      }
      Some(Err(e)) => return Err(StreamFail::Transient(e.to_string())),
      Some(Ok(chunk)) => chunk,
    };

    let mut data: &[u8] = &chunk;
    if skip > 0 {
      let drop = (skip as usize).min(data.len());
      skip -= drop as u64;
      data = &data[drop..];
      if data.is_empty() {
        continue;
      }
    }
    // Never accept bytes past the slice end.
    if let Some(len) = job.len() {
      let want = (len - job.completed) as usize;
      if data.len() > want {
        data = &data[..want];
      }
    }

    tokio::select! {
      _ = ctx.limiter.acquire(data.len()) => {}
      _ = wait_not_run(&mut ctx.control) => return Ok(StreamEnd::Quiesced),
    }

    accept_bytes(ctx, job, writer, data).await?;
    if job.is_byte_complete() {
      return Ok(StreamEnd::Done);
    }
  }
}

async fn stream_local(
  ctx: &mut WorkerCtx,
  job: &mut SliceJob,
  writer: &mut SliceWriter,
  path: &std::path::Path,
) -> Result<StreamEnd, StreamFail> {
  let file = std::fs::File::open(path).map_err(|e| StreamFail::Transient(e.to_string()))?;
  let mut buf = vec![0u8; LOCAL_READ_CHUNK];
  loop {
    if *ctx.control.borrow() != ControlSignal::Run {
      return Ok(StreamEnd::Quiesced);
    }
    let offset = job.begin + job.completed;
    let want = match job.len() {
      Some(len) => ((len - job.completed) as usize).min(buf.len()),
      None => buf.len(),
    };
    if want == 0 {
      return Ok(StreamEnd::Done);
    }
    let n = file
      .read_full_at(&mut buf[..want], offset)
      .map_err(|e| StreamFail::Transient(e.to_string()))?;
    if n == 0 {
      return match job.len() {
        None => Ok(StreamEnd::Done),
        Some(len) if job.completed >= len => Ok(StreamEnd::Done),
        // Source shrank underneath us; no retry will recover it.
        Some(_) => Err(StreamFail::Fatal(Error::SliceDownloadFailed)),
      };
    }
    accept_bytes(ctx, job, writer, &buf[..n]).await?;
    // Yield so the control signal is observed within a chunk boundary.
    tokio::task::yield_now().await;
  }
}

async fn accept_bytes(
  ctx: &mut WorkerCtx,
  job: &mut SliceJob,
  writer: &mut SliceWriter,
  data: &[u8],
) -> Result<(), StreamFail> {
  let before = writer.durable_offset();
  let after = writer
    .write(data)
    .map_err(|e| StreamFail::Fatal(Error::FlushTmpFileFailed(e.to_string())))?;
  job.completed += data.len() as u64;

  let events = &ctx.events;
  if events
    .send(WorkerEvent::Progress { slice: job.index, delta: data.len() as u64 })
    .await
    .is_err()
  {
    return Err(StreamFail::Fatal(Error::Canceled));
  }
  if after != before {
    let _ = events
      .send(WorkerEvent::Flushed { slice: job.index, durable: after - job.begin })
      .await;
  }
  Ok(())
}
