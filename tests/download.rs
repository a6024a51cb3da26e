use axum::{
  body::{Body, Bytes},
  extract::State,
  http::{header, HeaderMap, StatusCode},
  response::{IntoResponse, Response},
  Router,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use zoe::{
  Callbacks, DownloadState, Downloader, Error, HashKind, HashVerifyPolicy, SlicePolicy,
  UncompletedSliceSavePolicy,
};

#[derive(Clone)]
struct ServerState {
  content: Arc<Vec<u8>>,
  accept_ranges: bool,
  send_length: bool,
  /// Per-16KiB-chunk delay, to keep a transfer in flight long enough to
  /// pause or stop it.
  chunk_delay: Option<Duration>,
  /// Range header of every GET, `None` for un-ranged requests.
  range_log: Arc<Mutex<Vec<Option<String>>>>,
}

impl ServerState {
  fn new(content: Vec<u8>) -> Self {
    Self {
      content: Arc::new(content),
      accept_ranges: true,
      send_length: true,
      chunk_delay: None,
      range_log: Arc::new(Mutex::new(Vec::new())),
    }
  }
}

struct Fixture {
  addr: SocketAddr,
  state: ServerState,
}

impl Fixture {
  async fn spawn(state: ServerState) -> Self {
    let app = Router::new()
      .route("/file", axum::routing::head(handle_head).get(handle_get))
      .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    Self { addr, state }
  }

  fn url(&self) -> String {
    format!("http://{}/file", self.addr)
  }

  fn logged_ranges(&self) -> Vec<Option<String>> {
    self.state.range_log.lock().clone()
  }
}

async fn handle_head(State(s): State<ServerState>) -> Response {
  let mut headers = HeaderMap::new();
  if s.send_length {
    headers.insert(header::CONTENT_LENGTH, s.content.len().into());
  }
  if s.accept_ranges {
    headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
  }
  (StatusCode::OK, headers).into_response()
}

async fn handle_get(State(s): State<ServerState>, req_headers: HeaderMap) -> Response {
  let range = req_headers
    .get(header::RANGE)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_string());
  s.range_log.lock().push(range.clone());

  let total = s.content.len();
  if s.accept_ranges {
    if let Some((start, end)) = range.as_deref().and_then(|r| parse_range(r, total)) {
      let slice = s.content[start..=end].to_vec();
      let mut headers = HeaderMap::new();
      headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
      headers
        .insert(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}").parse().unwrap());
      headers.insert(header::CONTENT_LENGTH, slice.len().into());
      return (StatusCode::PARTIAL_CONTENT, headers, throttled_body(slice, s.chunk_delay))
        .into_response();
    }
  }

  let mut headers = HeaderMap::new();
  if s.accept_ranges {
    headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
  }
  if s.send_length {
    headers.insert(header::CONTENT_LENGTH, total.into());
  }
  // Without an explicit Content-Length the body goes out chunked, which is
  // exactly the unknown-size origin the tests below need.
  (StatusCode::OK, headers, throttled_body(s.content.to_vec(), s.chunk_delay)).into_response()
}

fn throttled_body(data: Vec<u8>, delay: Option<Duration>) -> Body {
  let chunks: Vec<Bytes> = data.chunks(16 * 1024).map(Bytes::copy_from_slice).collect();
  let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>)).then(
    move |chunk| async move {
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      chunk
    },
  );
  Body::from_stream(stream)
}

/// `bytes=a-b` or `bytes=a-`, inclusive bounds.
fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
  let spec = value.strip_prefix("bytes=")?;
  let (start, end) = spec.split_once('-')?;
  let start: usize = start.parse().ok()?;
  let end: usize = if end.is_empty() { total - 1 } else { end.parse().ok()? };
  if start >= total || end < start {
    return None;
  }
  Some((start, end.min(total - 1)))
}

fn test_content(len: usize) -> Vec<u8> {
  let mut out = Vec::with_capacity(len);
  let mut x: u32 = 0x2545_f491;
  while out.len() < len {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    out.extend_from_slice(&x.to_le_bytes());
  }
  out.truncate(len);
  out
}

fn sha256_hex(data: &[u8]) -> String {
  let digest = Sha256::digest(data);
  digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn tmp_path(target: &Path) -> PathBuf {
  PathBuf::from(format!("{}.zoe.tmp", target.display()))
}

fn idx_path(target: &Path) -> PathBuf {
  PathBuf::from(format!("{}.zoe.idx", target.display()))
}

async fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
  let start = Instant::now();
  while !cond() {
    assert!(start.elapsed() < timeout, "timed out waiting for {what}");
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_slice_happy_path() {
  let content = test_content(1_048_576);
  let fx = Fixture::spawn(ServerState::new(content.clone())).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("happy.bin");

  let dl = Downloader::new();
  dl.set_thread_num(4).unwrap();
  let last_progress = Arc::new(AtomicI64::new(-1));
  let progress = last_progress.clone();
  let results = Arc::new(Mutex::new(Vec::new()));
  let results_cb = results.clone();

  let fut = dl
    .start(
      &fx.url(),
      &target,
      Callbacks {
        on_result: Some(Box::new(move |r| results_cb.lock().push(r))),
        on_progress: Some(Box::new(move |_total, done| {
          progress.store(done, Ordering::Relaxed);
        })),
        on_speed: None,
      },
    )
    .unwrap();

  assert_eq!(fut.wait().await, Ok(()));
  assert_eq!(std::fs::read(&target).unwrap(), content);
  assert_eq!(dl.state(), DownloadState::Stopped);
  assert_eq!(dl.origin_file_size(), content.len() as i64);
  assert!(!tmp_path(&target).exists());
  assert!(!idx_path(&target).exists());
  assert_eq!(results.lock().as_slice(), &[Ok(())]);
  assert_eq!(last_progress.load(Ordering::Relaxed), content.len() as i64);

  // Default 10 MiB slices over a 1 MiB file: exactly one ranged request.
  let ranged: Vec<_> = fx.logged_ranges().into_iter().flatten().collect();
  assert_eq!(ranged, vec![format!("bytes=0-{}", content.len() - 1)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_slices_reassemble_byte_exact() {
  let content = test_content(5 * 1_048_576);
  let reference = sha256_hex(&content);
  let fx = Fixture::spawn(ServerState::new(content.clone())).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("parallel.bin");

  let dl = Downloader::new();
  dl.set_thread_num(4).unwrap();
  dl.set_slice_policy(SlicePolicy::FixedSize(1_048_576)).unwrap();
  dl.set_hash_verify_policy(HashVerifyPolicy::AlwaysVerify, HashKind::Sha256, &reference)
    .unwrap();

  let fut = dl.start(&fx.url(), &target, Callbacks::default()).unwrap();
  assert_eq!(fut.wait().await, Ok(()));

  let downloaded = std::fs::read(&target).unwrap();
  assert_eq!(sha256_hex(&downloaded), reference);
  assert_eq!(fx.logged_ranges().into_iter().flatten().count(), 5);
}

fn seed_index(
  target: &Path,
  origin_url: &str,
  content: &[u8],
  slice_size: usize,
  completed: &[usize],
) {
  let total = content.len();
  let saved_at = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
  let mut slices = Vec::new();
  let mut begin = 0usize;
  let mut i = 0usize;
  while begin < total {
    let end = (begin + slice_size).min(total);
    slices.push(format!(
      r#"{{"begin":{begin},"end":{end},"completed":{}}}"#,
      completed[i]
    ));
    begin = end;
    i += 1;
  }
  let record = format!(
    r#"{{"schema_version":1,"origin_url":"{origin_url}","effective_url":"{origin_url}","content_length":{total},"saved_at":{saved_at},"slice_policy":{{"mode":"fixed_size","value":{slice_size}}},"slices":[{}]}}"#,
    slices.join(",")
  );
  std::fs::write(idx_path(target), record).unwrap();

  // Temp file: completed prefixes hold real bytes, the rest stays zeroed.
  let mut tmp = vec![0u8; total];
  for (i, done) in completed.iter().enumerate() {
    let begin = i * slice_size;
    tmp[begin..begin + done].copy_from_slice(&content[begin..begin + done]);
  }
  std::fs::write(tmp_path(target), tmp).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_downloads_only_unfinished_slices() {
  let slice = 1_048_576usize;
  let content = test_content(4 * slice);
  let fx = Fixture::spawn(ServerState::new(content.clone())).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("resume.bin");

  // Two slices already done, two untouched, as an interrupted run with the
  // keep-progress policy would have left them.
  seed_index(&target, &fx.url(), &content, slice, &[slice, slice, 0, 0]);

  let dl = Downloader::new();
  dl.set_thread_num(4).unwrap();
  dl.set_slice_policy(SlicePolicy::FixedSize(slice as u64)).unwrap();
  dl.set_uncompleted_slice_save_policy(UncompletedSliceSavePolicy::SaveExceptFailed).unwrap();

  let fut = dl.start(&fx.url(), &target, Callbacks::default()).unwrap();
  assert_eq!(fut.wait().await, Ok(()));
  assert_eq!(std::fs::read(&target).unwrap(), content);

  // No byte of the Done slices is re-requested.
  let ranged: Vec<_> = fx.logged_ranges().into_iter().flatten().collect();
  assert_eq!(ranged.len(), 2);
  for r in &ranged {
    let start: usize =
      r.strip_prefix("bytes=").unwrap().split('-').next().unwrap().parse().unwrap();
    assert!(start >= 2 * slice, "re-downloaded a finished slice: {r}");
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_origin_url_rejects_and_unlinks() {
  let slice = 1_048_576usize;
  let content = test_content(2 * slice);
  let fx = Fixture::spawn(ServerState::new(content.clone())).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("moved.bin");

  seed_index(&target, "http://127.0.0.1:9/file", &content, slice, &[slice, 0]);

  let dl = Downloader::new();
  dl.set_slice_policy(SlicePolicy::FixedSize(slice as u64)).unwrap();
  let fut = dl.start(&fx.url(), &target, Callbacks::default()).unwrap();
  assert_eq!(fut.wait().await, Err(Error::UrlDifferent));

  assert!(!target.exists());
  assert!(!tmp_path(&target).exists());
  assert!(!idx_path(&target).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_size_completes_through_hash() {
  let content = test_content(512 * 1024);
  let reference = sha256_hex(&content);
  let mut state = ServerState::new(content.clone());
  state.accept_ranges = false;
  state.send_length = false;
  let fx = Fixture::spawn(state).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("nolen.bin");

  let dl = Downloader::new();
  // Probe with a ranged GET: an empty HEAD answer would otherwise carry a
  // synthetic content-length of zero from the fixture server.
  dl.set_fetch_file_info_use_head(false).unwrap();
  dl.set_hash_verify_policy(HashVerifyPolicy::OnlyIfNoSize, HashKind::Sha256, &reference)
    .unwrap();

  let fut = dl.start(&fx.url(), &target, Callbacks::default()).unwrap();
  assert_eq!(fut.wait().await, Ok(()));
  assert_eq!(std::fs::read(&target).unwrap(), content);
  assert_eq!(dl.origin_file_size(), -1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_size_without_hash_is_not_clearly_successful() {
  let content = test_content(256 * 1024);
  let mut state = ServerState::new(content.clone());
  state.accept_ranges = false;
  state.send_length = false;
  let fx = Fixture::spawn(state).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("unclear.bin");

  let dl = Downloader::new();
  dl.set_fetch_file_info_use_head(false).unwrap();
  let fut = dl.start(&fx.url(), &target, Callbacks::default()).unwrap();
  assert_eq!(fut.wait().await, Err(Error::NotClearlyResult));

  // The bytes are kept for a caller who can vouch for them another way.
  assert!(!target.exists());
  assert!(tmp_path(&target).exists());
  assert!(idx_path(&target).exists());
  assert_eq!(std::fs::read(tmp_path(&target)).unwrap(), content);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_hash_sets_the_tmp_file_aside() {
  let content = test_content(128 * 1024);
  let fx = Fixture::spawn(ServerState::new(content.clone())).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("badhash.bin");

  let dl = Downloader::new();
  dl.set_hash_verify_policy(HashVerifyPolicy::AlwaysVerify, HashKind::Sha256, &"0".repeat(64))
    .unwrap();

  let fut = dl.start(&fx.url(), &target, Callbacks::default()).unwrap();
  match fut.wait().await {
    Err(Error::HashVerifyNotPass { expected, actual }) => {
      assert_eq!(expected, "0".repeat(64));
      assert_eq!(actual, sha256_hex(&content));
    }
    other => panic!("unexpected result: {other:?}"),
  }
  assert!(!target.exists());
  assert!(!tmp_path(&target).exists());
  assert!(!idx_path(&target).exists());
  let bad = PathBuf::from(format!("{}.bad", tmp_path(&target).display()));
  assert_eq!(std::fs::read(&bad).unwrap(), content);
}

fn slow_fixture_state(content: Vec<u8>) -> ServerState {
  let mut state = ServerState::new(content);
  state.chunk_delay = Some(Duration::from_millis(20));
  state
}

fn start_slow_download(
  fx: &Fixture,
  target: &Path,
  policy: UncompletedSliceSavePolicy,
) -> (Downloader, zoe::ResultFuture, Arc<AtomicI64>) {
  let dl = Downloader::new();
  dl.set_thread_num(2).unwrap();
  dl.set_slice_policy(SlicePolicy::FixedSize(1_048_576)).unwrap();
  dl.set_uncompleted_slice_save_policy(policy).unwrap();

  let seen = Arc::new(AtomicI64::new(0));
  let progress = seen.clone();
  let fut = dl
    .start(
      &fx.url(),
      target,
      Callbacks {
        on_progress: Some(Box::new(move |_t, done| progress.store(done, Ordering::Relaxed))),
        ..Default::default()
      },
    )
    .unwrap();
  (dl, fut, seen)
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_with_discard_policy_leaves_nothing() {
  let content = test_content(4 * 1_048_576);
  let fx = Fixture::spawn(slow_fixture_state(content)).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("stopped.bin");

  let (dl, fut, seen) =
    start_slow_download(&fx, &target, UncompletedSliceSavePolicy::AlwaysDiscard);
  wait_until("first bytes", Duration::from_secs(10), || seen.load(Ordering::Relaxed) > 0).await;
  dl.stop();

  assert_eq!(fut.wait().await, Err(Error::Canceled));
  assert!(!target.exists());
  assert!(!tmp_path(&target).exists());
  assert!(!idx_path(&target).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_with_save_policy_keeps_the_pair() {
  let content = test_content(4 * 1_048_576);
  let fx = Fixture::spawn(slow_fixture_state(content)).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("kept.bin");

  let (dl, fut, seen) =
    start_slow_download(&fx, &target, UncompletedSliceSavePolicy::SaveExceptFailed);
  wait_until("first bytes", Duration::from_secs(10), || seen.load(Ordering::Relaxed) > 0).await;
  dl.stop();

  assert_eq!(fut.wait().await, Err(Error::Canceled));
  assert!(!target.exists());
  assert!(tmp_path(&target).exists());
  assert!(idx_path(&target).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_then_resume_is_lossless() {
  let content = test_content(2 * 1_048_576);
  let fx = Fixture::spawn(slow_fixture_state(content.clone())).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("paused.bin");

  let (dl, fut, seen) =
    start_slow_download(&fx, &target, UncompletedSliceSavePolicy::SaveExceptFailed);
  wait_until("first bytes", Duration::from_secs(10), || seen.load(Ordering::Relaxed) > 0).await;

  dl.pause();
  wait_until("paused state", Duration::from_secs(10), || dl.state() == DownloadState::Paused)
    .await;

  dl.resume();
  assert_eq!(fut.wait().await, Ok(()));
  assert_eq!(std::fs::read(&target).unwrap(), content);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_is_rejected_while_running() {
  let content = test_content(2 * 1_048_576);
  let fx = Fixture::spawn(slow_fixture_state(content)).await;
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("busy.bin");

  let (dl, fut, seen) =
    start_slow_download(&fx, &target, UncompletedSliceSavePolicy::AlwaysDiscard);
  wait_until("first bytes", Duration::from_secs(10), || seen.load(Ordering::Relaxed) > 0).await;

  // Same instance and a fresh instance against the same target both bounce.
  assert!(matches!(
    dl.start(&fx.url(), &target, Callbacks::default()),
    Err(Error::AlreadyDownloading)
  ));
  let other = Downloader::new();
  assert!(matches!(
    other.start(&fx.url(), &target, Callbacks::default()),
    Err(Error::AlreadyDownloading)
  ));

  dl.stop();
  assert_eq!(fut.wait().await, Err(Error::Canceled));
}

#[tokio::test(flavor = "multi_thread")]
async fn local_file_source_copies_byte_exact() {
  let content = test_content(3 * 1_048_576);
  let dir = tempfile::tempdir().unwrap();
  let source = dir.path().join("source.bin");
  std::fs::write(&source, &content).unwrap();
  let target = dir.path().join("copy.bin");

  let dl = Downloader::new();
  dl.set_thread_num(3).unwrap();
  dl.set_slice_policy(SlicePolicy::FixedSize(1_048_576)).unwrap();

  let url = format!("file://{}", source.display());
  let fut = dl.start(&url, &target, Callbacks::default()).unwrap();
  assert_eq!(fut.wait().await, Ok(()));
  assert_eq!(std::fs::read(&target).unwrap(), content);
}
