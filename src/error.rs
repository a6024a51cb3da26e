/// Terminal result codes. A download resolves to `Ok(())` or exactly one of these.
///
/// Configuration setters reuse the same type so the `INVALID_*` family is
/// reported through one channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
  #[error("unknown error: {0}")]
  Unknown(String),
  #[error("invalid url: {0}")]
  InvalidUrl(String),
  #[error("index file failed structural validation")]
  InvalidIndexFormat,
  #[error("invalid target file path: {0}")]
  InvalidTargetFilePath(String),
  #[error("thread num {0} out of range [1, 100]")]
  InvalidThreadNum(i32),
  #[error("invalid hash verify policy")]
  InvalidHashPolicy,
  #[error("invalid slice policy")]
  InvalidSlicePolicy,
  #[error("invalid network connection timeout")]
  InvalidConnTimeout,
  #[error("invalid network read timeout")]
  InvalidReadTimeout,
  #[error("invalid fetch-file-info retry times")]
  InvalidFetchInfoRetries,
  #[error("a download is already running for this instance or target")]
  AlreadyDownloading,
  #[error("canceled")]
  Canceled,
  #[error("failed to rename tmp file: {0}")]
  RenameTmpFileFailed(String),
  #[error("failed to open index file: {0}")]
  OpenIndexFileFailed(String),
  #[error("tmp file expired")]
  TmpFileExpired,
  #[error("failed to create target file: {0}")]
  CreateTargetFileFailed(String),
  #[error("failed to create tmp file: {0}")]
  CreateTmpFileFailed(String),
  #[error("failed to open tmp file: {0}")]
  OpenTmpFileFailed(String),
  #[error("url differs from the one recorded in the index file")]
  UrlDifferent,
  #[error("tmp file size does not match the index record")]
  TmpFileSizeError,
  #[error("tmp file cannot be read or written")]
  TmpFileCannotRw,
  #[error("failed to flush tmp file: {0}")]
  FlushTmpFileFailed(String),
  #[error("failed to update index file: {0}")]
  UpdateIndexFileFailed(String),
  #[error("slice download failed after retries")]
  SliceDownloadFailed,
  #[error("hash verify not pass: expected {expected}, got {actual}")]
  HashVerifyNotPass { expected: String, actual: String },
  #[error("failed to calculate hash: {0}")]
  CalculateHashFailed(String),
  #[error("failed to fetch file info: {0}")]
  FetchFileInfoFailed(String),
  #[error("redirected url differs from the one recorded in the index file")]
  RedirectUrlDifferent,
  #[error("transfer ended without a provable completion")]
  NotClearlyResult,
}

impl Error {
  /// Stable wire name, usable across versions and bindings.
  pub fn code(&self) -> &'static str {
    match self {
      Error::Unknown(_) => "UNKNOWN_ERROR",
      Error::InvalidUrl(_) => "INVALID_URL",
      Error::InvalidIndexFormat => "INVALID_INDEX_FORMAT",
      Error::InvalidTargetFilePath(_) => "INVALID_TARGET_FILE_PATH",
      Error::InvalidThreadNum(_) => "INVALID_THREAD_NUM",
      Error::InvalidHashPolicy => "INVALID_HASH_POLICY",
      Error::InvalidSlicePolicy => "INVALID_SLICE_POLICY",
      Error::InvalidConnTimeout => "INVALID_NETWORK_CONN_TIMEOUT",
      Error::InvalidReadTimeout => "INVALID_NETWORK_READ_TIMEOUT",
      Error::InvalidFetchInfoRetries => "INVALID_FETCH_FILE_INFO_RETRY_TIMES",
      Error::AlreadyDownloading => "ALREADY_DOWNLOADING",
      Error::Canceled => "CANCELED",
      Error::RenameTmpFileFailed(_) => "RENAME_TMP_FILE_FAILED",
      Error::OpenIndexFileFailed(_) => "OPEN_INDEX_FILE_FAILED",
      Error::TmpFileExpired => "TMP_FILE_EXPIRED",
      Error::CreateTargetFileFailed(_) => "CREATE_TARGET_FILE_FAILED",
      Error::CreateTmpFileFailed(_) => "CREATE_TMP_FILE_FAILED",
      Error::OpenTmpFileFailed(_) => "OPEN_TMP_FILE_FAILED",
      Error::UrlDifferent => "URL_DIFFERENT",
      Error::TmpFileSizeError => "TMP_FILE_SIZE_ERROR",
      Error::TmpFileCannotRw => "TMP_FILE_CANNOT_RW",
      Error::FlushTmpFileFailed(_) => "FLUSH_TMP_FILE_FAILED",
      Error::UpdateIndexFileFailed(_) => "UPDATE_INDEX_FILE_FAILED",
      Error::SliceDownloadFailed => "SLICE_DOWNLOAD_FAILED",
      Error::HashVerifyNotPass { .. } => "HASH_VERIFY_NOT_PASS",
      Error::CalculateHashFailed(_) => "CALCULATE_HASH_FAILED",
      Error::FetchFileInfoFailed(_) => "FETCH_FILE_INFO_FAILED",
      Error::RedirectUrlDifferent => "REDIRECT_URL_DIFFERENT",
      Error::NotClearlyResult => "NOT_CLEARLY_RESULT",
    }
  }

  /// Whether the tmp/index pair stays on disk for a later resume.
  /// Stale-state codes unlink both so the next start is cold.
  pub(crate) fn preserves_resume_data(&self) -> bool {
    !matches!(
      self,
      Error::UrlDifferent
        | Error::TmpFileExpired
        | Error::TmpFileSizeError
        | Error::InvalidIndexFormat
    )
  }
}

/// Terminal outcome of one download run.
pub type DownloadResult = Result<(), Error>;

pub(crate) fn result_code(result: &DownloadResult) -> &'static str {
  match result {
    Ok(()) => "SUCCESSED",
    Err(e) => e.code(),
  }
}
