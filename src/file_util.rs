use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

pub(crate) const TMP_SUFFIX: &str = ".zoe.tmp";
pub(crate) const INDEX_SUFFIX: &str = ".zoe.idx";
pub(crate) const BAD_SUFFIX: &str = ".bad";

pub(crate) fn tmp_path(target: &Path) -> PathBuf {
  append_suffix(target, TMP_SUFFIX)
}

pub(crate) fn index_path(target: &Path) -> PathBuf {
  append_suffix(target, INDEX_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
  let mut s = path.as_os_str().to_os_string();
  s.push(suffix);
  PathBuf::from(s)
}

/// Offset-addressed file I/O. Slice writers and the local-file source share
/// one descriptor and address it by absolute offset, so there is no cursor
/// to race on. `read_full_at` fills as much of `buf` as the file allows and
/// reports a short count only at end of file.
pub(crate) trait OffsetIo {
  fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
  fn read_full_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

#[cfg(unix)]
impl OffsetIo for File {
  fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
    // pwrite-style; the std extension already retries short writes.
    std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
  }

  fn read_full_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
      match std::os::unix::fs::FileExt::read_at(self, &mut buf[filled..], offset + filled as u64)
      {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
      }
    }
    Ok(filled)
  }
}

#[cfg(windows)]
impl OffsetIo for File {
  fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    // seek_write moves the handle cursor, but every call re-seeks to an
    // absolute offset, so interleaved writers stay correct.
    while !buf.is_empty() {
      match std::os::windows::fs::FileExt::seek_write(self, buf, offset) {
        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => {
          buf = &buf[n..];
          offset += n as u64;
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  fn read_full_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
      match std::os::windows::fs::FileExt::seek_read(
        self,
        &mut buf[filled..],
        offset + filled as u64,
      ) {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
      }
    }
    Ok(filled)
  }
}

pub(crate) fn file_size(path: &Path) -> Option<u64> {
  std::fs::metadata(path).ok().map(|m| m.len())
}

pub(crate) fn remove_if_exists(path: &Path) {
  if let Err(e) = std::fs::remove_file(path) {
    if e.kind() != io::ErrorKind::NotFound {
      tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
    }
  }
}
