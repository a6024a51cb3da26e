use crate::file_util::OffsetIo;
use std::fs::File;
use std::io;
use std::sync::Arc;

pub(crate) const MIN_SLICE_BUFFER: u64 = 64 * 1024;
pub(crate) const MAX_SLICE_BUFFER: u64 = 8 * 1024 * 1024;

/// Write cache over the temp file. Slices buffer independently and flush with
/// positional writes, so concurrent flushes never race; the shared handle is
/// only needed for fsync and the final release.
pub(crate) struct DiskCache {
  file: File,
}

impl DiskCache {
  pub fn new(file: File) -> Arc<Self> {
    Arc::new(Self { file })
  }

  pub fn writer(self: &Arc<Self>, disk_offset: u64, share: usize) -> SliceWriter {
    SliceWriter {
      cache: self.clone(),
      disk_offset,
      share: share.max(1),
      buf: Vec::with_capacity(share.max(1)),
    }
  }

  pub fn sync(&self) -> io::Result<()> {
    self.file.sync_all()
  }

  pub fn file(&self) -> &File {
    &self.file
  }
}

/// Per-slice buffer share: proportional to the slice's remaining length,
/// clamped to [64 KiB, 8 MiB], and capped so the shares of all concurrently
/// active slices never exceed the configured budget.
pub(crate) fn compute_share(
  budget: u64,
  remaining: Option<u64>,
  total_remaining: u64,
  workers: u32,
) -> usize {
  let per_worker_cap = (budget / workers.max(1) as u64).max(MIN_SLICE_BUFFER);
  let proportional = match remaining {
    Some(r) if total_remaining > 0 => {
      ((budget as u128 * r as u128) / total_remaining as u128) as u64
    }
    _ => budget,
  };
  proportional.clamp(MIN_SLICE_BUFFER, MAX_SLICE_BUFFER).min(per_worker_cap) as usize
}

pub(crate) struct SliceWriter {
  cache: Arc<DiskCache>,
  /// Next durable write position in the temp file.
  disk_offset: u64,
  share: usize,
  buf: Vec<u8>,
}

impl SliceWriter {
  /// Buffer `data`, flushing to disk when the share fills. Returns the
  /// durable offset after the call (bytes at lower offsets are on disk).
  pub fn write(&mut self, data: &[u8]) -> io::Result<u64> {
    if self.buf.len() + data.len() > self.share {
      self.flush()?;
      if data.len() >= self.share {
        self.cache.file().write_all_at(data, self.disk_offset)?;
        self.disk_offset += data.len() as u64;
        return Ok(self.disk_offset);
      }
    }
    self.buf.extend_from_slice(data);
    Ok(self.disk_offset)
  }

  /// Evict the buffer to disk. Returns the durable offset.
  pub fn flush(&mut self) -> io::Result<u64> {
    if !self.buf.is_empty() {
      self.cache.file().write_all_at(&self.buf, self.disk_offset)?;
      self.disk_offset += self.buf.len() as u64;
      self.buf.clear();
    }
    Ok(self.disk_offset)
  }

  pub fn durable_offset(&self) -> u64 {
    self.disk_offset
  }
}
