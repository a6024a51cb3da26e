use crate::config::HashKind;
use anyhow::Context;
use md5::Digest;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Whole-file hash as lowercase hex, computed off the async runtime.
pub(crate) async fn file_hash(path: &Path, kind: HashKind) -> anyhow::Result<String> {
  let path: PathBuf = path.to_path_buf();
  tokio::task::spawn_blocking(move || hash_file_blocking(&path, kind))
    .await
    .context("hash task aborted")?
}

fn hash_file_blocking(path: &Path, kind: HashKind) -> anyhow::Result<String> {
  let file = std::fs::File::open(path)
    .with_context(|| format!("failed to open {} for hashing", path.display()))?;
  let mut reader = std::io::BufReader::new(file);
  let mut buf = [0u8; 64 * 1024];

  match kind {
    HashKind::Md5 => {
      let mut hasher = md5::Md5::new();
      loop {
        let n = reader.read(&mut buf).context("read for hashing")?;
        if n == 0 {
          break;
        }
        hasher.update(&buf[..n]);
      }
      Ok(hex_lower(&hasher.finalize()))
    }
    HashKind::Sha256 => {
      let mut hasher = sha2::Sha256::new();
      loop {
        let n = reader.read(&mut buf).context("read for hashing")?;
        if n == 0 {
          break;
        }
        hasher.update(&buf[..n]);
      }
      Ok(hex_lower(&hasher.finalize()))
    }
    HashKind::Crc32 => {
      let mut hasher = crc32fast::Hasher::new();
      loop {
        let n = reader.read(&mut buf).context("read for hashing")?;
        if n == 0 {
          break;
        }
        hasher.update(&buf[..n]);
      }
      Ok(format!("{:08x}", hasher.finalize()))
    }
  }
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
  let mut out = String::with_capacity(bytes.len() * 2);
  for b in bytes {
    out.push_str(&format!("{b:02x}"));
  }
  out
}
