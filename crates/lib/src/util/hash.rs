//! Content digests for artifacts.
//!
//! - `hash_file()`: streaming SHA-256 of one file
//! - `hash_directory()`: digest of a directory tree, independent of mtimes
//! - `upload_salt()`: the per-upload salt used for non-versioned keys

use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// A lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum HashError {
  #[error("failed to walk {path}: {message}")]
  Walk { path: String, message: String },

  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Digest of every regular file under `root`, keyed by its relative path.
///
/// Entries are visited in file-name order so the digest only changes when
/// contents or layout change.
pub fn hash_directory(root: &Path) -> Result<ContentHash, HashError> {
  let mut hasher = Sha256::new();
  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.map_err(|e| HashError::Walk {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;
    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
    if rel.as_os_str().is_empty() {
      continue;
    }
    let rel = rel.to_string_lossy().replace('\\', "/");
    if entry.file_type().is_dir() {
      hasher.update(format!("D:{rel}\n").as_bytes());
    } else if entry.file_type().is_file() {
      let digest = hash_file(entry.path())?;
      hasher.update(format!("F:{rel}:{digest}\n").as_bytes());
    }
  }
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let read_err = |source| HashError::Read {
    path: path.display().to_string(),
    source,
  };
  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];
  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

/// Salt for a non-versioned object key: a digest of the upload time and the
/// content digest, so concurrent builds of identical content still differ.
pub fn upload_salt(content: &ContentHash) -> String {
  let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
  let digest = hash_bytes(format!("{now}{content}").as_bytes());
  digest.0[..40].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn directory_hash_is_stable() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("index.html"), "<h1>hi</h1>").unwrap();
    fs::create_dir(temp.path().join("css")).unwrap();
    fs::write(temp.path().join("css/site.css"), "body{}").unwrap();

    assert_eq!(hash_directory(temp.path()).unwrap(), hash_directory(temp.path()).unwrap());
  }

  #[test]
  fn directory_hash_tracks_content_and_layout() {
    let a = tempdir().unwrap();
    fs::write(a.path().join("file.txt"), "content").unwrap();
    let before = hash_directory(a.path()).unwrap();

    fs::write(a.path().join("file.txt"), "changed").unwrap();
    assert_ne!(before, hash_directory(a.path()).unwrap());

    let b = tempdir().unwrap();
    fs::create_dir(b.path().join("sub")).unwrap();
    fs::write(b.path().join("sub/file.txt"), "content").unwrap();
    assert_ne!(before, hash_directory(b.path()).unwrap());
  }

  #[test]
  fn file_hash_matches_bytes_hash() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("bootstrap");
    fs::write(&path, b"binary").unwrap();
    assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"binary"));
    assert_eq!(hash_bytes(b"binary").0.len(), 64);
  }

  #[test]
  fn upload_salts_differ_per_call() {
    let content = hash_bytes(b"same");
    let a = upload_salt(&content);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = upload_salt(&content);
    assert_eq!(a.len(), 40);
    assert_ne!(a, b);
  }
}
