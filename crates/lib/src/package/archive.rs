use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::{ArchiveEntry, ArchiveSource, PackageError};
use crate::consts::ARCHIVE_BINARY_NAME;
use crate::util::hash::{ContentHash, hash_file};

/// One file to place in a zip.
#[derive(Debug, Clone)]
pub struct ZipEntry {
  pub name: String,
  pub source: ArchiveSource,
  pub mode: u32,
}

impl ZipEntry {
  pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
    Self {
      name: name.into(),
      source: ArchiveSource::Bytes(data.into()),
      mode: 0o644,
    }
  }
}

/// Write `entries` to `dest` and return the digest of the result.
///
/// Timestamps are pinned so identical inputs give identical archives.
pub(crate) fn write_zip(dest: &Path, entries: impl IntoIterator<Item = ZipEntry>) -> Result<ContentHash, PackageError> {
  let archive_err = |source| PackageError::Archive {
    path: dest.display().to_string(),
    source,
  };
  let file = File::create(dest).map_err(|e| PackageError::io(dest, e))?;
  let mut writer = ZipWriter::new(file);
  for entry in entries {
    let options = SimpleFileOptions::default()
      .compression_method(CompressionMethod::Deflated)
      .last_modified_time(DateTime::default())
      .unix_permissions(entry.mode);
    writer.start_file(entry.name.as_str(), options).map_err(archive_err)?;
    match &entry.source {
      ArchiveSource::File(path) => {
        let mut source = File::open(path).map_err(|e| PackageError::io(path, e))?;
        io::copy(&mut source, &mut writer).map_err(|e| PackageError::io(path, e))?;
      }
      ArchiveSource::Bytes(data) => writer.write_all(data).map_err(|e| PackageError::io(dest, e))?,
    }
    debug!(archive = %dest.display(), entry = %entry.name, "added");
  }
  writer.finish().map_err(archive_err)?;
  Ok(hash_file(dest)?)
}

/// The code archive: the dispatcher as an executable `bootstrap` plus the
/// archive hooks' files.
pub(super) fn write_code_archive(
  binary: &Path,
  extra: &[ArchiveEntry],
  dest: &Path,
) -> Result<ContentHash, PackageError> {
  let bootstrap = ZipEntry {
    name: ARCHIVE_BINARY_NAME.to_string(),
    source: ArchiveSource::File(binary.to_path_buf()),
    mode: 0o755,
  };
  let hooked = extra.iter().map(|e| ZipEntry {
    name: e.archive_path.trim_start_matches('/').to_string(),
    source: e.source.clone(),
    mode: 0o644,
  });
  write_zip(dest, std::iter::once(bootstrap).chain(hooked))
}

/// Zip every regular file under `root`, keyed by its slash-separated
/// relative path.
pub fn zip_directory(root: &Path, dest: &Path) -> Result<ContentHash, PackageError> {
  let mut entries = Vec::new();
  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.map_err(|e| PackageError::io(root, e.into()))?;
    if !entry.file_type().is_file() {
      continue;
    }
    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
    entries.push(ZipEntry {
      name: rel.to_string_lossy().replace('\\', "/"),
      source: ArchiveSource::File(entry.path().to_path_buf()),
      mode: 0o644,
    });
  }
  write_zip(dest, entries)
}
