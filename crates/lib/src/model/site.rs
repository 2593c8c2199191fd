use std::path::{Path, PathBuf};

/// A static website served from a bucket.
///
/// The directory is zipped at build time and unpacked into the bucket by the
/// site populator when the stack converges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSite {
  source_dir: PathBuf,
  bucket_name: Option<String>,
  index_document: String,
  error_document: String,
}

impl StaticSite {
  pub fn new(source_dir: impl Into<PathBuf>) -> Self {
    Self {
      source_dir: source_dir.into(),
      bucket_name: None,
      index_document: "index.html".to_string(),
      error_document: "error.html".to_string(),
    }
  }

  pub fn source_dir(&self) -> &Path {
    &self.source_dir
  }

  /// Explicit bucket name. Without one the provider generates a name.
  pub fn bucket_name(&self) -> Option<&str> {
    self.bucket_name.as_deref()
  }

  pub fn index_document(&self) -> &str {
    &self.index_document
  }

  pub fn error_document(&self) -> &str {
    &self.error_document
  }

  pub fn with_bucket_name(mut self, name: impl Into<String>) -> Self {
    self.bucket_name = Some(name.into());
    self
  }

  pub fn with_documents(mut self, index: impl Into<String>, error: impl Into<String>) -> Self {
    self.index_document = index.into();
    self.error_document = error.into();
    self
  }
}
