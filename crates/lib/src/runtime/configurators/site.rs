use std::io::{Cursor, Read};
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use serde::Deserialize;
use tracing::{debug, info};

use super::{sdk_config, sdk_error};
use crate::consts::CR_SITE_POPULATOR;
use crate::model::{BoxError, CustomResourceHandler};
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Properties {
  src_bucket: String,
  src_key_name: String,
  #[serde(default)]
  src_version: Option<String>,
  dest_bucket: String,
}

/// Unpacks the uploaded site archive into the site bucket, and empties the
/// bucket when the site goes away so the provider can delete it.
pub struct SitePopulator;

struct SiteFile {
  key: String,
  body: Vec<u8>,
}

fn unpack(archive: &[u8]) -> Result<Vec<SiteFile>, BoxError> {
  let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
  let mut files = Vec::with_capacity(zip.len());
  for i in 0..zip.len() {
    let mut entry = zip.by_index(i)?;
    if entry.is_dir() {
      continue;
    }
    // Entries escaping the archive root are dropped.
    let Some(path) = entry.enclosed_name() else {
      continue;
    };
    let key = path
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");
    let mut body = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut body)?;
    files.push(SiteFile { key, body });
  }
  Ok(files)
}

fn content_type(key: &str) -> &'static str {
  let ext = Path::new(key)
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase);
  match ext.as_deref() {
    Some("html" | "htm") => "text/html",
    Some("css") => "text/css",
    Some("js" | "mjs") => "application/javascript",
    Some("json") => "application/json",
    Some("txt") => "text/plain",
    Some("xml") => "application/xml",
    Some("svg") => "image/svg+xml",
    Some("png") => "image/png",
    Some("jpg" | "jpeg") => "image/jpeg",
    Some("gif") => "image/gif",
    Some("ico") => "image/x-icon",
    Some("webp") => "image/webp",
    Some("woff") => "font/woff",
    Some("woff2") => "font/woff2",
    Some("wasm") => "application/wasm",
    Some("pdf") => "application/pdf",
    _ => "application/octet-stream",
  }
}

async fn empty_bucket(client: &Client, bucket: &str) -> Result<usize, BoxError> {
  let mut deleted = 0;
  let mut token = None;
  loop {
    let page = client
      .list_objects_v2()
      .bucket(bucket)
      .set_continuation_token(token.take())
      .send()
      .await
      .map_err(|e| sdk_error("ListObjectsV2", e))?;
    let ids = page
      .contents()
      .iter()
      .filter_map(|o| o.key())
      .map(|key| ObjectIdentifier::builder().key(key).build())
      .collect::<Result<Vec<_>, _>>()?;
    if !ids.is_empty() {
      deleted += ids.len();
      client
        .delete_objects()
        .bucket(bucket)
        .delete(Delete::builder().set_objects(Some(ids)).quiet(true).build()?)
        .send()
        .await
        .map_err(|e| sdk_error("DeleteObjects", e))?;
    }
    match page.next_continuation_token() {
      Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
      _ => break,
    }
  }
  Ok(deleted)
}

#[async_trait]
impl CustomResourceHandler for SitePopulator {
  fn resource_type(&self) -> &str {
    CR_SITE_POPULATOR
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let client = Client::new(sdk_config().await);
    let object = client
      .get_object()
      .bucket(&props.src_bucket)
      .key(&props.src_key_name)
      .set_version_id(props.src_version.clone().filter(|v| !v.is_empty()))
      .send()
      .await
      .map_err(|e| sdk_error("GetObject", e))?;
    let archive = object.body.collect().await?.into_bytes();

    let files = unpack(&archive)?;
    let count = files.len();
    for file in files {
      debug!(key = %file.key, bytes = file.body.len(), "uploading site file");
      client
        .put_object()
        .bucket(&props.dest_bucket)
        .content_type(content_type(&file.key))
        .key(file.key)
        .body(ByteStream::from(file.body))
        .send()
        .await
        .map_err(|e| sdk_error("PutObject", e))?;
    }
    info!(bucket = %props.dest_bucket, files = count, "site populated");
    Ok(ResourceOutcome::with_physical_id(&props.dest_bucket).attribute("FileCount", count))
  }

  async fn delete(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let client = Client::new(sdk_config().await);
    let deleted = empty_bucket(&client, &props.dest_bucket).await?;
    info!(bucket = %props.dest_bucket, deleted, "site bucket emptied");
    Ok(ResourceOutcome::with_physical_id(&props.dest_bucket))
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use zip::write::SimpleFileOptions;

  use super::*;

  fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.add_directory("assets/", SimpleFileOptions::default()).unwrap();
    for (name, body) in entries {
      writer.start_file(*name, SimpleFileOptions::default()).unwrap();
      writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
  }

  #[test]
  fn unpacks_files_with_slash_keys() {
    let bytes = archive(&[("index.html", "<h1>hi</h1>"), ("assets/app.js", "go()")]);
    let files = unpack(&bytes).unwrap();
    let keys: Vec<&str> = files.iter().map(|f| f.key.as_str()).collect();
    assert_eq!(keys, ["index.html", "assets/app.js"]);
    assert_eq!(files[1].body, b"go()");
  }

  #[test]
  fn drops_entries_outside_the_root() {
    let bytes = archive(&[("../escape.txt", "x"), ("ok.txt", "y")]);
    let files = unpack(&bytes).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].key, "ok.txt");
  }

  #[test]
  fn rejects_non_archives() {
    assert!(unpack(b"not a zip").is_err());
  }

  #[test]
  fn content_types_by_extension() {
    assert_eq!(content_type("index.HTML"), "text/html");
    assert_eq!(content_type("assets/app.js"), "application/javascript");
    assert_eq!(content_type("img/logo.svg"), "image/svg+xml");
    assert_eq!(content_type("LICENSE"), "application/octet-stream");
  }
}
