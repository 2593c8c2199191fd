//! Artifact upload.
//!
//! The template and the archives go to the artifact bucket through a worker
//! pool as wide as the number of objects; the stack is then applied from the
//! uploaded template. A versioned bucket keeps stable keys and the stack
//! parameters pin the returned version ids; otherwise each upload gets a
//! salted key. Image artifacts are pushed to the registry and are never
//! removed on rollback.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Operation, ProvisionContext, ProvisionError, UploadError, UploadedObject};
use crate::cloud::FunctionCode;
use crate::consts::{
  PARAM_ARTIFACT_BUCKET, PARAM_CODE_KEY, PARAM_CODE_VERSION, PARAM_IMAGE_URI, PARAM_SITE_KEY, PARAM_SITE_VERSION,
};
use crate::package::{Artifact, PackageError, ZipEntry, write_zip};
use crate::util::hash::{ContentHash, hash_bytes, hash_file, upload_salt};
use crate::util::pool::{Task, WorkerPool};

/// Object key for `path` under the service prefix.
pub(super) fn object_key(service: &str, path: &Path, digest: &ContentHash, versioned: bool) -> String {
  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "artifact".to_string());
  if versioned {
    return format!("{service}/{file_name}");
  }
  let salt = upload_salt(digest);
  match file_name.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => format!("{service}/{stem}-{salt}.{ext}"),
    _ => format!("{service}/{file_name}-{salt}"),
  }
}

#[derive(Clone)]
enum Body {
  File(PathBuf),
  Bytes(Vec<u8>),
}

struct PendingUpload {
  name: &'static str,
  body: Body,
  key: String,
  /// Stack parameters receiving the key and the version id.
  params: Option<(&'static str, &'static str)>,
}

const TEMPLATE_ARTIFACT: &str = "template";

/// HTTPS location of an uploaded object, pinned to its version when the
/// bucket keeps versions.
pub(super) fn object_url(region: &str, object: &UploadedObject) -> String {
  let host = if region.is_empty() {
    format!("{}.s3.amazonaws.com", object.bucket)
  } else {
    format!("{}.s3.{region}.amazonaws.com", object.bucket)
  };
  match object.version.as_deref().filter(|v| !v.is_empty()) {
    Some(version) => format!("https://{host}/{}?versionId={version}", object.key),
    None => format!("https://{host}/{}", object.key),
  }
}

pub(super) struct UploadArtifacts;

impl UploadArtifacts {
  async fn upload_files(&self, ctx: &ProvisionContext, pending: &[PendingUpload]) -> Result<(), UploadError> {
    let bucket = ctx.bucket().to_string();
    let tasks: Vec<Task<UploadedObject, UploadError>> = pending
      .iter()
      .map(|upload| {
        let objects = ctx.clients.objects.clone();
        let bucket = bucket.clone();
        let key = upload.key.clone();
        let body = upload.body.clone();
        Task::new(upload.name, async move {
          let body = match body {
            Body::File(path) => tokio::fs::read(&path).await.map_err(|source| UploadError::Read {
              path: path.display().to_string(),
              source,
            })?,
            Body::Bytes(bytes) => bytes,
          };
          debug!(bucket, key, bytes = body.len(), "PutObject");
          let version = objects.put_object(&bucket, &key, body).await?;
          Ok(UploadedObject { bucket, key, version })
        })
      })
      .collect();

    let outcome = WorkerPool::for_tasks(&tasks).run(tasks, &ctx.cancel).await;
    // Record whatever landed before looking at failures so rollback sees it.
    for (name, object) in &outcome.completed {
      info!(artifact = %name, key = %object.key, version = ?object.version, "uploaded");
      if let Some(upload) = pending.iter().find(|p| p.name == name) {
        self.record(ctx, upload, object).await;
      }
      ctx.record_upload(object.clone()).await;
    }
    if !outcome.is_success() {
      return Err(UploadError::Failed(outcome.render_failures()));
    }
    Ok(())
  }

  async fn record(&self, ctx: &ProvisionContext, upload: &PendingUpload, object: &UploadedObject) {
    if let Some((key_param, version_param)) = upload.params {
      ctx.set_parameter(key_param, object.key.clone()).await;
      ctx
        .set_parameter(version_param, object.version.clone().unwrap_or_default())
        .await;
    }
    let mut state = ctx.state.lock().await;
    match upload.name {
      "code" => {
        state.code = Some(FunctionCode::Archive {
          bucket: object.bucket.clone(),
          key: object.key.clone(),
          version: object.version.clone(),
        });
      }
      TEMPLATE_ARTIFACT => state.template_url = Some(object_url(&ctx.clients.region, object)),
      _ => {}
    }
  }

  async fn push_image(&self, ctx: &ProvisionContext, tag: &str) -> Result<(), UploadError> {
    let uri = match (&ctx.options.image_repository, ctx.options.noop) {
      (Some(repository), false) => {
        debug!(tag, repository, "pushing image");
        ctx.clients.images.push(tag, repository).await?
      }
      (Some(repository), true) => {
        let version = tag.rsplit_once(':').map_or("latest", |(_, v)| v);
        format!("{repository}:{version}")
      }
      (None, true) => tag.to_string(),
      (None, false) => return Err(UploadError::MissingRepository),
    };
    info!(uri, "image ready");
    ctx.set_parameter(PARAM_IMAGE_URI, uri.clone()).await;
    ctx.state.lock().await.code = Some(FunctionCode::Image { uri });
    Ok(())
  }

  /// Zip the template and one parameter file per code pipeline environment,
  /// and upload it under the trigger key.
  async fn upload_trigger(&self, ctx: &ProvisionContext, trigger_key: &str) -> Result<(), UploadError> {
    let service = &ctx.stack_name;
    let parameters = ctx.parameters().await;
    let mut entries = vec![ZipEntry::bytes(
      format!("{service}-cftemplate.json"),
      ctx.build.template.to_json_pretty()?,
    )];
    for (environment, variables) in &ctx.config.pipeline_env {
      entries.push(ZipEntry::bytes(
        format!("{environment}.json"),
        parameter_file(&parameters, variables).to_string(),
      ));
    }

    let dest = ctx
      .build
      .template_path
      .with_file_name(format!("{service}-pipeline-trigger.zip"));
    write_zip(&dest, entries)?;
    info!(path = %dest.display(), key = trigger_key, environments = ctx.config.pipeline_env.len(), "pipeline trigger written");
    if ctx.options.noop {
      return Ok(());
    }

    let body = tokio::fs::read(&dest).await.map_err(|source| UploadError::Read {
      path: dest.display().to_string(),
      source,
    })?;
    let bucket = ctx.bucket();
    debug!(bucket, key = trigger_key, "PutObject");
    let version = ctx.clients.objects.put_object(bucket, trigger_key, body).await?;
    ctx
      .record_upload(UploadedObject {
        bucket: bucket.to_string(),
        key: trigger_key.to_string(),
        version,
      })
      .await;
    Ok(())
  }

  async fn run(&self, ctx: &ProvisionContext) -> Result<(), UploadError> {
    let service = ctx.stack_name.clone();
    let versioned = ctx.state.lock().await.versioned;
    ctx.set_parameter(PARAM_ARTIFACT_BUCKET, ctx.bucket()).await;

    let template = ctx.build.template.to_json_pretty()?;
    let mut pending = vec![PendingUpload {
      name: TEMPLATE_ARTIFACT,
      key: object_key(&service, &ctx.build.template_path, &hash_bytes(template.as_bytes()), versioned),
      body: Body::Bytes(template.into_bytes()),
      params: None,
    }];
    match &ctx.build.artifact {
      Artifact::Archive { path, digest } => pending.push(PendingUpload {
        name: "code",
        body: Body::File(path.clone()),
        key: object_key(&service, path, digest, versioned),
        params: Some((PARAM_CODE_KEY, PARAM_CODE_VERSION)),
      }),
      Artifact::Image { tag } => self.push_image(ctx, tag).await?,
    }
    if let Some(site) = &ctx.build.site_archive {
      let digest = hash_file(site).map_err(PackageError::from)?;
      pending.push(PendingUpload {
        name: "site",
        body: Body::File(site.clone()),
        key: object_key(&service, site, &digest, versioned),
        params: Some((PARAM_SITE_KEY, PARAM_SITE_VERSION)),
      });
    }

    if ctx.options.noop {
      for upload in &pending {
        info!(artifact = upload.name, bucket = ctx.bucket(), key = %upload.key, "noop: skipping upload");
        if let Some((key_param, version_param)) = upload.params {
          ctx.set_parameter(key_param, upload.key.clone()).await;
          ctx.set_parameter(version_param, "").await;
        }
      }
    } else {
      self.upload_files(ctx, &pending).await?;
    }

    if let Some(trigger_key) = &ctx.options.pipeline_trigger {
      self.upload_trigger(ctx, trigger_key).await?;
    }
    Ok(())
  }
}

fn parameter_file(parameters: &BTreeMap<String, String>, variables: &BTreeMap<String, String>) -> serde_json::Value {
  let mut merged = parameters.clone();
  merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
  json!({ "Parameters": merged })
}

#[async_trait]
impl Operation for UploadArtifacts {
  fn name(&self) -> &str {
    "uploadArtifacts"
  }

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    Ok(self.run(ctx).await?)
  }

  /// Delete every object this run uploaded.
  async fn rollback(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    let uploads = std::mem::take(&mut ctx.state.lock().await.uploads);
    if uploads.is_empty() {
      return Ok(());
    }
    let tasks: Vec<Task<(), UploadError>> = uploads
      .into_iter()
      .map(|object| {
        let objects = ctx.clients.objects.clone();
        Task::new(object.key.clone(), async move {
          debug!(bucket = %object.bucket, key = %object.key, "DeleteObject");
          objects
            .delete_object(&object.bucket, &object.key, object.version.as_deref())
            .await?;
          Ok(())
        })
      })
      .collect();
    let outcome = WorkerPool::for_tasks(&tasks)
      .run(tasks, &tokio_util::sync::CancellationToken::new())
      .await;
    if !outcome.is_success() {
      warn!(failures = %outcome.render_failures(), "some uploads were not deleted");
      return Err(UploadError::Failed(outcome.render_failures()).into());
    }
    info!(objects = outcome.completed.len(), "deleted uploaded artifacts");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cloud::memory::{Call, MemoryCloud};
  use crate::config::ProvisionOptions;
  use crate::provision::context::testing::{archive_build, context};

  #[test]
  fn versioned_keys_are_stable() {
    let digest = ContentHash("ab".repeat(32));
    let path = Path::new("/out/svc-code.zip");
    assert_eq!(object_key("svc", path, &digest, true), "svc/svc-code.zip");

    let salted = object_key("svc", path, &digest, false);
    assert!(salted.starts_with("svc/svc-code-"));
    assert!(salted.ends_with(".zip"));
    assert_eq!(salted.len(), "svc/svc-code-.zip".len() + 40);
  }

  #[tokio::test]
  async fn uploads_set_stack_parameters() {
    let temp = tempfile::TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.add_bucket("art", "us-east-1", true).await;
    let ctx = context(&cloud, archive_build(&temp), ProvisionOptions::new("art"));
    ctx.state.lock().await.versioned = true;

    UploadArtifacts.invoke(&ctx).await.unwrap();

    let params = ctx.parameters().await;
    assert_eq!(params[PARAM_ARTIFACT_BUCKET], "art");
    assert_eq!(params[PARAM_CODE_KEY], "svc/svc-code.zip");
    assert!(params[PARAM_CODE_VERSION].starts_with('v'));
    assert_eq!(cloud.objects("art").await, ["svc/svc-cftemplate.json", "svc/svc-code.zip"]);

    // The template goes up with the code and is applied from its URL.
    let url = ctx.state.lock().await.template_url.clone().unwrap();
    assert!(url.starts_with("https://art.s3.us-east-1.amazonaws.com/svc/svc-cftemplate.json?versionId=v"));
    assert_ne!(url.rsplit_once('=').unwrap().1, params[PARAM_CODE_VERSION]);
    let request = ctx.stack_request().await.unwrap();
    assert_eq!(request.template_url, Some(url));
    assert_eq!(request.parameters, params);
  }

  #[test]
  fn object_urls_pin_versions() {
    let object = UploadedObject {
      bucket: "art".to_string(),
      key: "svc/t.json".to_string(),
      version: None,
    };
    assert_eq!(object_url("eu-west-1", &object), "https://art.s3.eu-west-1.amazonaws.com/svc/t.json");
    assert_eq!(object_url("", &object), "https://art.s3.amazonaws.com/svc/t.json");
    let object = UploadedObject {
      version: Some("3".to_string()),
      ..object
    };
    assert_eq!(
      object_url("eu-west-1", &object),
      "https://art.s3.eu-west-1.amazonaws.com/svc/t.json?versionId=3"
    );
  }

  #[tokio::test]
  async fn rollback_deletes_every_upload() {
    let temp = tempfile::TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.add_bucket("art", "us-east-1", false).await;
    let ctx = context(&cloud, archive_build(&temp), ProvisionOptions::new("art"));

    UploadArtifacts.invoke(&ctx).await.unwrap();
    let key = ctx.parameters().await[PARAM_CODE_KEY].clone();
    let template_url = ctx.state.lock().await.template_url.clone().unwrap();
    let template_key = template_url.split_once(".amazonaws.com/").unwrap().1.to_string();
    assert!(template_key.starts_with("svc/svc-cftemplate-"));
    UploadArtifacts.rollback(&ctx).await.unwrap();

    assert!(cloud.objects("art").await.is_empty());
    let calls = cloud.calls().await;
    for key in [key, template_key] {
      assert!(calls.contains(&Call::DeleteObject {
        bucket: "art".to_string(),
        key,
        version: None,
      }));
    }
  }

  #[tokio::test]
  async fn image_artifacts_need_a_repository() {
    let temp = tempfile::TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    let mut build = archive_build(&temp);
    build.artifact = Artifact::Image {
      tag: "svc:b1".to_string(),
    };
    let ctx = context(&cloud, build.clone(), ProvisionOptions::new("art"));
    let err = UploadArtifacts.run(&ctx).await.unwrap_err();
    assert!(matches!(err, UploadError::MissingRepository));

    let mut options = ProvisionOptions::new("art");
    options.image_repository = Some("123.dkr.ecr.us-east-1.amazonaws.com/svc".to_string());
    let ctx = context(&cloud, build, options);
    UploadArtifacts.run(&ctx).await.unwrap();
    assert_eq!(
      ctx.state.lock().await.code,
      Some(FunctionCode::Image {
        uri: "123.dkr.ecr.us-east-1.amazonaws.com/svc:b1".to_string()
      })
    );
  }

  #[tokio::test]
  async fn noop_computes_keys_without_uploading() {
    let temp = tempfile::TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    let mut options = ProvisionOptions::new("art");
    options.noop = true;
    let ctx = context(&cloud, archive_build(&temp), options);

    UploadArtifacts.invoke(&ctx).await.unwrap();
    assert!(ctx.parameters().await[PARAM_CODE_KEY].starts_with("svc/svc-code-"));
    assert!(cloud.calls().await.is_empty());
    assert_eq!(ctx.stack_request().await.unwrap().template_url, None);
  }

  #[test]
  fn environment_values_override_stack_parameters() {
    let parameters = BTreeMap::from([("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]);
    let variables = BTreeMap::from([("B".to_string(), "prod".to_string())]);
    assert_eq!(
      parameter_file(&parameters, &variables),
      json!({ "Parameters": { "A": "1", "B": "prod" } })
    );
  }
}
