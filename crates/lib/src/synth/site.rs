//! Static website bucket and its populator.

use tracing::debug;

use super::SynthError;
use super::configurator::ensure_configurator;
use crate::config::BuildConfig;
use crate::consts::{
  CONDITION_HAS_SITE_VERSION, CR_SITE_POPULATOR, OUTPUT_SITE_URL, PARAM_ARTIFACT_BUCKET, PARAM_SITE_KEY,
  PARAM_SITE_VERSION,
};
use crate::iam::PolicyStatement;
use crate::model::StaticSite;
use crate::naming::logical_name;
use crate::template::{DeletionPolicy, Expr, Output, Parameter, Resource, Template};
use crate::util::hash::hash_directory;

fn artifact_object_arn() -> Expr {
  Expr::join(
    "",
    [
      Expr::str("arn:"),
      Expr::partition(),
      Expr::str(":s3:::"),
      Expr::reference(PARAM_ARTIFACT_BUCKET),
      Expr::str("/"),
      Expr::reference(PARAM_SITE_KEY),
    ],
  )
}

fn bucket_objects(bucket_logical: &str) -> Expr {
  Expr::join("", [Expr::get_att(bucket_logical, "Arn"), Expr::str("/*")])
}

/// Emit the website bucket, its public read policy and the custom resource
/// that unpacks the site archive into it.
///
/// The populator carries a digest of the source directory, so any content
/// change updates the resource and repopulates the bucket.
pub(super) fn emit(
  template: &mut Template,
  service_name: &str,
  config: &BuildConfig,
  site: &StaticSite,
) -> Result<String, SynthError> {
  let content_hash = hash_directory(site.source_dir()).map_err(|source| SynthError::Site {
    path: site.source_dir().display().to_string(),
    source,
  })?;

  let bucket = logical_name("S3Site", [service_name]);
  let mut resource = Resource::new("AWS::S3::Bucket")
    .prop(
      "WebsiteConfiguration",
      Expr::map([
        ("IndexDocument", Expr::str(site.index_document())),
        ("ErrorDocument", Expr::str(site.error_document())),
      ]),
    )
    .prop(
      "PublicAccessBlockConfiguration",
      Expr::map([
        ("BlockPublicAcls", Expr::Bool(false)),
        ("BlockPublicPolicy", Expr::Bool(false)),
        ("IgnorePublicAcls", Expr::Bool(false)),
        ("RestrictPublicBuckets", Expr::Bool(false)),
      ]),
    )
    .deletion_policy(DeletionPolicy::Delete);
  if let Some(name) = site.bucket_name() {
    resource.set_prop("BucketName", name);
  }
  template.add_resource(bucket.clone(), resource)?;

  template.add_resource(
    logical_name("S3SitePolicy", [service_name]),
    Resource::new("AWS::S3::BucketPolicy")
      .prop("Bucket", Expr::reference(&bucket))
      .prop(
        "PolicyDocument",
        Expr::map([
          ("Version", Expr::str(crate::consts::POLICY_VERSION)),
          (
            "Statement",
            Expr::list([Expr::map([
              ("Sid", Expr::str("PublicReadGetObject")),
              ("Effect", Expr::str("Allow")),
              ("Principal", Expr::str("*")),
              ("Action", Expr::str("s3:GetObject")),
              ("Resource", bucket_objects(&bucket)),
            ])]),
          ),
        ]),
      ),
  )?;

  template.add_parameter(PARAM_SITE_KEY, Parameter::string("Object key of the site archive"))?;
  template.add_parameter(
    PARAM_SITE_VERSION,
    Parameter::string("Object version of the site archive").with_default(""),
  )?;
  template.add_condition(
    CONDITION_HAS_SITE_VERSION,
    Expr::not(Expr::equals(Expr::reference(PARAM_SITE_VERSION), Expr::str(""))),
  );

  let statements = vec![
    PolicyStatement::allow(["s3:GetObject", "s3:GetObjectVersion"], artifact_object_arn()),
    PolicyStatement::allow(["s3:ListBucket"], Expr::get_att(&bucket, "Arn")),
    PolicyStatement::allow(["s3:PutObject", "s3:DeleteObject"], bucket_objects(&bucket)),
  ];
  let configurator = ensure_configurator(template, service_name, config, CR_SITE_POPULATOR, statements)?;

  let populator = logical_name("S3SiteBuilder", [service_name]);
  template.add_resource(
    populator.clone(),
    Resource::new(CR_SITE_POPULATOR)
      .prop("ServiceToken", configurator.service_token())
      .prop("SrcBucket", Expr::reference(PARAM_ARTIFACT_BUCKET))
      .prop("SrcKeyName", Expr::reference(PARAM_SITE_KEY))
      .prop(
        "SrcVersion",
        Expr::if_(CONDITION_HAS_SITE_VERSION, Expr::reference(PARAM_SITE_VERSION), Expr::str("")),
      )
      .prop("DestBucket", Expr::reference(&bucket))
      .prop("ContentHash", content_hash.0.as_str())
      .depends_on(configurator.role.as_str()),
  )?;

  template.add_output(
    OUTPUT_SITE_URL,
    Output::new("Static site URL", Expr::get_att(&bucket, "WebsiteURL")),
  )?;
  debug!(bucket = %bucket, hash = %content_hash.0, "emitted static site");
  Ok(bucket)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn site_dir(content: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), content).unwrap();
    dir
  }

  fn populator_hash(t: &Template) -> Expr {
    let (_, populator) = t.resources_of_type(CR_SITE_POPULATOR).next().unwrap();
    populator.get_prop("ContentHash").cloned().unwrap()
  }

  #[test]
  fn site_emits_bucket_policy_and_populator() {
    let dir = site_dir("<h1>hi</h1>");
    let mut t = Template::new("t");
    emit(&mut t, "svc", &BuildConfig::default(), &StaticSite::new(dir.path())).unwrap();

    assert_eq!(t.resources_of_type("AWS::S3::Bucket").count(), 1);
    assert_eq!(t.resources_of_type("AWS::S3::BucketPolicy").count(), 1);
    assert_eq!(t.resources_of_type(CR_SITE_POPULATOR).count(), 1);
    assert!(t.parameters.contains_key(PARAM_SITE_KEY));
    assert!(t.outputs.contains_key(OUTPUT_SITE_URL));
  }

  #[test]
  fn content_changes_change_the_populator() {
    let a = site_dir("one");
    let b = site_dir("two");
    let mut ta = Template::new("t");
    let mut tb = Template::new("t");
    emit(&mut ta, "svc", &BuildConfig::default(), &StaticSite::new(a.path())).unwrap();
    emit(&mut tb, "svc", &BuildConfig::default(), &StaticSite::new(b.path())).unwrap();
    assert_ne!(populator_hash(&ta), populator_hash(&tb));
  }

  #[test]
  fn missing_directory_fails() {
    let mut t = Template::new("t");
    let err = emit(
      &mut t,
      "svc",
      &BuildConfig::default(),
      &StaticSite::new("/definitely/not/here"),
    )
    .unwrap_err();
    assert!(matches!(err, SynthError::Site { .. }));
  }
}
