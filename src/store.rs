//! Upload collaborator: somewhere to put finished archives and fetch them
//! back from. Production target is an S3 bucket "folder"; tests use an
//! in-memory implementation.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload `dir/name`, returning the remote object identifier.
    async fn upload(&self, dir: &Path, name: &str) -> Result<String>;

    /// Delete by the identifier `upload` returned.
    async fn delete(&self, id: &str) -> Result<()>;

    /// All objects in the store's folder, as identifier -> file name.
    async fn list(&self) -> Result<BTreeMap<String, String>>;

    /// Download the object `id` to a local path.
    async fn download(&self, id: &str, dest: &Path) -> Result<()>;
}

/// S3-backed store. The "folder" an operator hands us is `bucket` or
/// `bucket/prefix`; object identifiers are full keys.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Connect using an operator-supplied shared-credentials file rather than
    /// whatever ambient AWS identity the machine happens to have.
    pub async fn connect(credentials: &Path, folder: &str) -> Result<Self> {
        if !credentials.exists() {
            bail!("credentials file {} does not exist", credentials.display());
        }
        let files = ProfileFiles::builder()
            .with_file(ProfileFileKind::Credentials, credentials)
            .build();
        let config = aws_config::defaults(BehaviorVersion::latest())
            .profile_files(files)
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&config);

        let (bucket, prefix) = match folder.split_once('/') {
            Some((bucket, prefix)) => {
                let mut prefix = prefix.trim_end_matches('/').to_string();
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                (bucket.to_string(), prefix)
            }
            None => (folder.to_string(), String::new()),
        };
        if bucket.is_empty() {
            bail!("upload folder must start with a bucket name, got {:?}", folder);
        }

        Ok(S3Store { client, bucket, prefix })
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn upload(&self, dir: &Path, name: &str) -> Result<String> {
        let path = dir.join(name);
        let body = ByteStream::from_path(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let key = format!("{}{}", self.prefix, name);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("upload of {} to s3://{}/{} failed", name, self.bucket, key))?;
        debug!(%key, "uploaded");
        Ok(key)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .with_context(|| format!("delete of s3://{}/{} failed", self.bucket, id))?;
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, String>> {
        let mut items = BTreeMap::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("listing s3://{}/{} failed", self.bucket, self.prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or(key);
                if name.is_empty() {
                    continue; // the folder marker itself
                }
                items.insert(key.to_string(), name.to_string());
            }
        }
        Ok(items)
    }

    async fn download(&self, id: &str, dest: &Path) -> Result<()> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .with_context(|| format!("download of s3://{}/{} failed", self.bucket, id))?;
        let data = resp
            .body
            .collect()
            .await
            .context("failed streaming object body")?
            .into_bytes();
        std::fs::write(dest, &data)
            .with_context(|| format!("failed writing {}", dest.display()))?;
        Ok(())
    }
}

/// Round-trip a throwaway file through the store to prove the credentials and
/// folder are usable before committing to a long run.
pub async fn check_round_trip<R: RemoteStore + ?Sized>(store: &R, scratch: &Path) -> Result<()> {
    let name = format!("{}.temp", uuid::Uuid::new_v4());
    let path = scratch.join(&name);
    std::fs::write(&path, "test_upload\n").context("failed writing probe file")?;
    let result: Result<()> = async {
        let id = store.upload(scratch, &name).await.context("probe upload failed")?;
        store.delete(&id).await.context("probe delete failed")?;
        Ok(())
    }
    .await;
    let _ = std::fs::remove_file(&path);
    result
}
