/// Helper functions and structures for dealing with minio / S3.
use anyhow::{anyhow, Context, Error, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use tracing::{debug, error};
use url::Url;

use crate::storage::ObjectStore;

#[derive(Debug)]
pub struct BucketKey {
    pub bucket: String,
    pub key: String,
}

/// retrieves a bucket and key for a given path, the path should contain the s3 protocol
pub fn path_to_bucket_key(path: &str) -> Result<BucketKey, Error> {
    let s3_url = Url::parse(path).map_err(|e| anyhow!("Could not parse input given: {}", e))?;

    if s3_url.scheme() != "s3" {
        return Err(anyhow!("protocol of path is not S3"));
    }

    let bucket = s3_url
        .host_str()
        .ok_or(anyhow!("something went wrong trying to retrieve bucket"))?;

    let key = s3_url.path().trim_start_matches('/').trim_end_matches(['*', '/']);

    Ok(BucketKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

#[derive(Clone)]
pub struct ClientConfig {
    /// id
    pub access_key_id: String,

    /// password
    pub secret_access_key: String,

    /// object store region
    pub region: String,

    /// minio url
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client: s3::Client,
}

impl Client {
    pub fn from_conf(cfg: ClientConfig) -> Self {
        let cred = s3::config::Credentials::new(
            cfg.access_key_id,
            cfg.secret_access_key,
            None,
            None,
            "mrl",
        );
        let region = s3::config::Region::new(cfg.region);
        let conf = s3::config::Builder::new()
            .credentials_provider(cred)
            .region(region)
            .endpoint_url(cfg.url)
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        Self {
            client: s3::Client::from_conf(conf),
        }
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, Error> {
        let data = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?
            .body
            .collect()
            .await?
            .into_bytes();
        Ok(data)
    }

    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), Error> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }

    /// Conditional put with `If-None-Match: *`. Returns `false` if the key
    /// already exists.
    pub async fn put_object_if_absent(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> Result<bool, Error> {
        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(data))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                match err.code() {
                    Some("PreconditionFailed") | Some("ConditionalRequestConflict") => Ok(false),
                    _ => Err(anyhow!(err).context(format!("conditional put of `{key}` failed"))),
                }
            }
        }
    }

    pub async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        destination_key: &str,
    ) -> Result<(), Error> {
        let copy_source = format!("{}/{}", bucket, source_key);

        self.client
            .copy_object()
            .bucket(bucket)
            .copy_source(copy_source)
            .key(destination_key)
            .send()
            .await?;

        Ok(())
    }

    /// Lists all objects found below the given key prefix.
    pub async fn list_objects_in_dir(&self, bucket: &str, key: &str) -> Result<Vec<String>, Error> {
        let mut response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(key)
            .max_keys(500)
            .into_paginator()
            .send();

        let mut objects = vec![];
        while let Some(result) = response.next().await {
            match result {
                Ok(output) => {
                    for object in output.contents() {
                        if let Some(key) = object.key() {
                            objects.push(key.to_string());
                        }
                    }
                }
                Err(err) => {
                    error!("{err:?}");
                    return Err(anyhow!(err).context(format!("listing `{bucket}/{key}` failed")));
                }
            }
        }

        Ok(objects)
    }

    pub async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, Error> {
        let object_request = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match object_request {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    return Ok(false);
                }
                Err(anyhow!(err).context(format!("head of `{key}` failed")))
            }
        }
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }
}

/// [`ObjectStore`] over one bucket.
///
/// Single-object copies are atomic in S3, so a rename (copy, then delete of
/// the source) never exposes a partial object under the target key.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn dir_prefix(dir: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client.put_object(&self.bucket, key, data).await
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool> {
        self.client.put_object_if_absent(&self.bucket, key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.client
            .get_object(&self.bucket, key)
            .await
            .with_context(|| format!("failed to read `{key}`"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.client.object_exists(&self.bucket, key).await
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut keys = self
            .client
            .list_objects_in_dir(&self.bucket, &dir_prefix(dir))
            .await?;
        keys.sort();
        Ok(keys)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.client.copy_object(&self.bucket, from, to).await?;
        self.client.delete_object(&self.bucket, from).await?;
        debug!(from, to, "renamed object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.delete_object(&self.bucket, key).await
    }

    async fn delete_prefix(&self, dir: &str) -> Result<()> {
        self.delete(dir).await?;
        for key in self.list(dir).await? {
            self.client.delete_object(&self.bucket, &key).await?;
        }
        Ok(())
    }
}
