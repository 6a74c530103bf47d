use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::config::S3StorageConfig;
use crate::error::StorageError;
use crate::storage::{ArtifactStream, Storage};

/// S3-backed artifact store.  Keys are namespaced under a configured prefix
/// so one bucket can be shared with other tenants.
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build the SDK client from the environment and wrap it.
    pub async fn from_config(config: &S3StorageConfig) -> Self {
        let mut loader =
            aws_config::from_env().region(aws_config::Region::new(config.region.clone()));
        if config.use_fips {
            loader = loader.use_fips(true);
        }
        let aws_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            fips = config.use_fips,
            "S3 storage initialised"
        );

        Self::new(client, config.bucket.clone(), config.prefix.clone())
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait::async_trait]
impl Storage for S3Storage {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<ArtifactStream, StorageError> {
        let object_key = self.object_key(key);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    StorageError::NotFound(object_key.clone())
                } else {
                    StorageError::Backend(format!("S3 GetObject: {}", DisplayErrorContext(&err)))
                }
            })?;

        debug!("serving object from S3");
        Ok(ReaderStream::new(resp.body.into_async_read()).boxed())
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                StorageError::Backend(format!("S3 PutObject: {}", DisplayErrorContext(&err)))
            })?;

        debug!("object written to S3");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<bool, StorageError> {
        let object_key = self.object_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(format!(
                        "S3 HeadObject: {}",
                        DisplayErrorContext(&err)
                    )))
                }
            }
        }
    }

    /// Paginates ListObjectsV2 across the whole prefix.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn size(&self, prefix: &str) -> Result<(u64, u64), StorageError> {
        let list_prefix = self.object_key(prefix);
        let mut count: u64 = 0;
        let mut bytes: u64 = 0;
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix);

            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req.send().await.map_err(|err| {
                StorageError::Backend(format!("S3 ListObjectsV2: {}", DisplayErrorContext(&err)))
            })?;

            for obj in resp.contents() {
                count += 1;
                bytes += obj.size().unwrap_or(0).max(0) as u64;
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count, bytes, "prefix size computed");
        Ok((count, bytes))
    }
}
