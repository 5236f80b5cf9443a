//! aws-sdk-s3 backend for the multipart wire seam, with retries, optional
//! Content-MD5 checksums, and endpoint overrides for S3-compatible services.

use crate::cadapter::client::{CompletedPartId, ObjectMeta, RemoteStore};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::SdkBody;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{Client, config::Region};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use tokio::time::{Duration, sleep};

/// S3 backend configuration options.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region (optional, will use default if not specified)
    pub region: Option<String>,
    /// Maximum retry attempts for failed operations (default: 3)
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds (default: 100ms)
    pub retry_base_delay: u64,
    /// Enable MD5 checksums for part uploads (default: true)
    pub enable_md5: bool,
    /// Custom endpoint URL (e.g. for MinIO or localstack)
    pub endpoint: Option<String>,
    /// Force path-style access (required for some S3-compatible services)
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            max_retries: 3,
            retry_base_delay: 100,
            enable_md5: true,
            endpoint: None,
            force_path_style: false,
        }
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store with default configuration.
    pub async fn new(bucket: impl Into<String>) -> Result<Self> {
        let config = S3Config {
            bucket: bucket.into(),
            ..Default::default()
        };
        Self::with_config(config).await
    }

    /// Create a new S3 store with custom configuration.
    pub async fn with_config(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(anyhow!("Bucket name cannot be empty"));
        }

        let mut aws_config_loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            aws_config_loader = aws_config_loader.region(Region::new(region.clone()));
        }

        let aws_config = aws_config_loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self { client, config })
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    /// Object keys are paths without the leading slash.
    fn key_for(path: &str) -> &str {
        path.trim_start_matches('/')
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.config.retry_base_delay * (1 << (attempt - 1));
        sleep(Duration::from_millis(delay)).await;
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn create_multipart_upload(&self, path: &str, meta: &ObjectMeta) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self
                .client
                .create_multipart_upload()
                .bucket(&self.config.bucket)
                .key(Self::key_for(path))
                .set_metadata(if meta.is_empty() {
                    None
                } else {
                    Some(meta.clone())
                });

            match request.send().await {
                Ok(ok) => {
                    return ok
                        .upload_id()
                        .map(|id| id.to_string())
                        .ok_or_else(|| anyhow!("missing upload id in create response"));
                }
                Err(_e) if attempt < self.config.max_retries => {
                    self.backoff(attempt).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        data: Bytes,
    ) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(Self::key_for(path))
                .upload_id(upload_id)
                .part_number(part_num)
                .body(SdkBody::from(data.clone()).into());

            if self.config.enable_md5 {
                request = request.content_md5(Self::md5_base64(&data));
            }

            match request.send().await {
                Ok(ok) => {
                    return ok
                        .e_tag()
                        .map(|etag| etag.to_string())
                        .ok_or_else(|| anyhow!("missing etag in upload part response"));
                }
                Err(_e) if attempt < self.config.max_retries => {
                    self.backoff(attempt).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn upload_part_copy(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        source_start: u64,
        source_size: u64,
    ) -> Result<String> {
        let key = Self::key_for(path);
        let source = format!("{}/{}", self.config.bucket, key);
        // Copy ranges are inclusive on the wire.
        let range = format!("bytes={}-{}", source_start, source_start + source_size - 1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self
                .client
                .upload_part_copy()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_num)
                .copy_source(&source)
                .copy_source_range(&range);

            match request.send().await {
                Ok(ok) => {
                    return ok
                        .copy_part_result()
                        .and_then(|result| result.e_tag())
                        .map(|etag| etag.to_string())
                        .ok_or_else(|| anyhow!("missing etag in copy part response"));
                }
                Err(_e) if attempt < self.config.max_retries => {
                    self.backoff(attempt).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPartId],
    ) -> Result<()> {
        let completed_parts = parts
            .iter()
            .map(|(part_num, etag)| {
                CompletedPart::builder()
                    .part_number(*part_num)
                    .e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(Self::key_for(path))
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, path: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.config.bucket)
            .key(Self::key_for(path))
            .upload_id(upload_id)
            .send()
            .await?;
        Ok(())
    }

    async fn get_object_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let range = format!("bytes={}-{}", offset, offset + buf.len() as u64 - 1);
        let resp = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(Self::key_for(path))
            .range(range)
            .send()
            .await;

        match resp {
            Ok(ok) => {
                let data = ok.body.collect().await?.into_bytes();
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Err(e) => {
                // Reads past the end of the previous version or of a missing
                // object are served as empty, matching local sparse reads.
                let msg = format!("{e}");
                if msg.contains("NoSuchKey") || msg.contains("InvalidRange") {
                    Ok(0)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}
