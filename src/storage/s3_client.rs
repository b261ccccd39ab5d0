//! S3-compatible multipart backend
//!
//! Wraps the AWS SDK for S3-compatible storage access (AWS, MinIO, Ceph RGW).

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart as S3CompletedPart},
    Client,
};
use chrono::DateTime;

use crate::config::StorageConfig;

use super::traits::MultipartStore;
use super::types::{CompletedPart, ObjectMetadata, PartReceipt, RemotePart, StoreError};

/// S3-compatible multipart store
#[derive(Clone)]
pub struct S3MultipartStore {
    client: Client,
    bucket: String,
}

impl S3MultipartStore {
    /// Create a new client from configuration
    pub async fn new(config: &StorageConfig) -> Result<Self, StoreError> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            config.session_token.clone(),
            None,
            "grz-pipeline",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .build();

        let client = Client::from_conf(s3_config);
        let store = Self::from_client(client, config.bucket.clone());

        match store.client.head_bucket().bucket(&store.bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %store.bucket, "Connected to S3 bucket");
            }
            Err(e) => {
                tracing::warn!(
                    bucket = %store.bucket,
                    error = %DisplayErrorContext(&e),
                    "Could not verify bucket, will attempt operations anyway"
                );
            }
        }

        Ok(store)
    }

    /// Create from an existing SDK client
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl MultipartStore for S3MultipartStore {
    async fn create_multipart(&self, key: &str, metadata: &HashMap<String, String>) -> Result<String, StoreError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|e| classify("create multipart upload", key, e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Backend(format!("no upload id returned for {}", key)))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
        checksum_sha256: &str,
    ) -> Result<PartReceipt, StoreError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .checksum_sha256(checksum_sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("upload part", key, e))?;

        let etag = response
            .e_tag()
            .ok_or_else(|| StoreError::Backend(format!("no ETag for part {} of {}", part_number, key)))?;

        Ok(PartReceipt {
            etag: etag.to_string(),
            checksum_sha256: response.checksum_sha256().map(str::to_string),
        })
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<RemotePart>, StoreError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .max_parts(1000);

            if let Some(m) = marker.take() {
                request = request.part_number_marker(m);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify("list parts", key, e))?;

            for part in response.parts() {
                let (Some(part_number), Some(etag)) = (part.part_number(), part.e_tag()) else {
                    continue;
                };
                parts.push(RemotePart {
                    part_number,
                    etag: etag.to_string(),
                    size: part.size().unwrap_or(0).max(0) as u64,
                    checksum_sha256: part.checksum_sha256().map(str::to_string),
                });
            }

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            match response.next_part_number_marker() {
                Some(next) => marker = Some(next.to_string()),
                None => break,
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .set_checksum_sha256(p.checksum_sha256.clone())
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("complete multipart upload", key, e))?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort multipart upload", key, e))?;

        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata, StoreError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("head object", key, e))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            etag: response.e_tag().map(|s| s.to_string()),
            metadata: response.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete object", key, e))?;

        Ok(())
    }
}

/// Sort SDK failures into retryable and terminal buckets
fn classify<E>(operation: &str, key: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("{} {}: {}", operation, key, DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(message)
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            match (status, service.err().code()) {
                (_, Some("NoSuchUpload")) => StoreError::NoSuchUpload(message),
                (_, Some("BadDigest")) | (_, Some("XAmzContentChecksumMismatch")) => {
                    StoreError::ChecksumRejected(message)
                }
                (404, _) | (_, Some("NoSuchKey")) | (_, Some("NotFound")) => {
                    StoreError::NotFound(message)
                }
                (_, Some("SlowDown")) | (_, Some("RequestTimeout")) | (429, _) | (500..=599, _) => {
                    StoreError::Transient(message)
                }
                _ => StoreError::Backend(message),
            }
        }
        _ => StoreError::Backend(message),
    }
}
