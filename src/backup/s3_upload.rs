// dbbackup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::sink::{StorageSink, UploadResult};
use crate::config::S3Settings;
use crate::errors::{BackupError, Result};

const STORAGE: &str = "s3";
/// Size of each multipart chunk; also the most this sink holds in memory.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Streams backups into an S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO).
pub struct S3Sink {
    client: s3::Client,
    bucket: String,
}

impl S3Sink {
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        S3Sink {
            client: s3::Client::new(&sdk_config),
            bucket: settings.bucket.clone(),
        }
    }

    async fn put_single(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let len = body.len() as i64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(len)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(STORAGE, format!("failed to put s3://{}/{}", self.bucket, key), e)
            })?;
        Ok(())
    }

    /// Uploads `first` and everything left in `reader` as numbered parts,
    /// then completes the upload. Returns the total byte count.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut part = first;
        let mut part_number = 1;

        while !part.is_empty() {
            let len = part.len();
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| {
                    BackupError::upload(STORAGE, format!("failed to upload part {part_number} of {key}"), e)
                })?;
            debug!(key, part_number, bytes = len, "Uploaded part");

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_owned))
                    .part_number(part_number)
                    .build(),
            );
            total += len as u64;
            part_number += 1;

            if len < PART_SIZE {
                break;
            }
            part = read_part(reader, key).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| BackupError::upload(STORAGE, format!("failed to complete upload of {key}"), e))?;
        Ok(total)
    }
}

/// Reads up to one part from the stream. A short part means the stream ended.
async fn read_part(reader: &mut (dyn AsyncRead + Unpin + Send), key: &str) -> Result<Vec<u8>> {
    let mut part = Vec::with_capacity(PART_SIZE);
    (&mut *reader)
        .take(PART_SIZE as u64)
        .read_to_end(&mut part)
        .await
        .map_err(|e| BackupError::from_stream(e, STORAGE, format!("reading backup stream for {key}")))?;
    Ok(part)
}

#[async_trait]
impl StorageSink for S3Sink {
    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<UploadResult> {
        debug!(bucket = %self.bucket, key, "Starting S3 upload");
        let first = read_part(reader, key).await?;

        if first.len() < PART_SIZE {
            let bytes_written = first.len() as u64;
            self.put_single(key, first).await?;
            return Ok(UploadResult {
                bytes_written,
                destination_key: format!("s3://{}/{}", self.bucket, key),
            });
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(STORAGE, format!("failed to start upload of s3://{}/{}", self.bucket, key), e)
            })?;
        let upload_id = created.upload_id().map(str::to_owned).ok_or_else(|| {
            BackupError::upload(
                STORAGE,
                format!("no upload id returned for s3://{}/{}", self.bucket, key),
                std::io::Error::other("missing upload id"),
            )
        })?;

        match self.upload_parts(key, &upload_id, first, reader).await {
            Ok(bytes_written) => Ok(UploadResult {
                bytes_written,
                destination_key: format!("s3://{}/{}", self.bucket, key),
            }),
            Err(e) => {
                // Nothing becomes visible under the key until completion, so abort and bail.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, upload_id = %upload_id, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    fn storage_type(&self) -> &'static str {
        STORAGE
    }
}
