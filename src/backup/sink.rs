// dbbackup/src/backup/sink.rs
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};

use super::local_upload::LocalSink;
use super::s3_upload::S3Sink;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// What a sink reports after persisting a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// Bytes persisted. Zero when the backend cannot tell.
    pub bytes_written: u64,
    pub destination_key: String,
}

/// A destination that can persist a byte stream under a key.
///
/// Implementations read `reader` until it ends or fails. A read failure is
/// returned through [`BackupError::from_stream`], so a failed dump keeps its
/// own error instead of turning into an upload error.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<UploadResult>;

    fn storage_type(&self) -> &'static str;
}

/// Pumps `reader` into `writer` through a fixed-size buffer.
pub(crate) async fn copy_stream<W>(
    storage: &'static str,
    key: &str,
    reader: &mut (dyn AsyncRead + Unpin + Send),
    writer: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::from_stream(e, storage, format!("reading backup stream for {key}")))?;
        if n == 0 {
            return Ok(total);
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| BackupError::upload(storage, format!("writing {key}"), e))?;
        total += n as u64;
    }
}

/// Google Cloud Storage destination. Not implemented; every upload fails.
#[derive(Debug, Clone)]
pub struct GcsSink {
    pub project_id: String,
    pub bucket: String,
    pub service_account_key: Option<String>,
}

#[async_trait]
impl StorageSink for GcsSink {
    async fn upload(
        &self,
        _key: &str,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<UploadResult> {
        warn!(
            project = %self.project_id,
            bucket = %self.bucket,
            key_file = self.service_account_key.is_some(),
            "GCS uploads are not supported"
        );
        Err(BackupError::NotImplemented("Google Cloud Storage"))
    }

    fn storage_type(&self) -> &'static str {
        "gcs"
    }
}

/// Azure Blob Storage destination. Not implemented; every upload fails.
#[derive(Debug, Clone)]
pub struct AzureSink {
    pub account_name: String,
    pub account_key: Option<String>,
    pub container: String,
}

#[async_trait]
impl StorageSink for AzureSink {
    async fn upload(
        &self,
        _key: &str,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<UploadResult> {
        warn!(
            account = %self.account_name,
            container = %self.container,
            shared_key = self.account_key.is_some(),
            "Azure uploads are not supported"
        );
        Err(BackupError::NotImplemented("Azure Blob Storage"))
    }

    fn storage_type(&self) -> &'static str {
        "azure"
    }
}

/// Builds the configured sink. Object-store clients are created here so
/// credential problems surface before any dump process is started.
pub async fn build_sink(storage: &StorageConfig) -> Box<dyn StorageSink> {
    match storage {
        StorageConfig::Local { directory } => Box::new(LocalSink::new(directory.clone())),
        StorageConfig::S3(settings) => Box::new(S3Sink::connect(settings).await),
        StorageConfig::Gcs {
            project_id,
            bucket,
            service_account_key,
            ..
        } => Box::new(GcsSink {
            project_id: project_id.clone(),
            bucket: bucket.clone(),
            service_account_key: service_account_key.clone(),
        }),
        StorageConfig::Azure {
            account_name,
            account_key,
            container,
            ..
        } => Box::new(AzureSink {
            account_name: account_name.clone(),
            account_key: account_key.clone(),
            container: container.clone(),
        }),
    }
}
