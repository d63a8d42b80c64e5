// dbbackup/src/backup/local_upload.rs
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tempfile::Builder as TempFileBuilder;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use super::sink::{StorageSink, UploadResult, copy_stream};
use crate::errors::{BackupError, Result};

const STORAGE: &str = "local";

/// Writes backups below a directory on the local filesystem.
///
/// Data goes to a hidden temporary file next to the target and is renamed
/// into place only after the stream finished cleanly.
#[derive(Debug, Clone)]
pub struct LocalSink {
    directory: PathBuf,
}

impl LocalSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        LocalSink {
            directory: directory.into(),
        }
    }

    /// Full path a key is stored at.
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }

    fn checked_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(BackupError::upload(
                STORAGE,
                format!("refusing to write key '{key}' outside {}", self.directory.display()),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        Ok(self.file_path(key))
    }
}

#[async_trait]
impl StorageSink for LocalSink {
    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<UploadResult> {
        let target = self.checked_path(key)?;
        let parent = target.parent().unwrap_or(&self.directory).to_path_buf();

        fs::create_dir_all(&parent).await.map_err(|e| {
            BackupError::upload(STORAGE, format!("failed to create directory {}", parent.display()), e)
        })?;

        let staging = TempFileBuilder::new()
            .prefix(".dbbackup-")
            .suffix(".partial")
            .tempfile_in(&parent)
            .map_err(|e| {
                BackupError::upload(STORAGE, format!("failed to create file in {}", parent.display()), e)
            })?;
        let handle = staging.as_file().try_clone().map_err(|e| {
            BackupError::upload(STORAGE, format!("failed to open {}", staging.path().display()), e)
        })?;
        let mut file = File::from_std(handle);
        debug!(staging = %staging.path().display(), target = %target.display(), "Writing backup");

        // On any error below `staging` is dropped and the partial file removed.
        let bytes_written = copy_stream(STORAGE, key, reader, &mut file).await?;
        file.flush().await.map_err(|e| {
            BackupError::upload(STORAGE, format!("failed to flush {}", target.display()), e)
        })?;
        file.sync_all().await.map_err(|e| {
            BackupError::upload(STORAGE, format!("failed to sync {}", target.display()), e)
        })?;
        drop(file);

        staging.persist(&target).map_err(|e| {
            BackupError::upload(STORAGE, format!("failed to move backup into {}", target.display()), e.error)
        })?;

        Ok(UploadResult {
            bytes_written,
            destination_key: target.display().to_string(),
        })
    }

    fn storage_type(&self) -> &'static str {
        STORAGE
    }
}
