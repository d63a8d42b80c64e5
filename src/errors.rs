use std::error::Error as StdError;
use std::io;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to start {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("{program} failed: {detail}")]
    DumpFailed { program: String, detail: String },

    #[error("Upload to {storage} failed: {context}")]
    Upload {
        storage: &'static str,
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("{0} upload not implemented yet")]
    NotImplemented(&'static str),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackupError {
    pub fn launch(program: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::Launch {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    pub fn dump_failed(program: impl Into<String>, detail: impl Into<String>) -> Self {
        BackupError::DumpFailed {
            program: program.into(),
            detail: detail.into(),
        }
    }

    pub fn upload(
        storage: &'static str,
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        BackupError::Upload {
            storage,
            context: context.into(),
            source: source.into(),
        }
    }

    /// Wraps this error so it can travel through an `AsyncRead` implementation.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }

    /// Maps a read failure observed by a sink. Errors raised by the dump stream
    /// itself come back out unchanged; anything else is an upload failure.
    pub fn from_stream(err: io::Error, storage: &'static str, context: impl Into<String>) -> Self {
        let carries_backup_error = err
            .get_ref()
            .is_some_and(|inner| inner.is::<BackupError>());
        if !carries_backup_error {
            return Self::upload(storage, context, err);
        }
        match err.into_inner().map(|inner| inner.downcast::<BackupError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::upload(storage, context, other),
            None => Self::upload(storage, context, io::Error::other("stream failed")),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
