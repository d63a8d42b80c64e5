// dbbackup/src/backup/compress.rs
use std::io::{self, Write};
use std::mem;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll, ready};

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use tokio::io::{AsyncRead, ReadBuf};

use crate::errors::BackupError;

const GZIP_CHUNK_SIZE: usize = 64 * 1024;

/// Compression requested for the stored backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

impl Compression {
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Compression::Gzip => Some(".gz"),
            Compression::None => None,
        }
    }
}

impl FromStr for Compression {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gz" | "gzip" => Ok(Compression::Gzip),
            "none" | "" => Ok(Compression::None),
            other => Err(BackupError::Config(format!(
                "Invalid compression '{other}' (valid: gz, none)"
            ))),
        }
    }
}

/// Gzips an `AsyncRead` on the fly.
///
/// Only one input chunk and the encoder's output for it are held at a time,
/// so backpressure from the consumer still reaches the producer.
pub struct GzipStream<R> {
    inner: R,
    encoder: Option<GzEncoder<Vec<u8>>>,
    scratch: Box<[u8]>,
    staged: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> GzipStream<R> {
    pub fn new(inner: R) -> Self {
        GzipStream {
            inner,
            encoder: Some(GzEncoder::new(Vec::new(), GzLevel::default())),
            scratch: vec![0u8; GZIP_CHUNK_SIZE].into_boxed_slice(),
            staged: Vec::new(),
            pos: 0,
        }
    }

    #[cfg(test)]
    fn staged_capacity(&self) -> usize {
        self.staged.capacity()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for GzipStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.staged.len() {
                let n = buf.remaining().min(this.staged.len() - this.pos);
                buf.put_slice(&this.staged[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let Some(encoder) = this.encoder.as_mut() else {
                return Poll::Ready(Ok(()));
            };

            let mut input = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut input))?;

            this.pos = 0;
            if input.filled().is_empty() {
                // End of input: flush the trailer and stop after it is handed out.
                if let Some(finished) = this.encoder.take() {
                    this.staged = finished.finish()?;
                }
            } else {
                encoder.write_all(input.filled())?;
                mem::swap(&mut this.staged, encoder.get_mut());
                encoder.get_mut().clear();
            }
        }
    }
}
