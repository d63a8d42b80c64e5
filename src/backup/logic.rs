// dbbackup/src/backup/logic.rs
use chrono::{Local, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::compress::{Compression, GzipStream};
use super::db_dump::DatabaseDumper;
use super::sink::{StorageSink, UploadResult};
use super::validating_stream::{StreamOptions, ValidatingStream};
use crate::errors::{BackupError, Result};

const DEFAULT_NAME: &str = "default";

/// What to call the backup and where to put it. Fixed for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub database_type: String,
    pub database_name: Option<String>,
    pub compression: Compression,
    pub path_prefix: String,
}

impl BackupConfig {
    pub fn for_dumper(
        dumper: &dyn DatabaseDumper,
        compression: Compression,
        path_prefix: impl Into<String>,
    ) -> Self {
        BackupConfig {
            database_type: dumper.database_type().to_string(),
            database_name: dumper.database_name().map(str::to_owned),
            compression,
            path_prefix: path_prefix.into(),
        }
    }

    fn name(&self) -> &str {
        self.database_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_NAME)
    }
}

/// `{type}_{name}_{YYYYMMDD_HHMMSS}{extension}[.gz]`
pub fn backup_filename(config: &BackupConfig, extension: &str, timestamp: NaiveDateTime) -> String {
    let mut filename = format!(
        "{}_{}_{}{}",
        config.database_type,
        config.name(),
        timestamp.format("%Y%m%d_%H%M%S"),
        extension
    );
    if let Some(suffix) = config.compression.suffix() {
        if !filename.ends_with(suffix) {
            filename.push_str(suffix);
        }
    }
    filename
}

/// The filename under `path_prefix`, joined by exactly one `/`.
pub fn destination_key(config: &BackupConfig, extension: &str, timestamp: NaiveDateTime) -> String {
    let filename = backup_filename(config, extension, timestamp);
    let prefix = config.path_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        filename
    } else {
        format!("{prefix}/{filename}")
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Runs one backup: dump process into sink, then reap the process.
pub struct BackupExecutor {
    dumper: Box<dyn DatabaseDumper>,
    sink: Box<dyn StorageSink>,
    config: BackupConfig,
    options: StreamOptions,
    clock: fn() -> NaiveDateTime,
}

impl BackupExecutor {
    pub fn new(
        dumper: Box<dyn DatabaseDumper>,
        sink: Box<dyn StorageSink>,
        config: BackupConfig,
        options: StreamOptions,
    ) -> Self {
        BackupExecutor {
            dumper,
            sink,
            config,
            options,
            clock: local_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Streams the dump into the sink.
    ///
    /// The stream is closed on every path. An upload error takes precedence
    /// over a failure reported by close; a fired `cancel` kills the dump and
    /// returns [`BackupError::Cancelled`].
    pub async fn execute(&self, cancel: CancellationToken) -> Result<UploadResult> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let extension = self.dumper.file_extension();
        let key = destination_key(&self.config, extension, (self.clock)());
        let storage = self.sink.storage_type();
        info!(engine = %self.config.database_type, storage, key = %key, "Streaming dump to {key}");

        let mut stream = self.dumper.start(&self.options)?;
        let gzip = self.config.compression == Compression::Gzip && !extension.ends_with(".gz");

        let outcome = {
            let upload = async {
                if gzip {
                    let mut compressed = GzipStream::new(&mut stream);
                    self.sink.upload(&key, &mut compressed).await
                } else {
                    self.sink.upload(&key, &mut stream).await
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = upload => Some(result),
            }
        };

        match outcome {
            None => cancel_dump(&mut stream).await,
            Some(Err(upload_err)) => {
                if let Err(close_err) = close_unless_cancelled(&mut stream, &cancel).await {
                    warn!(error = %close_err, "Dump process also failed; reporting the upload error");
                }
                Err(upload_err)
            }
            Some(Ok(result)) => {
                close_unless_cancelled(&mut stream, &cancel).await?;
                info!(
                    path = %result.destination_key,
                    bytes = result.bytes_written,
                    engine = %self.config.database_type,
                    database = %self.config.name(),
                    storage,
                    "Backup completed"
                );
                Ok(result)
            }
        }
    }
}

/// Reaps the dump process, killing it instead if `cancel` fires first.
/// A tool can close stdout and still linger, so the wait is cancellable too.
async fn close_unless_cancelled(
    stream: &mut ValidatingStream,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        closed = stream.close() => return closed,
    }
    cancel_dump(stream).await
}

async fn cancel_dump<T>(stream: &mut ValidatingStream) -> Result<T> {
    warn!(
        program = stream.program(),
        validated = stream.is_validated(),
        "Backup cancelled, stopping dump process"
    );
    if let Err(e) = stream.abort().await {
        debug!(error = %e, "Dump process ended after cancellation");
    }
    Err(BackupError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::db_dump::DumpCommand;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncRead, AsyncReadExt};

    /// Synthetic dump process driven by a shell script.
    struct ScriptDumper {
        script: &'static str,
        extension: &'static str,
    }

    impl DatabaseDumper for ScriptDumper {
        fn database_type(&self) -> &'static str {
            "postgres"
        }

        fn database_name(&self) -> Option<&str> {
            Some("orders")
        }

        fn file_extension(&self) -> &'static str {
            self.extension
        }

        fn failure_signatures(&self) -> &'static [&'static str] {
            &["error:", "FATAL:"]
        }

        fn command(&self) -> Result<DumpCommand> {
            Ok(DumpCommand::new("sh").arg("-c").arg(self.script))
        }
    }

    type Stored = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    #[derive(Default)]
    struct MemorySink {
        stored: Stored,
    }

    #[async_trait]
    impl StorageSink for MemorySink {
        async fn upload(
            &self,
            key: &str,
            reader: &mut (dyn AsyncRead + Unpin + Send),
        ) -> Result<UploadResult> {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .await
                .map_err(|e| BackupError::from_stream(e, "memory", key))?;
            let bytes_written = data.len() as u64;
            self.stored
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((key.to_string(), data));
            Ok(UploadResult {
                bytes_written,
                destination_key: key.to_string(),
            })
        }

        fn storage_type(&self) -> &'static str {
            "memory"
        }
    }

    /// Reads one chunk, then gives up.
    struct FailingSink;

    #[async_trait]
    impl StorageSink for FailingSink {
        async fn upload(
            &self,
            key: &str,
            reader: &mut (dyn AsyncRead + Unpin + Send),
        ) -> Result<UploadResult> {
            let mut chunk = [0u8; 16];
            let _ = reader.read(&mut chunk).await;
            Err(BackupError::upload(
                "memory",
                format!("bucket rejected {key}"),
                std::io::Error::other("quota exceeded"),
            ))
        }

        fn storage_type(&self) -> &'static str {
            "memory"
        }
    }

    fn fixed_clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(10, 15, 30))
            .expect("valid timestamp")
    }

    fn config(compression: Compression, prefix: &str) -> BackupConfig {
        BackupConfig {
            database_type: "postgres".to_string(),
            database_name: Some("orders".to_string()),
            compression,
            path_prefix: prefix.to_string(),
        }
    }

    fn executor(
        script: &'static str,
        sink: Box<dyn StorageSink>,
        compression: Compression,
    ) -> BackupExecutor {
        let dumper = ScriptDumper { script, extension: ".dump" };
        let config = BackupConfig::for_dumper(&dumper, compression, "");
        BackupExecutor::new(Box::new(dumper), sink, config, StreamOptions::default())
            .with_clock(fixed_clock)
    }

    #[test]
    fn filename_format() {
        let name = backup_filename(&config(Compression::Gzip, ""), ".dump", fixed_clock());
        assert_eq!(name, "postgres_orders_20240301_101530.dump.gz");

        let plain = backup_filename(&config(Compression::None, ""), ".dump", fixed_clock());
        assert_eq!(plain, "postgres_orders_20240301_101530.dump");
    }

    #[test]
    fn filename_does_not_double_gz() {
        let name = backup_filename(&config(Compression::Gzip, ""), ".sql.gz", fixed_clock());
        assert_eq!(name, "postgres_orders_20240301_101530.sql.gz");
    }

    #[test]
    fn empty_name_becomes_default() {
        let mut cfg = config(Compression::None, "");
        cfg.database_name = Some(String::new());
        assert_eq!(
            backup_filename(&cfg, ".rdb", fixed_clock()),
            "postgres_default_20240301_101530.rdb"
        );
        cfg.database_name = None;
        assert_eq!(
            backup_filename(&cfg, ".rdb", fixed_clock()),
            "postgres_default_20240301_101530.rdb"
        );
    }

    #[test]
    fn prefix_is_joined_with_one_slash() {
        let expected = "nightly/postgres_orders_20240301_101530.dump";
        for prefix in ["nightly", "nightly/", "nightly///"] {
            assert_eq!(
                destination_key(&config(Compression::None, prefix), ".dump", fixed_clock()),
                expected
            );
        }
        assert_eq!(
            destination_key(&config(Compression::None, ""), ".dump", fixed_clock()),
            "postgres_orders_20240301_101530.dump"
        );
    }

    #[tokio::test]
    async fn successful_backup_reports_sink_bytes() -> anyhow::Result<()> {
        let sink = MemorySink::default();
        let stored = sink.stored.clone();
        let exec = executor("printf 'PGDMP-0123456789'", Box::new(sink), Compression::None);

        let result = exec.execute(CancellationToken::new()).await?;

        assert_eq!(result.bytes_written, 16);
        assert_eq!(result.destination_key, "postgres_orders_20240301_101530.dump");
        let stored = stored.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].1, b"PGDMP-0123456789");
        Ok(())
    }

    #[tokio::test]
    async fn gzip_output_decompresses_to_dump() -> anyhow::Result<()> {
        let sink = MemorySink::default();
        let stored = sink.stored.clone();
        let exec = executor("printf 'CREATE TABLE orders();'", Box::new(sink), Compression::Gzip);

        let result = exec.execute(CancellationToken::new()).await?;

        assert!(result.destination_key.ends_with(".dump.gz"));
        let stored = stored.lock().unwrap_or_else(|e| e.into_inner());
        let mut decoded = String::new();
        GzDecoder::new(&stored[0].1[..]).read_to_string(&mut decoded)?;
        assert_eq!(decoded, "CREATE TABLE orders();");
        Ok(())
    }

    #[tokio::test]
    async fn empty_failed_dump_reports_diagnostics() {
        let exec = executor(
            "echo 'pg_dump: error: connection to server failed' >&2; exit 1",
            Box::new(MemorySink::default()),
            Compression::None,
        );

        match exec.execute(CancellationToken::new()).await {
            Err(BackupError::DumpFailed { detail, .. }) => {
                assert!(detail.contains("connection to server failed"), "{detail}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_after_data_surfaces_at_close() {
        let exec = executor(
            "printf 'partial'; echo 'lost connection' >&2; exit 2",
            Box::new(MemorySink::default()),
            Compression::None,
        );

        match exec.execute(CancellationToken::new()).await {
            Err(BackupError::DumpFailed { detail, .. }) => assert!(detail.contains("lost connection")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_error_wins_over_close_error() {
        let exec = executor(
            "printf 'some bytes'; exit 4",
            Box::new(FailingSink),
            Compression::None,
        );

        match exec.execute(CancellationToken::new()).await {
            Err(BackupError::Upload { context, .. }) => assert!(context.contains("bucket rejected")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_kills_the_dump() -> anyhow::Result<()> {
        let exec = executor("exec sleep 30", Box::new(MemorySink::default()), Compression::None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), exec.execute(cancel)).await?;

        assert!(matches!(result, Err(BackupError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_reaches_a_dump_lingering_after_its_output() -> anyhow::Result<()> {
        let sink = MemorySink::default();
        let stored = sink.stored.clone();
        let exec = executor(
            "printf data; exec 1>&-; exec sleep 30",
            Box::new(sink),
            Compression::None,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), exec.execute(cancel)).await?;

        assert!(matches!(result, Err(BackupError::Cancelled)), "{result:?}");
        assert_eq!(stored.lock().unwrap_or_else(|e| e.into_inner())[0].1, b"data");
        Ok(())
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lifecycle_events_name_the_engine_and_key() -> anyhow::Result<()> {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let exec = executor("printf 'PGDMP'", Box::new(MemorySink::default()), Compression::None);
        exec.execute(CancellationToken::new()).await?;

        let output = String::from_utf8_lossy(&logs.0.lock().unwrap_or_else(|e| e.into_inner())).into_owned();
        assert!(output.contains("Streaming dump to postgres_orders_20240301_101530.dump"), "{output}");
        assert!(!output.contains("Starting backup"), "{output}");

        let completed = output
            .lines()
            .find(|line| line.contains("Backup completed"))
            .ok_or_else(|| anyhow::anyhow!("no completion event in {output}"))?;
        assert!(completed.contains("engine=postgres"), "{completed}");
        assert!(completed.contains("database=orders"), "{completed}");
        assert!(completed.contains("bytes=5"), "{completed}");
        assert!(completed.contains("memory"), "{completed}");
        Ok(())
    }

    #[tokio::test]
    async fn already_cancelled_token_starts_nothing() {
        let exec = executor("printf data", Box::new(MemorySink::default()), Compression::None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(exec.execute(cancel).await, Err(BackupError::Cancelled)));
    }
}
