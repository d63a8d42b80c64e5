pub(crate) mod compress;
pub(crate) mod db_dump;
mod local_upload;
mod logic;
mod s3_upload;
pub(crate) mod sink;
pub(crate) mod sources;
pub(crate) mod validating_stream;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use logic::{BackupConfig, BackupExecutor};

/// Public entry point for the backup process: builds the dumper and sink
/// from the configuration and runs one backup.
pub async fn run_backup_flow(app_config: &AppConfig, cancel: CancellationToken) -> Result<()> {
    let dumper = app_config.source.dumper();
    let sink = sink::build_sink(&app_config.storage).await;
    let backup_config = BackupConfig::for_dumper(
        dumper.as_ref(),
        app_config.compression,
        app_config.storage.path_prefix(),
    );

    let executor = BackupExecutor::new(
        dumper,
        sink,
        backup_config,
        app_config.stream_options.clone(),
    );
    executor
        .execute(cancel)
        .await
        .with_context(|| format!("Backup of {} database failed", app_config.source.kind))?;
    Ok(())
}
