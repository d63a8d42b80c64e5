use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use which::which;

use crate::errors::{BackupError, Result};

/// Finds a dump tool in the system PATH.
pub fn find_executable(program: &str) -> Result<PathBuf> {
    which(program).map_err(|e| {
        BackupError::launch(
            program,
            format!("{e}. Please ensure the {program} client tools are installed and in your PATH."),
        )
    })
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A subscriber may already be installed (tests); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
