// dbbackup/src/config/mod.rs
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::backup::compress::Compression;
use crate::backup::db_dump::{ConnectionParams, DatabaseDumper};
use crate::backup::sources::DatabaseKind;
use crate::backup::validating_stream::StreamOptions;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_LOCAL_DIR: &str = "./backups";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonStorageConfig {
    pub kind: Option<String>,
    pub directory: Option<PathBuf>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub path_prefix: Option<String>,
    pub project_id: Option<String>,
    pub service_account_key: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub container: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database: Option<JsonDatabaseConfig>,
    pub storage: Option<JsonStorageConfig>,
    pub compression: Option<String>,
    pub log_level: Option<String>,
    pub log_diagnostics: Option<bool>,
    pub probe_delay_ms: Option<u64>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kind: DatabaseKind,
    pub params: ConnectionParams,
}

impl SourceConfig {
    pub fn dumper(&self) -> Box<dyn DatabaseDumper> {
        self.kind.dumper(self.params.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        directory: PathBuf,
    },
    S3(S3Settings),
    Gcs {
        project_id: String,
        bucket: String,
        service_account_key: Option<String>,
        path_prefix: Option<String>,
    },
    Azure {
        account_name: String,
        account_key: Option<String>,
        container: String,
        path_prefix: Option<String>,
    },
}

impl StorageConfig {
    /// Key prefix for object stores. The local sink writes straight into its
    /// directory and has none.
    pub fn path_prefix(&self) -> &str {
        let prefix = match self {
            StorageConfig::Local { .. } => None,
            StorageConfig::S3(settings) => settings.path_prefix.as_deref(),
            StorageConfig::Gcs { path_prefix, .. } | StorageConfig::Azure { path_prefix, .. } => {
                path_prefix.as_deref()
            }
        };
        prefix.unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub compression: Compression,
    pub log_level: String,
    pub stream_options: StreamOptions,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let database = raw
            .database
            .context("database section must be set in config.json")?;
        let source = load_source_config(&database)?;
        let storage = load_storage_config(&raw.storage.unwrap_or_default())?;

        let compression = match raw.compression.as_deref() {
            Some(value) => value.parse::<Compression>()?,
            None => Compression::default(),
        };

        let log_level = raw
            .log_level
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            bail!(
                "log_level '{}' is not one of {}",
                log_level,
                LOG_LEVELS.join(", ")
            );
        }

        let mut stream_options = StreamOptions::default();
        if let Some(ms) = raw.probe_delay_ms {
            stream_options.probe_delay = Duration::from_millis(ms);
        }
        stream_options.log_diagnostics = raw.log_diagnostics.unwrap_or(false);

        Ok(AppConfig {
            source,
            storage,
            compression,
            log_level,
            stream_options,
        })
    }
}

/// Explicit fields win; `url` fills in whatever is left out.
fn load_source_config(raw: &JsonDatabaseConfig) -> Result<SourceConfig> {
    let kind: DatabaseKind = raw
        .db_type
        .as_deref()
        .context("database.type must be set in config.json")?
        .parse()?;
    let default_port = kind.default_port();

    let from_url = match raw.url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => ConnectionParams::from_url(url, default_port)?,
        None => ConnectionParams {
            host: DEFAULT_HOST.to_string(),
            port: default_port,
            ..ConnectionParams::default()
        },
    };

    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
    let params = ConnectionParams {
        host: non_empty(&raw.host).unwrap_or(from_url.host),
        port: raw.port.filter(|p| *p != 0).unwrap_or(from_url.port),
        database: non_empty(&raw.name).or(from_url.database),
        username: non_empty(&raw.username).or(from_url.username),
        password: non_empty(&raw.password).or(from_url.password),
    };

    Ok(SourceConfig { kind, params })
}

fn load_storage_config(raw: &JsonStorageConfig) -> Result<StorageConfig> {
    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
    let kind = raw
        .kind
        .as_deref()
        .map(|k| k.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "local".to_string());

    let storage = match kind.as_str() {
        "local" => StorageConfig::Local {
            directory: raw
                .directory
                .clone()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_DIR)),
        },
        "s3" => {
            let access_key_id = non_empty(&raw.access_key_id);
            let secret_access_key = non_empty(&raw.secret_access_key);
            if access_key_id.is_some() != secret_access_key.is_some() {
                warn!("Only one of access_key_id/secret_access_key is set; using the default AWS credential chain");
            }
            StorageConfig::S3(S3Settings {
                bucket: non_empty(&raw.bucket)
                    .context("storage.bucket must be set in config.json for s3 storage")?,
                region: non_empty(&raw.region).unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                access_key_id,
                secret_access_key,
                endpoint_url: non_empty(&raw.endpoint_url),
                path_prefix: non_empty(&raw.path_prefix),
            })
        }
        "gcs" => StorageConfig::Gcs {
            project_id: non_empty(&raw.project_id).unwrap_or_default(),
            bucket: non_empty(&raw.bucket)
                .context("storage.bucket must be set in config.json for gcs storage")?,
            service_account_key: non_empty(&raw.service_account_key),
            path_prefix: non_empty(&raw.path_prefix),
        },
        "azure" => StorageConfig::Azure {
            account_name: non_empty(&raw.account_name)
                .context("storage.account_name must be set in config.json for azure storage")?,
            account_key: non_empty(&raw.account_key),
            container: non_empty(&raw.container)
                .context("storage.container must be set in config.json for azure storage")?,
            path_prefix: non_empty(&raw.path_prefix),
        },
        other => bail!("storage.kind '{}' is not one of local, s3, gcs, azure", other),
    };
    Ok(storage)
}
