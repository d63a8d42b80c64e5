// dbbackup/src/backup/sources.rs
use std::fmt;
use std::str::FromStr;

use url::Url;

use super::db_dump::{ConnectionParams, DatabaseDumper, DumpCommand};
use crate::errors::{BackupError, Result};

/// Supported source engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgres,
    MySql,
    MongoDb,
    Redis,
}

impl DatabaseKind {
    pub fn default_port(self) -> u16 {
        match self {
            DatabaseKind::Postgres => 5432,
            DatabaseKind::MySql => 3306,
            DatabaseKind::MongoDb => 27017,
            DatabaseKind::Redis => 6379,
        }
    }

    /// Builds the dumper for this engine.
    pub fn dumper(self, params: ConnectionParams) -> Box<dyn DatabaseDumper> {
        match self {
            DatabaseKind::Postgres => Box::new(PostgresDumper { params }),
            DatabaseKind::MySql => Box::new(MySqlDumper { params }),
            DatabaseKind::MongoDb => Box::new(MongoDumper { params }),
            DatabaseKind::Redis => Box::new(RedisDumper { params }),
        }
    }
}

impl FromStr for DatabaseKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseKind::Postgres),
            "mysql" | "mariadb" => Ok(DatabaseKind::MySql),
            "mongodb" | "mongo" => Ok(DatabaseKind::MongoDb),
            "redis" => Ok(DatabaseKind::Redis),
            other => Err(BackupError::Config(format!(
                "Unsupported database type '{other}' (expected postgres, mysql, mongodb or redis)"
            ))),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::MySql => "mysql",
            DatabaseKind::MongoDb => "mongodb",
            DatabaseKind::Redis => "redis",
        })
    }
}

/// `pg_dump` in custom format; the password travels in `PGPASSWORD`.
pub struct PostgresDumper {
    pub params: ConnectionParams,
}

impl DatabaseDumper for PostgresDumper {
    fn database_type(&self) -> &'static str {
        "postgres"
    }

    fn database_name(&self) -> Option<&str> {
        self.params.database()
    }

    fn file_extension(&self) -> &'static str {
        ".dump"
    }

    fn failure_signatures(&self) -> &'static [&'static str] {
        &["error:", "FATAL:", "authentication failed"]
    }

    fn command(&self) -> Result<DumpCommand> {
        let p = &self.params;
        let mut cmd = DumpCommand::new("pg_dump")
            .arg("-h")
            .arg(&p.host)
            .arg("-p")
            .arg(p.port.to_string())
            .arg("--format=custom")
            .arg("--compress=6")
            .arg("--no-password");
        if let Some(user) = p.username() {
            cmd = cmd.arg("-U").arg(user);
        }
        if let Some(db) = p.database() {
            cmd = cmd.arg(db);
        }
        if let Some(password) = p.password() {
            cmd = cmd.env("PGPASSWORD", password);
        }
        Ok(cmd)
    }
}

/// `mysqldump` with a consistent snapshot, routines and triggers.
/// The password goes through `MYSQL_PWD`, never the argument list.
pub struct MySqlDumper {
    pub params: ConnectionParams,
}

impl DatabaseDumper for MySqlDumper {
    fn database_type(&self) -> &'static str {
        "mysql"
    }

    fn database_name(&self) -> Option<&str> {
        self.params.database()
    }

    fn file_extension(&self) -> &'static str {
        ".sql"
    }

    fn failure_signatures(&self) -> &'static [&'static str] {
        &["ERROR", "Access denied", "Can't connect", "Unknown database"]
    }

    fn command(&self) -> Result<DumpCommand> {
        let p = &self.params;
        let mut cmd = DumpCommand::new("mysqldump")
            .arg(format!("--host={}", p.host))
            .arg(format!("--port={}", p.port))
            .arg("--single-transaction")
            .arg("--routines")
            .arg("--triggers");
        if let Some(user) = p.username() {
            cmd = cmd.arg(format!("--user={user}"));
        }
        if let Some(db) = p.database() {
            cmd = cmd.arg(db);
        }
        if let Some(password) = p.password() {
            cmd = cmd.env("MYSQL_PWD", password);
        }
        Ok(cmd)
    }
}

/// `mongodump` writing a gzipped archive to stdout. Credentials are part of
/// the connection URI.
pub struct MongoDumper {
    pub params: ConnectionParams,
}

impl MongoDumper {
    fn connection_uri(&self) -> Result<Url> {
        let p = &self.params;
        let mut uri = Url::parse(&format!("mongodb://{}:{}", p.host, p.port))
            .map_err(|e| BackupError::launch("mongodump", format!("invalid host '{}': {e}", p.host)))?;
        if let (Some(user), Some(password)) = (p.username(), p.password()) {
            let rejected = || BackupError::launch("mongodump", "cannot embed credentials in URI");
            uri.set_username(user).map_err(|_| rejected())?;
            uri.set_password(Some(password)).map_err(|_| rejected())?;
        }
        Ok(uri)
    }
}

impl DatabaseDumper for MongoDumper {
    fn database_type(&self) -> &'static str {
        "mongodb"
    }

    fn database_name(&self) -> Option<&str> {
        Some(self.params.database().unwrap_or("all"))
    }

    fn file_extension(&self) -> &'static str {
        ".archive"
    }

    fn failure_signatures(&self) -> &'static [&'static str] {
        &["Failed:", "error connecting", "Authentication failed"]
    }

    fn command(&self) -> Result<DumpCommand> {
        let uri = self.connection_uri()?;
        let mut cmd = DumpCommand::new("mongodump")
            .arg("--uri")
            .arg(uri.as_str())
            .arg("--archive")
            .arg("--gzip");
        if let Some(password) = uri.password() {
            cmd = cmd.secret(password);
        }
        if let Some(db) = self.params.database() {
            cmd = cmd.arg("--db").arg(db);
        }
        Ok(cmd)
    }
}

/// `redis-cli --rdb -` streaming an RDB snapshot to stdout.
pub struct RedisDumper {
    pub params: ConnectionParams,
}

impl DatabaseDumper for RedisDumper {
    fn database_type(&self) -> &'static str {
        "redis"
    }

    fn database_name(&self) -> Option<&str> {
        Some("default")
    }

    fn file_extension(&self) -> &'static str {
        ".rdb"
    }

    fn failure_signatures(&self) -> &'static [&'static str] {
        &[
            "NOAUTH",
            "Authentication required",
            "Connection refused",
            "Could not connect",
        ]
    }

    fn command(&self) -> Result<DumpCommand> {
        let p = &self.params;
        let mut cmd = DumpCommand::new("redis-cli")
            .arg("-h")
            .arg(&p.host)
            .arg("-p")
            .arg(p.port.to_string())
            .arg("--rdb")
            .arg("-");
        if let Some(password) = p.password() {
            cmd = cmd.arg("-a").arg(password).secret(password);
        }
        Ok(cmd)
    }
}
