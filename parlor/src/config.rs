//! Startup configuration.
//!
//! Read once from a `.env`-style file. The database keys are required and
//! their absence aborts startup; `DB_PORT` defaults to 3307. `LOG_FILE` and
//! `SCRIPT_FILE` are optional operator conveniences.

use ember::env::{self, EnvError};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SCRIPT_PATH: &str = "scripts/commands.lua";
const DEFAULT_DB_PORT: u16 = 3307;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub log_file: Option<PathBuf>,
    pub script_file: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let vars = env::load_env_file(path)?;

        let required = |key: &'static str| -> Result<String, ConfigError> {
            vars.get(key).cloned().ok_or(ConfigError::MissingKey(key))
        };

        let port = match vars.get("DB_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DB_PORT",
                value: raw.clone(),
            })?,
            None => DEFAULT_DB_PORT,
        };

        Ok(Config {
            db: DbConfig {
                host: required("DB_HOST")?,
                port,
                user: required("DB_USER")?,
                password: required("DB_PASSWORD")?,
                name: required("DB_NAME")?,
            },
            log_file: vars.get("LOG_FILE").map(PathBuf::from),
            script_file: vars
                .get("SCRIPT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT_PATH)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_env(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    const FULL: &str = "DB_HOST=localhost\nDB_USER=chat\nDB_PASSWORD=hunter2\nDB_NAME=chatdb\n";

    #[test]
    fn test_full_config_parses() {
        let (_dir, path) = write_env(
            "DB_HOST=db.internal\nDB_PORT=3310\nDB_USER=chat\nDB_PASSWORD=hunter2\n\
             DB_NAME=chatdb\nLOG_FILE=server.log\nSCRIPT_FILE=ops.lua\n",
        );

        let config = Config::load(&path).unwrap();

        assert_eq!(config.db.host, "db.internal");
        assert_eq!(config.db.port, 3310);
        assert_eq!(config.log_file, Some(PathBuf::from("server.log")));
        assert_eq!(config.script_file, PathBuf::from("ops.lua"));
    }

    #[test]
    fn test_port_defaults_to_3307() {
        let (_dir, path) = write_env(FULL);

        let config = Config::load(&path).unwrap();

        assert_eq!(config.db.port, 3307);
        assert_eq!(config.log_file, None);
        assert_eq!(config.script_file, PathBuf::from(DEFAULT_SCRIPT_PATH));
    }

    #[test]
    fn test_missing_required_key_aborts() {
        let (_dir, path) = write_env("DB_HOST=localhost\nDB_USER=chat\nDB_NAME=chatdb\n");

        let err = Config::load(&path).unwrap_err();

        assert!(matches!(err, ConfigError::MissingKey("DB_PASSWORD")));
    }

    #[test]
    fn test_unparsable_port_rejected() {
        let (_dir, path) = write_env(&format!("{}DB_PORT=not-a-port\n", FULL));

        let err = Config::load(&path).unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { key: "DB_PORT", .. }));
    }

    #[test]
    fn test_missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        assert!(Config::load(&dir.path().join("absent.env")).is_err());
    }
}
