//! Host configuration from the environment.

use std::path::PathBuf;

use anyhow::Context;
use wharf_core::LogLevel;

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: LogLevel,
    pub functions_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Config {
    /// Read `PORT` and `LOG_LEVEL`; everything else takes its default
    /// and may be overridden by CLI flags.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value {raw:?}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let log_level = match std::env::var("LOG_LEVEL") {
            Ok(raw) => raw
                .parse::<LogLevel>()
                .map_err(|err| anyhow::anyhow!("invalid LOG_LEVEL: {err}"))?,
            Err(_) => LogLevel::Info,
        };

        Ok(Self {
            host: "0.0.0.0".to_string(),
            port,
            log_level,
            functions_dir: PathBuf::from("./functions"),
            logs_dir: PathBuf::from("./logs"),
        })
    }
}
