use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use tracing::Level;

const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_KEYRING_SERVICE: &str = "org.cloudstore";
const DATA_DIR_NAME: &str = "cloudstore";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub download_concurrency: usize,
    pub log_level: Level,
    pub keyring_service: String,
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_data = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join(DATA_DIR_NAME);
        Self::from_lookup(|name| std::env::var(name).ok(), &home, default_data)
    }

    fn from_lookup<F>(lookup: F, home: &Path, default_data: PathBuf) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("CLOUDSTORE_DATA_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or(default_data);
        let download_concurrency = read_u64(
            lookup("CLOUDSTORE_DOWNLOAD_CONCURRENCY"),
            DEFAULT_DOWNLOAD_CONCURRENCY,
        );
        let log_level = match lookup("CLOUDSTORE_LOG") {
            Some(value) => Level::from_str(value.trim())
                .with_context(|| format!("invalid CLOUDSTORE_LOG level: {value}"))?,
            None => Level::INFO,
        };
        let keyring_service = lookup("CLOUDSTORE_KEYRING_SERVICE")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_string());

        Ok(Self {
            data_dir,
            download_concurrency: usize::try_from(download_concurrency)
                .context("CLOUDSTORE_DOWNLOAD_CONCURRENCY is too large")?,
            log_level,
            keyring_service,
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
