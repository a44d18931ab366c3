use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::providers::Format as _;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::download::{
    DEFAULT_CHUNK_SIZE, DEFAULT_PROGRESS_INTERVAL, DEFAULT_STALL_TIMEOUT, DownloadConfig,
};

mod args;
pub use args::{Args, Command};


/// `Settings` are the configurable options for running the update agent.
///
/// The only entry point to construct `Settings` is `Settings::get`.
#[serde_as]
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Directory holding cached firmware images.
    pub downloads: PathBuf,
    /// File holding the persisted candidate records.
    pub records: PathBuf,
    pub chunk_size: usize,
    #[serde_as(as = "DurationMilliSeconds")]
    pub progress_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub stall_timeout: Duration,
    pub allow_http: bool,
    pub force: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downloads: PathBuf::from("/var/lib/wallet-update-agent/downloads"),
            records: PathBuf::from("/var/lib/wallet-update-agent/records.json"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            allow_http: false,
            force: false,
        }
    }
}

impl Settings {
    /// Constructs `Settings` from defaults, a config file, environment variables, and
    /// command line arguments. Command line arguments always take precedence over
    /// environment variables, which in turn take precedence over the config file.
    pub fn get<P: AsRef<Path>>(
        args: &Args,
        config: P,
        env_prefix: &str,
    ) -> figment::error::Result<Settings> {
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(Settings::default()))
            .merge(figment::providers::Toml::file(config))
            .merge(figment::providers::Env::prefixed(env_prefix))
            .merge(figment::providers::Serialized::defaults(args))
            .extract()
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            chunk_size: self.chunk_size,
            progress_interval: self.progress_interval,
            stall_timeout: self.stall_timeout,
            allow_http: self.allow_http,
        }
    }
}
