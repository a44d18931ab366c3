//! Fetching firmware images into the artifact store.
use std::{
    fs::File,
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use tracing::{debug, info};
use url::Url;
use wallet_update_agent_core::{CancellationController, LocalOrRemote};

use crate::client;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network failure fetching `{location}`: {cause}")]
    NetworkFailure { location: String, cause: String },
    #[error("no data received from `{location}` for longer than {stall_timeout:?}")]
    Timeout {
        location: String,
        stall_timeout: Duration,
    },
    #[error("download of `{0}` was cancelled")]
    Cancelled(String),
    #[error("failed writing downloaded data")]
    Write(#[source] io::Error),
    #[error("refusing to fetch `{0}` over plain http")]
    InsecureUrl(Url),
    #[error(transparent)]
    Client(#[from] client::Error),
}

/// Knobs of a [`Downloader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadConfig {
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub stall_timeout: Duration,
    pub allow_http: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            allow_http: false,
        }
    }
}

/// Progress callback: bytes transferred so far and the total, if known.
pub type OnProgress<'a> = dyn FnMut(u64, Option<u64>) + 'a;

/// Streams a firmware image from `source` into `target`.
///
/// Implementations make a single attempt, never retrying on their own.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        source: &LocalOrRemote,
        target: &mut dyn Write,
        cancel: &CancellationController,
        on_progress: &mut OnProgress<'_>,
    ) -> Result<u64, DownloadError>;
}

pub struct Downloader {
    client: Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        let client = client::build(config.stall_timeout, config.allow_http)?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    fn open_remote(
        &self,
        url: &Url,
        cancel: &CancellationController,
    ) -> Result<(reqwest::blocking::Response, Option<u64>), DownloadError> {
        if url.scheme() == "http" && !self.config.allow_http {
            return Err(DownloadError::InsecureUrl(url.clone()));
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled(url.to_string()));
        }
        let response = self.client.get(url.clone()).send().map_err(|e| {
            request_error(url.as_str(), &e, self.config.stall_timeout)
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::NetworkFailure {
                location: url.to_string(),
                cause: format!("server answered with status `{status}`"),
            });
        }
        let total = response.content_length();
        info!("downloading `{url}` ({total:?} bytes)");
        Ok((response, total))
    }

    fn copy_chunks<R: Read>(
        &self,
        location: &str,
        mut reader: R,
        total: Option<u64>,
        target: &mut dyn Write,
        cancel: &CancellationController,
        on_progress: &mut OnProgress<'_>,
    ) -> Result<u64, DownloadError> {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut done = 0u64;
        let mut last_data = Instant::now();
        let mut last_report: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                info!("download of `{location}` cancelled after {done} bytes");
                return Err(DownloadError::Cancelled(location.to_string()));
            }
            let n = fill_chunk(&mut reader, &mut buf, &mut last_data, self.config.stall_timeout)
                .map_err(|e| read_error(location, e, self.config.stall_timeout))?;
            if n == 0 {
                break;
            }
            let now = Instant::now();
            target.write_all(&buf[..n]).map_err(DownloadError::Write)?;
            done += n as u64;
            if last_report
                .is_none_or(|at| now.duration_since(at) >= self.config.progress_interval)
            {
                on_progress(done, total);
                last_report = Some(now);
            }
        }

        if let Some(total) = total {
            if done != total {
                return Err(DownloadError::NetworkFailure {
                    location: location.to_string(),
                    cause: format!("stream ended after {done} of {total} bytes"),
                });
            }
        }
        target.flush().map_err(DownloadError::Write)?;
        debug!("fetched {done} bytes from `{location}`");
        Ok(done)
    }
}

impl Fetch for Downloader {
    fn fetch(
        &self,
        source: &LocalOrRemote,
        target: &mut dyn Write,
        cancel: &CancellationController,
        on_progress: &mut OnProgress<'_>,
    ) -> Result<u64, DownloadError> {
        let location = source.to_string();
        match source {
            LocalOrRemote::Remote(url) => {
                let (response, total) = self.open_remote(url, cancel)?;
                self.copy_chunks(&location, response, total, target, cancel, on_progress)
            }
            LocalOrRemote::Local(path) => {
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled(location));
                }
                let file = File::open(path).map_err(|e| DownloadError::NetworkFailure {
                    location: location.clone(),
                    cause: format!("failed opening local image: {e}"),
                })?;
                let total = file.metadata().ok().map(|m| m.len());
                info!("copying local image `{location}` ({total:?} bytes)");
                self.copy_chunks(&location, file, total, target, cancel, on_progress)
            }
        }
    }
}

/// Reads until `buf` is full or the reader is exhausted.
///
/// `last_data` moves forward with every read that returns data. A read that only
/// returns after more than `stall_timeout` without data fails with `TimedOut`.
fn fill_chunk<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    last_data: &mut Instant,
    stall_timeout: Duration,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                let now = Instant::now();
                if now.duration_since(*last_data) > stall_timeout {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data for more than {stall_timeout:?}"),
                    ));
                }
                *last_data = now;
                filled += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn request_error(
    location: &str,
    err: &reqwest::Error,
    stall_timeout: Duration,
) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout {
            location: location.to_string(),
            stall_timeout,
        }
    } else {
        DownloadError::NetworkFailure {
            location: location.to_string(),
            cause: format!("{err:#}"),
        }
    }
}

fn read_error(location: &str, err: io::Error, stall_timeout: Duration) -> DownloadError {
    let timed_out = matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) || err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(reqwest::Error::is_timeout);
    if timed_out {
        DownloadError::Timeout {
            location: location.to_string(),
            stall_timeout,
        }
    } else {
        DownloadError::NetworkFailure {
            location: location.to_string(),
            cause: err.to_string(),
        }
    }
}
