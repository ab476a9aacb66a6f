//! Streaming remote artifacts into local candidate files.

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempPath;
use tracing::debug;

use super::backup::candidate_prefix;
use super::error::FetchError;

const CHUNK: usize = 64 * 1024;
const REPORT_EVERY: Duration = Duration::from_millis(100);
const RATE_WINDOW: Duration = Duration::from_millis(500);

/// One progress sample of a transfer. `None` means unknown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub rate_bytes_per_sec: Option<u64>,
}

impl FetchProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.bytes_transferred as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

impl fmt::Display for FetchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let percent = self
            .percent()
            .map(|p| format!("{:.1}%", p))
            .unwrap_or_else(|| "--".to_string());
        let total = self
            .total_bytes
            .filter(|t| *t > 0)
            .map(human_size)
            .unwrap_or_else(|| "--".to_string());
        let rate = self
            .rate_bytes_per_sec
            .filter(|r| *r > 0)
            .map(|r| format!("{}/s", human_size(r)))
            .unwrap_or_else(|| "--".to_string());
        write!(
            f,
            "downloading: {} {}/{} {}",
            percent,
            human_size(self.bytes_transferred),
            total,
            rate
        )
    }
}

/// `1536` → `"1.5KB"`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut v = bytes as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", v, UNITS[unit])
}

/// Something that can stream a URL into a file.
///
/// Implementations own transport concerns (TLS, redirects, transport-level
/// retries). `on_progress` may be called any number of times; returning
/// `ControlFlow::Break` aborts the transfer with [`FetchError::Aborted`].
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(&FetchProgress) -> ControlFlow<()>,
    ) -> Result<(), FetchError>;
}

/// Shared HTTP client with the updater's user agent and transfer timeout.
pub fn build_client(user_agent: &str, timeout: Duration) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, v);
    }
    Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
}

/// [`Fetcher`] over blocking `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn network_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

fn read_error(url: &str, e: io::Error) -> FetchError {
    if e.kind() == io::ErrorKind::TimedOut {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(&FetchProgress) -> ControlFlow<()>,
    ) -> Result<(), FetchError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| network_error(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let total = resp.content_length();
        debug!(url, total, "download started");

        let mut out = BufWriter::new(File::create(dest)?);
        let mut meter = RateMeter::new(Instant::now());
        let mut progress = FetchProgress {
            bytes_transferred: 0,
            total_bytes: total,
            rate_bytes_per_sec: None,
        };
        let mut last_report: Option<Instant> = None;
        let mut buf = vec![0u8; CHUNK];

        if on_progress(&progress).is_break() {
            return Err(FetchError::Aborted);
        }
        loop {
            let n = resp.read(&mut buf).map_err(|e| read_error(url, e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            progress.bytes_transferred += n as u64;

            let now = Instant::now();
            if let Some(rate) = meter.sample(now, progress.bytes_transferred) {
                progress.rate_bytes_per_sec = Some(rate);
            }
            if last_report.is_none_or(|t| now.duration_since(t) >= REPORT_EVERY) {
                last_report = Some(now);
                if on_progress(&progress).is_break() {
                    return Err(FetchError::Aborted);
                }
            }
        }

        out.flush()?;
        out.get_ref().sync_all()?;

        if let Some(expected) = total
            && progress.bytes_transferred != expected
        {
            return Err(FetchError::Truncated {
                url: url.to_string(),
                received: progress.bytes_transferred,
                expected,
            });
        }
        if on_progress(&progress).is_break() {
            return Err(FetchError::Aborted);
        }
        debug!(url, bytes = progress.bytes_transferred, "download finished");
        Ok(())
    }
}

/// Instantaneous transfer rate over a short sliding window.
#[derive(Debug)]
struct RateMeter {
    window_start: Instant,
    window_bytes: u64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: 0,
        }
    }

    fn sample(&mut self, now: Instant, total: u64) -> Option<u64> {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < RATE_WINDOW {
            return None;
        }
        let rate = ((total - self.window_bytes) as f64 / elapsed.as_secs_f64()) as u64;
        self.window_start = now;
        self.window_bytes = total;
        Some(rate)
    }
}

/// A uniquely named file beside the target that receives downloaded bytes.
///
/// Dropping the candidate deletes whatever is still at its path, so an
/// aborted or rejected download never lingers.
#[derive(Debug)]
pub struct DownloadedCandidate {
    path: TempPath,
}

impl DownloadedCandidate {
    /// Create `<target-name>.downloading.<random>` in the target's directory,
    /// creating the directory if needed.
    pub fn beside(target: &Path) -> io::Result<Self> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let path = tempfile::Builder::new()
            .prefix(&candidate_prefix(target))
            .rand_bytes(8)
            .tempfile_in(&dir)?
            .into_temp_path();
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
