use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::RetryPolicy;

/// Top-level configuration loaded from `config.toml`.
///
/// Every section is optional.
///
/// Example TOML:
/// ```toml
/// [remote]
/// manifest_url = "https://example.invalid/update/manifest.json"
///
/// [[artifacts]]
/// name   = "ui"
/// target = "rdi-5-ui.jar"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: Remote,
    #[serde(default)]
    pub fetch: Fetch,
    #[serde(default)]
    pub replace: Replace,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Remote {
    #[serde(default)]
    pub manifest_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Fetch {
    /// Whole-transfer timeout.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            user_agent: "rdi-updater".to_string(),
        }
    }
}

impl Fetch {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Replace {
    pub delete_attempts: u32,
    pub delete_delay_ms: u64,
}

impl Default for Replace {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            delete_attempts: p.attempts,
            delete_delay_ms: p.delay.as_millis() as u64,
        }
    }
}

impl From<&Replace> for RetryPolicy {
    fn from(r: &Replace) -> Self {
        RetryPolicy {
            attempts: r.delete_attempts,
            delay: Duration::from_millis(r.delete_delay_ms),
        }
    }
}

/// One `[[artifacts]]` entry.
///
/// `url` and `sha256` pin the download; when both are absent the remote
/// manifest supplies them.
#[derive(Debug, Deserialize, Clone)]
pub struct Artifact {
    pub name: String,
    pub target: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Artifact {
    /// Relative targets resolve against the directory of the config file.
    pub fn target_in(&self, base: &Path) -> PathBuf {
        if self.target.is_absolute() {
            self.target.clone()
        } else {
            base.join(&self.target)
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.url.is_some() && self.sha256.is_some()
    }
}

/// Load and parse the config file at `path`.
///
/// # Errors
/// - The file cannot be read (the message names the resolved path).
/// - The TOML does not parse.
pub fn load_config(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path)
        .with_context(|| format!("config not found: {}", path.display()))?;
    parse_config(&txt).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_config(txt: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(txt)?;
    for (i, a) in cfg.artifacts.iter().enumerate() {
        if cfg.artifacts[..i].iter().any(|b| b.name == a.name) {
            anyhow::bail!("duplicate artifact name: {}", a.name);
        }
    }
    Ok(cfg)
}
