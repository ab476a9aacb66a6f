use anyhow::{Result, bail};
use std::{env, path::Path, path::PathBuf};

pub const HOME_ENV: &str = "RDI_UPDATER_HOME";

#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
    pub config: PathBuf,
}

/// Directory holding `config.toml`.
///
/// `$RDI_UPDATER_HOME` wins; otherwise `$XDG_CONFIG_HOME/rdi-updater`,
/// falling back to `~/.config/rdi-updater`.
pub fn updater_home() -> Result<PathBuf> {
    if let Some(h) = env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(h));
    }
    let base = match env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(x) => PathBuf::from(x),
        None => match env::var_os("HOME").filter(|v| !v.is_empty()) {
            Some(h) => PathBuf::from(h).join(".config"),
            None => bail!("cannot locate a home directory; set {}", HOME_ENV),
        },
    };
    Ok(base.join("rdi-updater"))
}

/// Resolve the config location, honouring an explicit `--config` override.
pub fn paths(config_override: Option<&Path>) -> Result<Paths> {
    match config_override {
        Some(c) => {
            let home = c
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            Ok(Paths {
                home,
                config: c.to_path_buf(),
            })
        }
        None => {
            let home = updater_home()?;
            Ok(Paths {
                config: home.join("config.toml"),
                home,
            })
        }
    }
}
