//! Crate entry point for **rdi-updater**.
//!
//! [`engine`] is the reusable part: it replaces an artifact on disk with a
//! verified download while keeping the previous version recoverable, even
//! when the file is held open by a running program. The remaining modules
//! build the `rdi-updater` CLI on top of it (config, manifest lookup,
//! progress display).

pub mod config;
pub mod engine;
mod paths;
mod progress;
mod update;

pub use config::{Config, load_config};
pub use paths::{HOME_ENV, Paths, paths, updater_home};
pub use update::{
    Manifest, ManifestEntry, Resolved, UpdateOptions, UpdateReport, cmd_check, cmd_digest,
    cmd_update, fetch_manifest, resolve, run_update,
};
