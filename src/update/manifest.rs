use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::path::Path;

use crate::config::Config;
use crate::engine::ArtifactDescriptor;

/// Published artifact list, served as JSON:
///
/// ```json
/// { "artifacts": [ { "name": "ui", "url": "https://…/rdi-5-ui.jar", "sha256": "…" } ] }
/// ```
#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub artifacts: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub url: String,
    #[serde(default, alias = "sha512", alias = "sha1")]
    pub sha256: String,
}

impl Manifest {
    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

pub fn fetch_manifest(client: &Client, url: &str) -> Result<Manifest> {
    let m: Manifest = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch manifest: {}", url))?
        .error_for_status()?
        .json()
        .context("manifest is not valid JSON")?;
    Ok(m)
}

/// Descriptors for the configured artifacts, plus the names of entries
/// with nowhere to download from.
#[derive(Debug, Default)]
pub struct Resolved {
    pub descriptors: Vec<ArtifactDescriptor>,
    pub unpublished: Vec<String>,
}

/// Whether any selected artifact needs the remote manifest.
pub fn needs_manifest(cfg: &Config, only: Option<&str>) -> bool {
    cfg.artifacts
        .iter()
        .filter(|a| only.is_none_or(|n| a.name == n))
        .any(|a| !a.is_pinned())
}

/// Pair configured artifacts with manifest entries by name.
///
/// Values set in the config take precedence over the manifest. An artifact
/// with a URL but no digest is still returned; the session refuses it.
pub fn resolve(
    cfg: &Config,
    base: &Path,
    manifest: Option<&Manifest>,
    only: Option<&str>,
) -> Resolved {
    let mut out = Resolved::default();
    for a in cfg
        .artifacts
        .iter()
        .filter(|a| only.is_none_or(|n| a.name == n))
    {
        let published = manifest.and_then(|m| m.entry(&a.name));
        let url = a
            .url
            .clone()
            .or_else(|| published.map(|p| p.url.clone()));
        let Some(url) = url else {
            out.unpublished.push(a.name.clone());
            continue;
        };
        let digest = a
            .sha256
            .clone()
            .or_else(|| published.map(|p| p.sha256.clone()))
            .unwrap_or_default();
        out.descriptors.push(ArtifactDescriptor::new(
            a.name.clone(),
            a.target_in(base),
            url,
            digest,
        ));
    }
    out
}
