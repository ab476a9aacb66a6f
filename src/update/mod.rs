mod manifest;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::load_config;
use crate::engine::{
    CancelToken, HttpFetcher, Outcome, ProgressEvent, RetryPolicy, UpdateCoordinator,
    UpdateSession, build_client, sha256_file,
};
use crate::paths::paths;
use crate::progress::{err_style, ok_style, spinner_style, warn_style};

pub use manifest::{Manifest, ManifestEntry, Resolved, fetch_manifest, needs_manifest, resolve};

/// Options of the `update` command.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Explicit config file instead of `$(rdi-updater home)/config.toml`.
    pub config: Option<PathBuf>,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    /// Restrict the run to one artifact.
    pub only: Option<String>,
}

/// What one `update` run did to each artifact.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub outcomes: Vec<(String, Outcome)>,
    /// Configured artifacts with no download URL anywhere.
    pub unpublished: Vec<String>,
}

impl UpdateReport {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| !o.is_success()).count() + self.unpublished.len()
    }
}

struct Plan {
    resolved: Resolved,
    coordinator: UpdateCoordinator,
    config_path: PathBuf,
}

/// Load the config, consult the manifest when needed and build descriptors.
fn plan(config: Option<&Path>, only: Option<&str>) -> Result<Plan> {
    let p = paths(config)?;
    let cfg = load_config(&p.config)?;
    if let Some(name) = only
        && !cfg.artifacts.iter().any(|a| a.name == name)
    {
        bail!("no artifact named {} in {}", name, p.config.display());
    }

    let client = build_client(&cfg.fetch.user_agent, cfg.fetch.timeout())
        .context("failed to build HTTP client")?;

    let manifest = match cfg.remote.manifest_url.as_deref() {
        Some(url) if needs_manifest(&cfg, only) => Some(fetch_manifest(&client, url)?),
        Some(_) => None,
        None => {
            debug!("no manifest_url configured; using pinned artifacts only");
            None
        }
    };
    let resolved = resolve(&cfg, &p.home, manifest.as_ref(), only);

    let coordinator = UpdateCoordinator::builder(Arc::new(HttpFetcher::new(client)))
        .retry_policy(RetryPolicy::from(&cfg.replace))
        .build();

    Ok(Plan {
        resolved,
        coordinator,
        config_path: p.config,
    })
}

/// Print whether each configured artifact is current, outdated or missing.
///
/// Nothing is downloaded, apart from the manifest.
pub fn cmd_check(config: Option<&Path>, only: Option<&str>) -> Result<()> {
    let plan = plan(config, only)?;
    if plan.resolved.descriptors.is_empty() && plan.resolved.unpublished.is_empty() {
        eprintln!("no artifacts in {}", plan.config_path.display());
        return Ok(());
    }

    for d in &plan.resolved.descriptors {
        let state = if !d.target().exists() {
            "missing".red()
        } else {
            match plan.coordinator.needs_update(d) {
                Ok(false) => "current".green(),
                Ok(true) => "outdated".yellow(),
                Err(e) => format!("unreadable ({})", e).red(),
            }
        };
        println!("{:<12} {:<10} {}", d.name.bold(), state, d.target().display());
    }
    for name in &plan.resolved.unpublished {
        println!("{:<12} {}", name.bold(), "not published".dimmed());
    }
    Ok(())
}

/// Bring every configured artifact up to date.
///
/// High-level flow:
/// 1. Load the config and resolve descriptors (see [`resolve`]).
/// 2. Run one session per artifact **in parallel**, each with its own spinner.
/// 3. A retryable failure is re-attempted up to `retries` more times.
///
/// Per-artifact failures do not stop the others; they are counted in the
/// returned report.
pub fn run_update(opts: &UpdateOptions) -> Result<UpdateReport> {
    let plan = plan(opts.config.as_deref(), opts.only.as_deref())?;
    let mut report = UpdateReport {
        unpublished: plan.resolved.unpublished.clone(),
        ..Default::default()
    };
    let descriptors = &plan.resolved.descriptors;

    let mp = MultiProgress::new();
    for name in &report.unpublished {
        let pb = mp.add(ProgressBar::new_spinner());
        pb.set_style(err_style());
        pb.finish_with_message(format!("{} (error: not published by the manifest)", name));
        warn!(artifact = %name, "no download URL");
    }
    if descriptors.is_empty() {
        if report.unpublished.is_empty() {
            eprintln!("no artifacts in {}", plan.config_path.display());
        }
        return Ok(report);
    }

    let mut bars: Vec<ProgressBar> = Vec::with_capacity(descriptors.len());
    for d in descriptors {
        let pb = mp.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        pb.set_message(format!("checking {}", d.name));
        pb.enable_steady_tick(Duration::from_millis(80));
        bars.push(pb);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get().clamp(1, descriptors.len()))
        .build()
        .context("failed to start worker pool")?;

    let coordinator = &plan.coordinator;
    let outcomes: Vec<(String, Outcome)> = pool.install(|| {
        descriptors
            .par_iter()
            .enumerate()
            .map(|(idx, d)| {
                let pb = &bars[idx];
                let sink = |e: &ProgressEvent| match e {
                    ProgressEvent::Transfer(_) => pb.set_message(format!("{} {}", d.name, e)),
                    ProgressEvent::Phase(text) => pb.set_message(text.clone()),
                };
                let cancel = CancelToken::new();
                let mut session = UpdateSession::new(d.clone());
                let mut outcome = coordinator.attempt(&mut session, &sink, &cancel);
                while outcome.is_retryable() && session.attempt_count() <= opts.retries {
                    pb.set_message(format!("{} (retrying after {})", d.name, outcome));
                    outcome = coordinator.attempt(&mut session, &sink, &cancel);
                }

                match &outcome {
                    Outcome::Updated { strategy } if !strategy.is_atomic() => {
                        pb.set_style(warn_style());
                        pb.finish_with_message(format!("{} {}", d.name, outcome));
                    }
                    Outcome::Failed { .. } => {
                        pb.set_style(err_style());
                        pb.finish_with_message(format!("{} (error: {})", d.name, outcome));
                    }
                    _ => {
                        pb.set_style(ok_style());
                        pb.finish_with_message(format!("{} {}", d.name, outcome));
                    }
                }
                (d.name.clone(), outcome)
            })
            .collect()
    });
    report.outcomes = outcomes;
    Ok(report)
}

/// CLI command: [`run_update`], failing when any artifact did not end up
/// current.
pub fn cmd_update(opts: &UpdateOptions) -> Result<()> {
    let report = run_update(opts)?;
    let failed = report.failures();
    if failed > 0 {
        bail!(
            "{} of {} artifacts failed to update",
            failed,
            report.outcomes.len() + report.unpublished.len()
        );
    }
    Ok(())
}

/// CLI command: print the SHA-256 of a file, as published in manifests.
pub fn cmd_digest(path: &Path) -> Result<()> {
    let d = sha256_file(path).with_context(|| format!("cannot hash {}", path.display()))?;
    println!("{}  {}", d, path.display());
    Ok(())
}
