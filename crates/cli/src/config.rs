use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use portico_core::EnvironmentTarget;
use portico_render::ManifestSource;
use tracing::{debug, info};

/// `<config-dir>/environments/<env>.yaml`
pub fn environment_file(config_dir: &Path, env: &str) -> PathBuf {
    config_dir.join("environments").join(format!("{}.yaml", env))
}

fn parse_secs(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|_| anyhow!("invalid {}={:?}; expected whole seconds", key, raw))
}

/// Apply `PORTICO_*` timeout overrides. `lookup` is `std::env::var` outside tests.
pub fn apply_overrides(target: &mut EnvironmentTarget, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(v) = lookup("PORTICO_READY_TIMEOUT_SECS") {
        target.readiness.timeout_secs = parse_secs("PORTICO_READY_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = lookup("PORTICO_READY_POLL_SECS") {
        target.readiness.poll_secs = parse_secs("PORTICO_READY_POLL_SECS", &v)?;
    }
    if let Some(v) = lookup("PORTICO_PROBE_TIMEOUT_SECS") {
        target.probes.timeout_secs = parse_secs("PORTICO_PROBE_TIMEOUT_SECS", &v)?;
    }
    Ok(())
}

pub fn load_target(config_dir: &Path, env: &str) -> Result<EnvironmentTarget> {
    let path = environment_file(config_dir, env);
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading environment {}", path.display()))?;
    let mut target: EnvironmentTarget =
        serde_yaml::from_str(&text).with_context(|| format!("parsing environment {}", path.display()))?;
    apply_overrides(&mut target, |k| std::env::var(k).ok())?;
    debug!(env = %env, namespace = %target.namespace, overlays = ?target.overlays, "environment loaded");
    Ok(target)
}

/// Target plus manifests, both read from `config_dir`.
pub fn load(config_dir: &Path, env: &str) -> Result<(EnvironmentTarget, ManifestSource)> {
    let target = load_target(config_dir, env)?;
    let source = ManifestSource::load(config_dir).with_context(|| format!("loading manifests from {}", config_dir.display()))?;
    info!(env = %env, base = source.base.len(), overlays = source.overlays.len(), "configuration loaded");
    Ok((target, source))
}
