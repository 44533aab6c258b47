use std::{collections::HashSet, io::Write, path::Path};

use anyhow::{bail, Context};
use chrono::Utc;
use log::warn;

use crate::{
    bootstrap,
    check_config::{print_diagnostics, resolve_groups},
    cli::Paths,
    config::read_config,
    identity::resolve_identity,
    validate::{self, Severity},
};

pub fn generate(paths: &Paths) -> anyhow::Result<()> {
    let fleet = read_config(&paths.config_file).context(format!(
        "Failed reading config file {:?}",
        paths.config_file
    ))?;
    std::fs::create_dir_all(&paths.output_dir).context("Creating output dir failed")?;
    let resolved = resolve_groups(&fleet);
    let diagnostics = validate::validate(&resolved);
    print_diagnostics(&diagnostics);
    // a failing group is skipped, its siblings still generate
    let failing: HashSet<&str> = diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.severity == Severity::Error)
        .map(|diagnostic| diagnostic.group.as_str())
        .collect();
    for label in &failing {
        warn!("Skipping group {} due to validation errors", label);
    }
    let passing: Vec<_> = resolved
        .into_iter()
        .filter(|group| !failing.contains(group.label.as_str()))
        .map(|group| {
            let identity = resolve_identity(&group, Utc::now());
            (group, identity)
        })
        .collect();
    if passing.is_empty() {
        bail!("no runner group passed validation");
    }
    let artifacts = bootstrap::generate(
        &fleet.deployment,
        fleet.concurrent,
        fleet.check_interval,
        &passing,
    )
    .context("Failed generating bootstrap artifacts")?;
    write_artifact(&paths.output_dir.join("config.toml"), &artifacts.manager_config)?;
    write_artifact(&paths.output_dir.join("reload-hook.conf"), &artifacts.reload_hook)?;
    write_artifact(&paths.output_dir.join("user-data.sh"), &artifacts.user_data)?;
    let provision = serde_json::to_string_pretty(&artifacts.provision)
        .context("Failed serializing provision spec")?;
    write_artifact(&paths.output_dir.join("provision.json"), &provision)?;
    eprintln!(
        "Wrote bootstrap artifacts for {} runner group(s) to {:?}, {} group(s) skipped",
        passing.len(),
        paths.output_dir,
        failing.len()
    );
    Ok(())
}

fn write_artifact(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)
        .context(format!("Failed creating artifact file {:?}", path))?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
