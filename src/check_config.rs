use anyhow::{bail, Context};
use colored::Colorize;
use itertools::Itertools;
use log::info;

use crate::{
    cli,
    config::{read_config, FleetConfig},
    resolve::{self, ResolvedGroup},
    validate::{self, Diagnostic, Severity},
};

pub fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let severity = match diagnostic.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warning => "warning".yellow().bold(),
        };
        eprintln!("{}: group {}: {}", severity, diagnostic.group, diagnostic.message);
    }
}

pub fn resolve_groups(fleet: &FleetConfig) -> Vec<ResolvedGroup> {
    fleet
        .groups
        .iter()
        .sorted_by(|a, b| a.0.cmp(b.0))
        .map(|(label, group)| resolve::resolve(label, group, fleet))
        .collect()
}

pub fn check(paths: &cli::Paths) -> anyhow::Result<()> {
    let fleet = read_config(&paths.config_file).context(format!(
        "Failed reading config file {:?}",
        paths.config_file
    ))?;
    let resolved = resolve_groups(&fleet);
    let diagnostics = validate::validate(&resolved);
    print_diagnostics(&diagnostics);
    let errors = validate::error_count(&diagnostics);
    if errors > 0 {
        bail!("configuration has {} error(s)", errors);
    }
    info!("Config check successful, no errors found");
    Ok(())
}

pub fn show(paths: &cli::Paths) -> anyhow::Result<()> {
    let fleet = read_config(&paths.config_file).context(format!(
        "Failed reading config file {:?}",
        paths.config_file
    ))?;
    info!("{}", "Full configuration".green());
    println!(
        "{}",
        toml::to_string_pretty(&fleet).context("Failed printing config")?
    );
    let resolved = resolve_groups(&fleet);
    for group in &resolved {
        println!(
            "{}",
            format!("resolved configuration for group {}", group.label).green()
        );
        println!(
            "{}",
            toml::to_string_pretty(group).context(format!(
                "Failed printing resolved configuration for group {}",
                group.label
            ))?
        );
    }
    print_diagnostics(&validate::validate(&resolved));
    Ok(())
}
