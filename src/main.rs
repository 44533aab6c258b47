use clap::Parser;

/// Generation of the manager bootstrap artifacts
mod bootstrap;
/// Tool to check configuration validity
mod check_config;
/// All CLI arguments
mod cli;
/// All config structs describing the user-declared runner fleet
mod config;
/// Implementation of the generate command writing all bootstrap artifacts
mod generate;
/// Derivation of execution identities and instance-profile bindings
mod identity;
/// All config structs that will be written to the runner-manager config file
mod manager_config;
/// Filling of defaults for partially-declared runner groups
mod resolve;
/// Cross-field validation rules and diagnostics
mod validate;

fn main() -> anyhow::Result<()> {
    let cli = cli::CliOptions::parse();
    simple_logger::SimpleLogger::new()
        .with_level(cli.verbose.log_level_filter())
        .init()
        .unwrap();
    match cli.command {
        cli::Command::CreateExampleConfig => config::write_example_config(&cli.paths.config_file),
        cli::Command::ShowExampleConfig => Ok(config::print_example_config_highlighted()),
        cli::Command::CheckConfig => check_config::check(&cli.paths),
        cli::Command::ShowConfig => check_config::show(&cli.paths),
        cli::Command::Generate => generate::generate(&cli.paths),
    }
}
