use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::config;

#[derive(Debug, Args)]
pub struct Paths {
    /// Declaration file for the runner fleet
    #[arg(long, default_value = config::get_default_config_file_path().into_os_string())]
    pub config_file: PathBuf,
    /// Directory the generated bootstrap artifacts are written to
    /// (manager config document, reload hook, user-data script, provision spec)
    #[arg(long, default_value = config::get_default_output_dir().into_os_string(), verbatim_doc_comment)]
    pub output_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates an example configuration file
    CreateExampleConfig,
    /// Prints the example configuration
    ShowExampleConfig,
    /// Checks the configuration for validity
    CheckConfig,
    /// Show the fully-resolved configuration for each runner group
    ShowConfig,
    /// Resolves all runner groups and writes their bootstrap artifacts
    Generate,
}

#[derive(Parser, Debug)]
pub struct CliOptions {
    #[command(subcommand)]
    pub command: Command,
    /// Config file paths
    #[command(flatten)]
    pub paths: Paths,
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}
