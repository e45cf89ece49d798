//! CLI command definitions and dispatch.

pub mod plan;
pub mod templates;
pub mod up;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ephemera_common::config::EngineConfig;

/// Ephemera: on-demand ephemeral multi-container environments.
#[derive(Parser, Debug)]
#[command(name = "ephm", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (YAML).
    #[arg(long, global = true, env = "EPHEMERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Template root directory.
    #[arg(long, global = true, env = "EPHEMERA_TEMPLATE_DIR")]
    pub template_dir: Option<PathBuf>,

    /// Base directory of environment workspaces.
    #[arg(long, global = true, env = "EPHEMERA_WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Base directory of mounted files.
    #[arg(long, global = true, env = "EPHEMERA_MOUNT_DIR")]
    pub mount_dir: Option<PathBuf>,

    /// Address clients use to reach published ports.
    #[arg(long, global = true, env = "EPHEMERA_EXPORT_ADDRESS")]
    pub export_address: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List available templates, or describe one.
    Templates(templates::TemplatesArgs),
    /// Execute the templates of a spec and show what they declare.
    Plan(plan::PlanArgs),
    /// Create an environment and keep it until Ctrl+C.
    Up(up::UpArgs),
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result is
    /// invalid.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(dir) = &self.template_dir {
            config.template_dir.clone_from(dir);
        }
        if let Some(dir) = &self.workspace_dir {
            config.workspace_dir.clone_from(dir);
        }
        if let Some(dir) = &self.mount_dir {
            config.mount_dir.clone_from(dir);
        }
        if let Some(address) = &self.export_address {
            config.export_address.clone_from(address);
        }
        config.validate()?;
        tracing::debug!(?config, "engine configuration");
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.engine_config()?;
    match cli.command {
        Command::Templates(args) => templates::execute(&config, &args),
        Command::Plan(args) => plan::execute(&config, &args),
        Command::Up(args) => up::execute(config, &args),
    }
}
