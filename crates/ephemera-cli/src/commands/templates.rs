//! `ephm templates`: list available templates or describe one.

use clap::Args;
use ephemera_common::config::EngineConfig;
use ephemera_template::info;

use crate::output;

/// Arguments for the `templates` command.
#[derive(Args, Debug)]
pub struct TemplatesArgs {
    /// Template to describe; lists all templates when omitted.
    pub name: Option<String>,

    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `templates` command.
///
/// # Errors
///
/// Returns an error if the template root cannot be read or the named
/// template fails to describe itself.
pub fn execute(config: &EngineConfig, args: &TemplatesArgs) -> anyhow::Result<()> {
    let root = &config.template_dir;
    let infos = match &args.name {
        Some(name) => vec![info::template_info(root, name)?],
        None => info::list_templates(root)?,
    };
    tracing::debug!(root = %root.display(), templates = infos.len(), "templates loaded");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    if infos.is_empty() {
        println!("No templates under {}", root.display());
        return Ok(());
    }
    for info in &infos {
        for line in output::template_lines(info) {
            println!("{line}");
        }
    }
    Ok(())
}
