//! `ephm plan`: execute the templates of an environment file and show what they declare.
//!
//! Nothing reaches a container runtime. Scripts run in a scratch workspace
//! that is removed afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Args;
use ephemera_common::config::EngineConfig;
use ephemera_common::types::{EnvironmentSpec, short_id};
use ephemera_template::sandbox::{self, ExecuteParams, TemplateSource};
use ephemera_template::spec::TemplateInstantiation;
use tokio_util::sync::CancellationToken;

use crate::output;

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Environment spec file (JSON or YAML).
    pub file: PathBuf,

    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `plan` command.
///
/// # Errors
///
/// Returns an error if the environment file is invalid or a template fails.
pub fn execute(config: &EngineConfig, args: &PlanArgs) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", args.file.display()))?;
    let spec = EnvironmentSpec::parse(&content)?;
    spec.validate()?;

    let plan_id = format!("plan-{}", short_id());
    let scratch = config.workspace_dir.join(&plan_id);
    let result = instantiate(config, &spec, &plan_id, &scratch);
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        tracing::debug!(dir = %scratch.display(), error = %e, "scratch workspace not removed");
    }
    let instantiations = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&instantiations)?);
        return Ok(());
    }

    println!("Plan for: {} ({})", spec.name, args.file.display());
    println!();
    for inst in &instantiations {
        for line in output::instantiation_lines(inst) {
            println!("  {line}");
        }
    }
    let containers: usize = instantiations.iter().map(|i| i.containers().count()).sum();
    println!();
    println!(
        "  {} template instance(s), {containers} container(s) will be created.",
        instantiations.len()
    );
    if !spec.options.disable_discovery {
        println!("  A discovery agent will be added.");
    }
    Ok(())
}

fn instantiate(
    config: &EngineConfig,
    spec: &EnvironmentSpec,
    plan_id: &str,
    scratch: &Path,
) -> anyhow::Result<Vec<TemplateInstantiation>> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut instantiations = Vec::with_capacity(spec.templates.len());
    for tref in &spec.templates {
        let source = TemplateSource::resolve(&config.template_dir, &tref.template)?;
        let counter = counts.entry(source.name().to_owned()).or_default();
        let index = *counter;
        *counter += 1;

        let params = ExecuteParams {
            env_id: plan_id.to_owned(),
            workspace_dir: scratch.join("ws"),
            mount_dir: scratch.join("mounts"),
            parameters: tref.parameters.clone(),
            cancel: CancellationToken::new(),
        };
        instantiations.push(sandbox::execute_blocking(&source, index, params)?);
    }
    Ok(instantiations)
}
