//! `ephm up`: create an environment and keep it until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use ephemera_common::config::EngineConfig;
use ephemera_common::types::EnvironmentSpec;
use ephemera_env::environment::Environment;
use ephemera_env::manager::EnvManager;
use ephemera_runtime::dry_run::DryRunEngine;
use ephemera_runtime::engine::ContainerEngine;

use crate::output::{self, BOLD, CYAN, DIM, GREEN, RESET};

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Environment spec file (JSON or YAML).
    pub file: PathBuf,

    /// Run against the recording in-memory driver.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the environment as JSON on stdout once it is up.
    #[arg(long)]
    pub json: bool,

    /// Tear down right after creation instead of waiting for Ctrl+C.
    #[arg(long)]
    pub once: bool,
}

/// Executes the `up` command.
///
/// # Errors
///
/// Returns an error if no driver is selected, the environment file is invalid, or the
/// environment cannot be created or torn down.
pub fn execute(config: EngineConfig, args: &UpArgs) -> anyhow::Result<()> {
    if !args.dry_run {
        anyhow::bail!("no container runtime driver is built in; pass --dry-run");
    }
    let content = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", args.file.display()))?;
    let spec = EnvironmentSpec::parse(&content)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let engine = Arc::new(DryRunEngine::new());
    let driver: Arc<dyn ContainerEngine> = Arc::<DryRunEngine>::clone(&engine);
    let manager = EnvManager::new(config, driver)?;

    let started = Instant::now();
    let env = match runtime.block_on(manager.create(spec)) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("  Environment creation failed after {:.1}s.", started.elapsed().as_secs_f64());
            return Err(e.into());
        }
    };
    report(&env, started, args.json)?;

    if !args.once {
        wait_for_shutdown(&env)?;
    }

    eprintln!();
    eprintln!("  Tearing down {}...", env.id());
    runtime.block_on(manager.shutdown())?;
    eprintln!(
        "  {GREEN}Environment removed.{RESET} {DIM}{} driver call(s) recorded.{RESET}",
        engine.calls().len()
    );
    Ok(())
}

fn report(env: &Environment, started: Instant, json: bool) -> anyhow::Result<()> {
    let export = env.export();
    if json {
        println!("{}", serde_json::to_string_pretty(&export)?);
    }

    eprintln!();
    eprintln!(
        "  {GREEN}{BOLD}Environment up{RESET} in {:.1}s:",
        started.elapsed().as_secs_f64()
    );
    eprintln!();
    let mut lines = output::environment_lines(&export).into_iter();
    if let Some(header) = lines.next() {
        eprintln!("  {BOLD}{header}{RESET}");
    }
    for line in lines {
        eprintln!("  {CYAN}●{RESET}{line}");
    }
    eprintln!();
    eprintln!("  {DIM}Workspace: {}{RESET}", export.workspace_dir.display());
    Ok(())
}

fn wait_for_shutdown(env: &Environment) -> anyhow::Result<()> {
    eprintln!();
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to tear the environment down...");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        if !env.is_alive() {
            eprintln!("  Keepalive expired.");
            break;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    Ok(())
}
