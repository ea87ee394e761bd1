use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use docflow::config::{self, DocflowConfig, CONFIG_FILE_NAME};
use docflow::engine::Engine;
use docflow::graph::build_graph;
use docflow::log::{init_tracing, parse_log_level};
use docflow::scheduler::{PhaseStatus, RunStatus};

#[derive(Parser)]
#[command(name = "docflow", about = "Multi-phase document pipeline scheduler")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/docflow.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter docflow.toml
    Init,
    /// Build the phase graph and print it without running anything
    Plan,
    /// Execute every declared pipeline once
    Run,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => init_tracing(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Init => handle_init(&cli.root),
        Commands::Plan => {
            load(&cli.root, cli.config.as_deref()).and_then(|config| handle_plan(&config))
        }
        Commands::Run => match load(&cli.root, cli.config.as_deref()) {
            Ok(config) => handle_run(&config).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load(root: &Path, config_path: Option<&Path>) -> Result<DocflowConfig, String> {
    match config_path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(root),
    }
}

fn handle_init(root: &Path) -> Result<(), String> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        println!("{} already exists", config_path.display());
        return Ok(());
    }

    let contents = r#"[engine]
fail_fast = false
input_paths = ["input"]
output_path = "output"

[settings]
# title = "My site"

[pipelines.content]

[pipelines.archive]
dependencies = ["content"]

[pipelines.assets]
isolated = true
"#;
    fs::write(&config_path, contents)
        .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

fn handle_plan(config: &DocflowConfig) -> Result<(), String> {
    let registry = config::build_registry(config)?;
    if registry.is_empty() {
        println!("No pipelines declared.");
        return Ok(());
    }

    let graph = build_graph(&registry).map_err(|e| e.to_string())?;
    println!(
        "{} pipeline(s), {} phase(s):",
        registry.len(),
        graph.len()
    );
    print!("{}", graph);
    Ok(())
}

async fn handle_run(config: &DocflowConfig) -> Result<(), String> {
    let mut engine = Engine::from_config(config).map_err(|e| e.to_string())?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let summary = engine.execute(cancel).await.map_err(|e| e.to_string())?;

    println!("\n--- Run Summary ---");
    println!("Status: {:?}", summary.status);
    println!("Elapsed: {} ms", summary.elapsed.as_millis());
    let count = |status: PhaseStatus| summary.phases.iter().filter(|r| r.status == status).count();
    println!("Phases succeeded: {}", count(PhaseStatus::Succeeded));
    println!("Phases failed: {}", count(PhaseStatus::Failed));
    println!("Phases skipped: {}", count(PhaseStatus::Skipped));
    for failure in &summary.failures {
        println!("  - {}", failure);
    }

    engine.dispose();

    match summary.status {
        RunStatus::Completed | RunStatus::NoPipelines => Ok(()),
        status => Err(format!("Run finished with status {:?}", status)),
    }
}
