use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stacksync_core::api::{CmsClientConfig, HttpCmsClient};
use stacksync_core::config::{DeletionStrategy, load_config};
use stacksync_core::process::{Diagnostics, ProgressSink};
use stacksync_core::pull::{ModuleOutcome, pull_stack};
use stacksync_core::push::push_stack;
use stacksync_core::runtime::ResolvedPaths;

#[derive(Parser)]
#[command(
    name = "stacksync",
    about = "Synchronize a CMS stack with local YAML files",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Project root holding the schema directory and stacksync.toml.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Config file to use instead of <project-root>/stacksync.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit the full report as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Chatty progress output.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Delete items that only exist on the destination side, overriding the
    /// configured deletion strategy.
    #[arg(long, global = true)]
    delete: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror the remote stack into the local schema directory.
    Pull,
    /// Apply the local schema directory to the remote stack.
    Push,
}

/// Progress and diagnostics on stderr, leaving stdout to the JSON report.
struct ConsoleUi {
    verbose: bool,
}

impl ProgressSink for ConsoleUi {
    fn begin(&self, module: &str, total: usize) {
        eprintln!("==> {module} ({total} to process)");
    }

    fn advance(&self, n: usize) {
        if self.verbose {
            for _ in 0..n {
                eprint!(".");
            }
        }
    }
}

impl Diagnostics for ConsoleUi {
    fn info(&self, message: &str) {
        if self.verbose {
            eprintln!("    {message}");
        }
    }

    fn warn(&self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let project_root = match &cli.project_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| project_root.join("stacksync.toml"));
    let config = load_config(&config_path)?;
    let paths = ResolvedPaths::resolve(&project_root, &config);

    let deletion_strategy = if cli.delete {
        DeletionStrategy::Delete
    } else {
        config.deletion_strategy()
    };

    let client = HttpCmsClient::new(CmsClientConfig::from_config(&config)?)
        .context("failed to build API client")?;
    let ui = ConsoleUi {
        verbose: cli.verbose,
    };

    if cli.verbose {
        eprintln!("{}", paths.diagnostics());
    }

    match cli.command {
        Command::Pull => {
            let report = pull_stack(&client, &paths, deletion_strategy, &ui, &ui).await?;
            render(cli.json, report.success, &report.modules, &report.errors, report.request_count)?;
            Ok(report.success)
        }
        Command::Push => {
            let report = push_stack(&client, &paths, deletion_strategy, &ui, &ui).await?;
            render(cli.json, report.success, &report.modules, &report.errors, report.request_count)?;
            Ok(report.success)
        }
    }
}

fn render(
    json: bool,
    success: bool,
    modules: &[ModuleOutcome],
    errors: &[String],
    request_count: usize,
) -> Result<()> {
    if json {
        let report = serde_json::json!({
            "success": success,
            "modules": modules,
            "errors": errors,
            "request_count": request_count,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for outcome in modules {
        println!("{}: {}", outcome.module, outcome.results.summary());
        for (key, message) in &outcome.results.failed {
            println!("  failed {key}: {message}");
        }
    }
    for error in errors {
        println!("module failed: {error}");
    }
    println!(
        "{} in {} API requests",
        if success { "done" } else { "completed with failures" },
        request_count
    );
    Ok(())
}
