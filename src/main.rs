mod bytecode;
mod config;
mod execution;
mod ga;
mod generator;
mod instrumentation;
mod lang;
mod slicer;
mod testcase;
mod tracer;
mod vm;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Algorithm, Config, CoverageMetric};
use crate::generator::{generate, GenerationRequest};

/// Interpreter frames recurse on the native stack.
const THREAD_STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "probegen")]
#[command(version)]
#[command(about = "Search-based unit test generation with coverage-guided fitness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate tests for one module of a project
    Generate {
        /// Project directory holding the `.sub` modules
        #[arg(long)]
        project: PathBuf,

        /// Module under test
        #[arg(long)]
        module: String,

        #[arg(long, value_enum)]
        algorithm: Option<Algorithm>,

        /// Coverage metrics to optimise (repeatable)
        #[arg(long = "metric", value_enum)]
        metrics: Vec<CoverageMetric>,

        #[arg(long)]
        seed: Option<u64>,

        /// Search budget in seconds
        #[arg(long)]
        max_search_time: Option<u64>,

        /// Report path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Execute test cases in a worker process
        #[arg(long)]
        subprocess: bool,
    },

    /// Execution worker speaking the pipe protocol on stdin/stdout
    #[command(hide = true)]
    Worker,
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(THREAD_STACK_SIZE)
        .build()
        .context("Failed to start the async runtime")?;

    match cli.command {
        Commands::Worker => {
            // stdout carries the protocol
            FmtSubscriber::builder()
                .with_env_filter(env_filter("info"))
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            runtime.block_on(async {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                execution::serve(stdin, tokio::io::stdout()).await
            })?;
        }
        Commands::Generate {
            project,
            module,
            algorithm,
            metrics,
            seed,
            max_search_time,
            output,
            subprocess,
        } => {
            let config_path = cli.config.clone().or_else(Config::default_config_path);
            let mut config = Config::load(cli.config.as_deref())?;

            FmtSubscriber::builder()
                .with_env_filter(env_filter(&config.general.log_level))
                .with_target(false)
                .init();

            tracing::info!(
                "Config path: {}",
                config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none, using defaults)".to_string())
            );

            if let Some(algorithm) = algorithm {
                config.search.algorithm = algorithm;
            }
            if !metrics.is_empty() {
                config.coverage.metrics = metrics;
            }
            if seed.is_some() {
                config.search.seed = seed;
            }
            if let Some(seconds) = max_search_time {
                config.search.max_search_time_seconds = seconds;
            }
            if subprocess {
                config.execution.subprocess = true;
            }
            let report_path = output.unwrap_or_else(|| config.output.report_path.clone());

            let request = GenerationRequest {
                project,
                module,
                config,
            };
            let handle = runtime.handle().clone();
            let report = runtime
                .block_on(runtime.spawn_blocking(move || generate(&request, handle)))
                .context("Generation task failed")??;

            report.write(&report_path)?;
            tracing::info!(
                "Wrote {} tests to {}",
                report.tests.len(),
                report_path.display()
            );
        }
    }

    Ok(())
}
