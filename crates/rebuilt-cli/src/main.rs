//! rebuilt - verify that published npm packages rebuild from their
//! declared sources.
//!
//! Thin driver over `rebuilt-core`: parses arguments, initializes tracing,
//! runs the pipeline, prints one line per version, and exits nonzero when
//! any version failed so upstream automation can retry unprocessed work.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rebuilt_core::cache::FsResultStore;
use rebuilt_core::config::RunConfig;
use rebuilt_core::pipeline::Pipeline;
use rebuilt_core::process::TokioRunner;
use rebuilt_core::registry::HttpRegistry;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Verify that published npm packages can be rebuilt from source.
#[derive(Parser, Debug)]
#[command(name = "rebuilt")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Package name (plain or @scope/name)
    package: String,

    /// Exact version, dist-tag, prefix range like 1.x, or * for every
    /// published version
    #[arg(default_value = "latest")]
    version: String,

    /// Registry base URL
    #[arg(
        long,
        env = "REBUILT_REGISTRY",
        default_value = "https://registry.npmjs.org"
    )]
    registry: String,

    /// Directory holding persisted result histories
    #[arg(long, env = "REBUILT_RESULTS", default_value = "results")]
    results: PathBuf,

    /// Directory receiving dependency-queue handoff files
    #[arg(long, env = "REBUILT_DEPS_QUEUE", default_value = "deps-queue")]
    deps_queue: PathBuf,

    /// Parent directory for scratch work trees (system temp by default)
    #[arg(long, env = "REBUILT_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = RunConfig {
        registry_url: cli.registry,
        cache_root: cli.results,
        deps_dir: cli.deps_queue,
        work_root: cli.work_dir.unwrap_or_else(std::env::temp_dir),
        ..RunConfig::default()
    };

    let registry = HttpRegistry::new(config.registry_url.clone());
    let store = FsResultStore::new(config.cache_root.clone());
    let runner = TokioRunner;

    let pipeline = Pipeline::new(&config, &runner, &registry, &store);
    let report = pipeline.run(&cli.package, &cli.version).await?;

    for outcome in &report.outcomes {
        println!("{} {outcome}", report.package);
    }

    let failed = report.failures();
    if failed > 0 {
        anyhow::bail!("{failed} of {} version(s) failed", report.outcomes.len());
    }
    Ok(())
}
