use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use httpscope::config::Config;

const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// eBPF-based HTTP transaction monitoring agent.
#[derive(Parser)]
#[command(name = "httpscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging filter, overriding `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the configuration, print it, and exit.
    CheckConfig,
}

fn version() -> String {
    format!(
        "{RELEASE} (commit: {}, {}/{})",
        option_env!("GIT_COMMIT").unwrap_or("unknown"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("httpscope {}", version());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate().context("validating default config")?;
            cfg
        }
    };

    if let Some(Command::CheckConfig) = &cli.command {
        println!("{cfg:#?}");
        return Ok(());
    }

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = RELEASE,
        config = ?cli.config,
        "starting httpscope",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

#[cfg(feature = "bpf")]
async fn run(cfg: Config) -> Result<()> {
    use httpscope::agent::Agent;
    use httpscope::producer::bpf::BpfProducer;

    let producer = BpfProducer::new(&cfg.bpf);
    let mut agent = Agent::new(cfg, producer)?;
    agent.start().await?;

    wait_for_shutdown().await?;

    agent.stop().await?;
    tracing::info!("httpscope stopped");
    Ok(())
}

#[cfg(not(feature = "bpf"))]
async fn run(_cfg: Config) -> Result<()> {
    anyhow::bail!("httpscope was built without bpf support; rebuild with --features bpf")
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(feature = "bpf")]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
