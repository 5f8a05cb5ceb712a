//! Synthetic access-log generation for search engine load tests.

use std::{
    io::{self, BufWriter, Write},
    net::SocketAddr,
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use eventdata::{
    config::{self, Config},
    runner,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{fs::File, io::AsyncWrite, runtime::Builder, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write bulk bodies of every partition until the sources are exhausted
    Run(RunArgs),
    /// Write individual documents of the first partition, one per line
    Generate(GenerateArgs),
    /// Validate configuration file, build the first partition and exit
    ConfigCheck(ConfigCheckArgs),
}

#[derive(Args)]
struct ConfigCheckArgs {
    /// Path to the yaml configuration
    config_path: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the yaml configuration
    config_path: PathBuf,
    /// Address to expose prometheus metrics on
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Path to the yaml configuration
    config_path: PathBuf,
    /// Number of documents to write
    #[clap(long, default_value_t = 10)]
    count: u64,
    /// Write raw access-log lines instead of documents
    #[clap(long)]
    raw: bool,
}

async fn output(config: &Config) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    Ok(match &config.output {
        Some(path) => Box::new(
            File::create(path)
                .await
                .with_context(|| format!("failed to create output {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    })
}

async fn inner_run(config: Config, prometheus_addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus recorder")?;
        info!(%addr, "serving prometheus metrics");
    }

    let writer = output(&config).await?;
    tokio::select! {
        res = runner::run(config, writer) => {
            let summary = res?;
            info!(bulks = summary.bulks, bytes = summary.bytes, "all partitions finished");
        }
        res = signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(io::stderr)
        .finish()
        .init();

    match Cli::parse().command {
        Commands::Run(args) => {
            let config = config::load_config_from_path(&args.config_path)?;
            let version = env!("CARGO_PKG_VERSION");
            info!("Starting eventdata {version} run.");

            let runtime = Builder::new_multi_thread()
                .enable_io()
                .enable_time()
                .build()?;
            runtime.block_on(inner_run(config, args.prometheus_addr))
        }
        Commands::Generate(args) => {
            let config = config::load_config_from_path(&args.config_path)?;
            let mut out = BufWriter::new(io::stdout().lock());
            let written = runner::generate(&config, args.count, args.raw, &mut out)?;
            out.flush()?;
            info!(written, "documents generated");
            Ok(())
        }
        Commands::ConfigCheck(args) => {
            let config = config::load_config_from_path(&args.config_path)?;
            runner::check(&config)?;
            info!("Configuration file is valid");
            Ok(())
        }
    }
}
