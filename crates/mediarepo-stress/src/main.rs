use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use mediarepo_service::config::Config;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Run the production logging setup, discarding all output.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local sink, unless statsd is configured.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    let service_config = Config::get(cli.config.as_deref())?;

    let options = logging::Options {
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: The runtime is not started yet, so no other threads exist.
    let mut guard = unsafe { logging::init(&service_config, options)? };
    if guard.sentry_enabled() {
        tracing::info!("Reporting errors and transactions to sentry");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let udp_sink = guard.udp_sink.take();
    runtime.block_on(async move {
        if let Some(udp_sink) = udp_sink {
            tokio::spawn(udp_sink);
        }
        stresstest::perform_stresstest(service_config, workloads, cli.duration).await
    })
}
