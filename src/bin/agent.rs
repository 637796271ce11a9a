use std::sync::Arc;

use clap::Parser;
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use uplink::{
    actors::{AgentHandle, Services},
    collectors::Collectors,
    config::{Config, read_config_file},
    probes::NetworkProber,
    transport::HttpControlPlane,
};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long)]
    file: Option<String>,

    /// More output (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run a single pull/check/report cycle and exit
    #[arg(long)]
    once: bool,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("uplink", level),
        ("uplink_agent", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn services(config: &Config) -> anyhow::Result<Services> {
    let control_plane = HttpControlPlane::new(
        config.server_url()?,
        &config.agent_id(),
        config.agent_token(),
        config.server_timeout(),
    )?;
    if config.agent_token.is_some() && config.agent_token().is_none() {
        warn!("agent_token references an unset environment variable");
    }

    Ok(Services {
        prober: Arc::new(NetworkProber::new(&config.probes)?),
        collector: Arc::new(Collectors::new(config)?),
        control_plane: Arc::new(control_plane),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(path) => read_config_file(path)?,
        None => Config::default(),
    }
    .with_env_overrides();

    let agent_id = config.agent_id();
    let (handle, task) = AgentHandle::spawn(config.scheduler.clone(), &agent_id, services(&config)?);
    info!("agent {agent_id} started against {}", config.server_url()?);

    if args.once {
        let summary = handle.run_cycle().await?;
        info!(
            "cycle finished: pulled={}, {} monitors, device {:?}, {} delivered, {} queued",
            summary.pulled,
            summary.monitors_checked,
            summary.device_checked,
            summary.delivered,
            summary.queued
        );
    } else {
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
    }

    handle.shutdown().await?;
    task.await?;
    Ok(())
}
