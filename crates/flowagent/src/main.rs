//! vRouter flow agent entry point.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use vrouter_flowagent::flow::FlowEvent;
use vrouter_flowagent::redirect::{FloatingIpTable, RedirectChain, VrfAssignAcl};
use vrouter_flowagent::{FlowAgent, FlowAgentConfig, FlowDaemon, Resolver, RouteTable};

/// vRouter flow agent
#[derive(Parser, Debug)]
#[command(name = "flowagent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of flow table partitions (overrides config)
    #[arg(short = 'p', long)]
    partitions: Option<usize>,

    /// Idle timeout in seconds (overrides config)
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("flowagent failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<FlowAgentConfig> {
    let mut config = match &args.config {
        Some(path) => FlowAgentConfig::from_file(path)?,
        None => FlowAgentConfig::default(),
    };
    if let Some(partitions) = args.partitions {
        config.partitions = partitions;
    }
    if let Some(idle) = args.idle_timeout_secs {
        config.idle_timeout_secs = idle;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    info!("Starting vRouter flow agent");
    if let Some(ref path) = args.config {
        info!("Config: {}", path.display());
    }
    info!("Partitions: {}", config.partitions);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    let routes = Arc::new(RouteTable::new());
    let acl = Arc::new(VrfAssignAcl::new());
    let floating_ips = Arc::new(FloatingIpTable::new());
    config.bootstrap.apply(&routes, &acl, &floating_ips)?;
    info!(
        "Bootstrap: {} routes, {} VRF-assign rules, {} floating IPs",
        routes.route_count(),
        acl.len(),
        floating_ips.len()
    );

    let resolver = Resolver::new(routes.clone(), RedirectChain::new(acl, floating_ips));
    let agent = Arc::new(FlowAgent::new(config, resolver)?);
    let mut events = agent.subscribe_events();
    let daemon = FlowDaemon::start(agent);

    let cancel = daemon.cancellation_token();
    let event_logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Flow event log skipped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    warn!("Received SIGINT, shutting down gracefully...");
    daemon.shutdown().await;
    event_logger.await?;

    info!("vRouter flow agent shutdown complete");
    Ok(())
}

fn log_event(event: &FlowEvent) {
    match event {
        FlowEvent::StateChanged { .. } => info!("Flow {}", event),
        _ => log::debug!("Flow {}", event),
    }
}
