use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use virtmon_core::config::{parse_override, DEFAULT_CONFIG_PATH};
use virtmon_core::inspector::VirshInspector;
use virtmon_core::{init_observability, Config, PollLoop, SenderClient, ZabbixApi};

mod shutdown;

use shutdown::shutdown_signal;

#[derive(Parser)]
#[command(name = "virtmond")]
#[command(about = "Report libvirt domain metrics to Zabbix", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override a setting (<section>-<key>=<value>, e.g. agent-hostname=node-1)
    #[arg(short = 's', long = "set", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.apply_overrides(cli.overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    config.validate()?;

    // Observability before anything that logs
    init_observability(&config.agent.log_level, config.agent.metrics_port)?;

    info!(
        hostname = %config.agent.hostname,
        libvirt = %config.libvirt.effective_uri(),
        api = %config.api.url,
        "virtmond starting"
    );

    let endpoints = config.sender.endpoints()?;
    info!(endpoints = ?endpoints, chunk_size = config.sender.chunk_size, "Sender configured");
    let sender = SenderClient::new(endpoints, config.sender.chunk_size, config.sender.timeout());

    let api = ZabbixApi::connect(&config.api)
        .await
        .with_context(|| format!("failed to log in to {}", config.api.endpoint()))?;

    let inspector =
        VirshInspector::new(config.libvirt.virsh_path.clone(), config.libvirt.effective_uri());

    let poller = PollLoop::from_config(&config, Arc::new(inspector), Arc::new(api), sender);
    let shutdown = shutdown_signal();

    if cli.once {
        let report = poller.run_cycle(&shutdown).await;
        if report.failed_domains > 0 || report.delivery.failed > 0 {
            warn!(
                failed_domains = report.failed_domains,
                failed_values = report.delivery.failed,
                "Cycle finished with failures"
            );
        }
    } else {
        poller.run(shutdown).await;
    }

    info!("virtmond shutting down");
    Ok(())
}
