use std::error::Error;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::info;

use obdlive_lib::{
    BleLink, BleTransport, CommandChannel, ConnectionManager, LiveMetricsAggregator, MetricView,
    Pid, PollingScheduler, ReconnectPolicy,
};

#[derive(Parser)]
#[command(name = "obdlive", about = "Live OBD-II telemetry over ELM327 BLE adapters")]
struct Cli {
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    /// Scan window in seconds
    #[arg(long, default_value_t = 10)]
    scan_window: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look for a compatible adapter and print it
    Scan,
    /// Read a single parameter once (rpm, speed, coolant, fuel, throttle, load)
    Read { pid: Pid },
    /// Poll continuously and render live metrics until ctrl-c
    Live {
        /// Poll interval in milliseconds (clamped to 200..10000)
        #[arg(long, default_value_t = 1000)]
        interval: u64,
        /// Track all six parameters instead of the five-metric overview
        #[arg(long)]
        full: bool,
        /// Emit each refresh as a JSON array
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .init();

    let transport = BleTransport::new().await?;
    let manager = ConnectionManager::new(transport, ReconnectPolicy::default());
    let window = Duration::from_secs(cli.scan_window);

    match cli.command {
        Commands::Scan => {
            match manager.scan(window).await? {
                Some(device) => println!("{}  {}", device.id, device.name),
                None => println!("no compatible adapter found"),
            }
            manager.shutdown().await;
        }
        Commands::Read { pid } => {
            let mut channel = connect_first(&manager, window).await?;
            match channel.read_pid(pid).await? {
                Some(value) => println!("{}: {}", pid, pid.definition().format(value)),
                None => println!("{}: no data", pid),
            }
            manager.disconnect().await?;
            manager.shutdown().await;
        }
        Commands::Live {
            interval,
            full,
            json,
        } => {
            let channel = connect_first(&manager, window).await?;
            let pids = if full {
                Pid::FULL.to_vec()
            } else {
                Pid::OVERVIEW.to_vec()
            };
            let mut poller = PollingScheduler::new(channel, pids);
            poller.set_interval(interval).await;
            let handle = poller.start().await?;

            let mut aggregator = if full {
                LiveMetricsAggregator::full_view(poller.subscribe(), manager.status())
            } else {
                LiveMetricsAggregator::overview(poller.subscribe(), manager.status())
            };
            aggregator.guard(handle);

            let mut snapshots = poller.subscribe();
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        render(&aggregator.metrics(), json)?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("stopping");
                        break;
                    }
                }
            }
            poller.stop().await;
            let _ = manager.disconnect().await;
            manager.shutdown().await;
        }
    }
    Ok(())
}

/// Scan, connect to the first adapter found, and initialize it.
async fn connect_first(
    manager: &ConnectionManager<BleTransport>,
    window: Duration,
) -> Result<CommandChannel<BleLink>, Box<dyn Error>> {
    let device = manager
        .scan(window)
        .await?
        .ok_or("no compatible adapter found")?;
    info!(name = %device.name, "connecting");
    manager.connect(device).await?;
    let mut channel = manager.open_channel().await?;
    channel.initialize().await?;
    Ok(channel)
}

fn render(metrics: &[MetricView], json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string(metrics)?);
        return Ok(());
    }
    if let Some(error) = metrics.iter().find_map(|m| m.error.as_deref()) {
        println!("! {error}");
    }
    for metric in metrics {
        let reading = if metric.is_loading {
            "...".to_string()
        } else {
            metric.formatted.clone()
        };
        println!("{:<22} {:>12}  [{}]", metric.name, reading, metric.severity);
    }
    println!();
    Ok(())
}
