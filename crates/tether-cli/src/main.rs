use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use tether_adb::{DeviceSelector, DeviceState, DeviceTracker, HostServices};
use tether_debug::{JdwpProcess, JdwpProcessTracker};

/// Tether CLI (device discovery, process tracking, JDWP proxying).
#[derive(Parser)]
#[command(name = "tether", version, about)]
struct Cli {
    /// ADB server address.
    ///
    /// If unset, `ADB_SERVER_SOCKET` (`tcp:host:port` or `host:port`) is used
    /// as a fallback, then the standard `127.0.0.1:5037`.
    #[arg(long, global = true)]
    server: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices known to the ADB server
    Devices,
    /// Track debuggable processes on a device and print changes
    Track(TrackArgs),
    /// Expose a process's JDWP session on a local port for a debugger
    Debug(DebugArgs),
}

#[derive(Args)]
struct TrackArgs {
    /// Device serial (defaults to any online device)
    #[arg(long)]
    serial: Option<String>,
}

#[derive(Args)]
struct DebugArgs {
    /// Device serial (defaults to any online device)
    #[arg(long)]
    serial: Option<String>,
    /// Pid of the debuggable process
    #[arg(long)]
    pid: u32,
}

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let server = resolve_server_addr(cli.server)?;
    tracing::debug!(target: "tether.cli", %server, "using ADB server");
    let services = HostServices::new(server);

    match cli.command {
        Command::Devices => run_devices(services).await,
        Command::Track(args) => run_track(services, args).await,
        Command::Debug(args) => run_debug(services, args).await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("TETHER_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_server_addr(flag: Option<SocketAddr>) -> anyhow::Result<SocketAddr> {
    if let Some(addr) = flag {
        return Ok(addr);
    }
    if let Ok(value) = std::env::var("ADB_SERVER_SOCKET") {
        let value = value.strip_prefix("tcp:").unwrap_or(&value);
        return value
            .parse()
            .with_context(|| format!("invalid ADB_SERVER_SOCKET value {value:?}"));
    }
    Ok(SocketAddr::from(([127, 0, 0, 1], 5037)))
}

fn selector_for(serial: Option<String>) -> DeviceSelector {
    match serial {
        Some(serial) => DeviceSelector::serial(serial),
        None => DeviceSelector::any(),
    }
}

async fn run_devices(services: HostServices) -> anyhow::Result<()> {
    let devices = services.devices().await?;
    if devices.is_empty() {
        println!("no devices");
        return Ok(());
    }
    for device in devices {
        println!("{}\t{:?}", device.serial, device.state);
    }
    Ok(())
}

async fn run_track(services: HostServices, args: TrackArgs) -> anyhow::Result<()> {
    let tracker = DeviceTracker::start(services.clone());
    let selector = selector_for(args.serial);
    let device = tracker
        .wait_for_device(&selector, DISCOVERY_TIMEOUT)
        .await
        .context("no matching device came online")?;
    println!("tracking processes on {}", device.serial());

    let process_tracker = JdwpProcessTracker::start(services, device);
    let mut processes = process_tracker.processes();
    let printer = tokio::spawn(async move {
        let mut last: Vec<u32> = Vec::new();
        loop {
            let current: Vec<JdwpProcess> = processes.borrow_and_update().clone();
            let pids: Vec<u32> = current.iter().map(JdwpProcess::pid).collect();
            if pids != last {
                for process in &current {
                    if !last.contains(&process.pid()) {
                        let name = process
                            .properties()
                            .borrow()
                            .process_name
                            .clone()
                            .unwrap_or_default();
                        println!("+ {}\t{}", process.pid(), name);
                    }
                }
                for pid in &last {
                    if !pids.contains(pid) {
                        println!("- {pid}");
                    }
                }
                last = pids;
            }
            if processes.changed().await.is_err() {
                break;
            }
        }
    });

    let result = process_tracker.join().await;
    printer.abort();
    result?;
    println!("device disconnected");
    Ok(())
}

async fn run_debug(services: HostServices, args: DebugArgs) -> anyhow::Result<()> {
    let tracker = DeviceTracker::start(services.clone());
    let selector = selector_for(args.serial);
    let device = tracker
        .wait_for_device(&selector, DISCOVERY_TIMEOUT)
        .await
        .context("no matching device came online")?;

    let process = JdwpProcess::new(services, device, args.pid);
    process.start_monitoring();

    let mut status = process.proxy_status();
    let addr = loop {
        if let Some(addr) = status.borrow_and_update().socket_address {
            break addr;
        }
        if status.changed().await.is_err() {
            anyhow::bail!("JDWP proxy ended before binding its endpoint");
        }
    };
    println!("JDWP proxy for pid {} listening on {addr}", args.pid);

    let mut device_state = process.device().state();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let attached = status.borrow_and_update().is_external_debugger_attached;
                println!(
                    "debugger {}",
                    if attached { "attached" } else { "detached" }
                );
            }
            changed = device_state.changed() => {
                if changed.is_err() || *device_state.borrow_and_update() == DeviceState::Disconnected {
                    println!("device disconnected");
                    break;
                }
            }
        }
    }
    process.close();
    Ok(())
}
