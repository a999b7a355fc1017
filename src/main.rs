mod client;
mod daemon;
mod domain;
mod infrastructure;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use domain::models::{DeskStatus, DeviceAddress};
use domain::settings::{Config, ConfigService};
use infrastructure::bluetooth::btle::BtleAdapter;
use infrastructure::bluetooth::scanner::scan_for_desks;
use infrastructure::logging::init_logger;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::info;

/// Control an IKEA Idasen standing desk over Bluetooth.
///
/// The first command starts a background daemon that keeps the desk
/// connection; later commands reuse it.
#[derive(Parser, Debug)]
#[command(name = "idasen-control", version)]
struct Cli {
    /// Move the desk to this height in centimetres
    #[arg(long, value_name = "CM")]
    move_to: Option<f64>,

    /// Print the desk height, position and sitting time
    #[arg(long)]
    status: bool,

    /// Block until the daemon is connected to the desk
    #[arg(long)]
    wait: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Remember this desk address and use it from now on
    #[arg(long, value_name = "ADDRESS")]
    connect_to: Option<String>,

    /// List nearby desks
    #[arg(long)]
    scan: bool,

    /// Print the effective configuration
    #[arg(long)]
    print_config: bool,

    /// Run the daemon in the foreground
    #[arg(long)]
    server: bool,

    /// Stop a running daemon
    #[arg(long)]
    stop_server: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config_service = ConfigService::new()?;

    let mut log_settings = config_service.get().log.clone();
    log_settings.level = log_level(&cli, &log_settings.level);
    let _logging = init_logger(&log_settings)?;

    if cli.server {
        let config = config_service.get().clone();
        return runtime()?
            .block_on(daemon::run_daemon(config))
            .context("Daemon failed");
    }

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(config_service.get())?);
        return Ok(());
    }
    if let Some(address) = cli.connect_to {
        let address = DeviceAddress::new(address);
        config_service.set_desk_address(address.clone())?;
        info!(%address, config = %config_service.path().display(), "Saved desk address");
        stop_server(config_service.get())?;
        return Ok(());
    }
    if cli.stop_server {
        return stop_server(config_service.get());
    }
    if cli.scan {
        return scan(config_service.get());
    }

    if cli.move_to.is_none() && !cli.wait && !cli.status {
        Cli::command().print_help()?;
        return Ok(());
    }

    let config = config_service.get();
    let mut desk = client::ensure_daemon(config)?;

    if cli.wait && !desk.wait()? {
        anyhow::bail!("Daemon could not wait for the desk");
    }
    if let Some(position) = cli.move_to {
        if !desk.move_to(position)? {
            anyhow::bail!("Desk did not move to {position}cm");
        }
    }
    if cli.status {
        let status = desk.status()?;
        if cli.json {
            println!("{}", serde_json::to_string(&status)?);
        } else {
            println!("{}", describe(&status));
        }
    }

    Ok(())
}

/// Clients stay quiet unless asked; the daemon uses the configured level.
fn log_level(cli: &Cli, configured: &str) -> String {
    if cli.verbose {
        "debug".to_string()
    } else if cli.server {
        configured.to_string()
    } else {
        "warn".to_string()
    }
}

fn describe(status: &DeskStatus) -> String {
    match (status.height, status.pos) {
        (Some(height), Some(pos)) if status.ready => {
            let minutes = status.sitting_time.unwrap_or_default() / 60;
            format!("{height:.1}cm ({pos}), sitting for {minutes} min")
        }
        _ => "Desk not ready".to_string(),
    }
}

fn stop_server(config: &Config) -> Result<()> {
    let Some(pid) = daemon::pidfile::read_running_pid(&config.pid_file_path) else {
        info!("No daemon running");
        return Ok(());
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("Failed to stop daemon {pid}"))?;
    info!(pid, "Stopped daemon");
    Ok(())
}

fn scan(config: &Config) -> Result<()> {
    let duration = config.connect_timeout() * 2;
    let desks = runtime()?.block_on(async {
        let adapter = BtleAdapter::first_available().await?;
        scan_for_desks(&adapter, duration).await
    })?;

    if desks.is_empty() {
        println!("No desks found within {}s", duration.as_secs());
    }
    for desk in desks {
        println!("{desk}");
    }
    Ok(())
}
