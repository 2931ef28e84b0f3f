//! guestnet - guest network device manager
//!
//! Validates configurations, plans device layouts for a host interface
//! list and runs the event dispatcher against a simulated datapath.

mod cli;

use cli::{Cli, Commands};
use guestnet::datapath::RecordingDatapath;
use guestnet::device::{DeviceManager, DeviceSummary, NullObserver};
use guestnet::dispatcher::{Dispatcher, DispatcherHandle, Event};
use guestnet::error::Result;
use guestnet::guest::{ArcService, GuestType};
use guestnet::manifest::{self, GuestnetConfig, SubnetClassConfig};
use guestnet::script::{self, Command};
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// First routing table handed out by the simulated datapath
const SIM_TABLE_BASE: i32 = 1000;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<GuestnetConfig> {
    match path {
        Some(path) => manifest::load(path),
        None => Ok(GuestnetConfig::default()),
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    init_tracing(cli.verbose, cli.log_json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check => {
            println!("Configuration OK (guest: {})", config.guest.kind);
            print_class("android", &config.subnets.android);
            print_class("peripheral", &config.subnets.peripheral);
            print_class("container", &config.subnets.container);
            println!(
                "IPv6 retries: {} attempts, {}ms-{}ms",
                config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
            );
        }
        Commands::Plan { json, ifnames } => {
            let mut devices = DeviceManager::from_config(&config);
            devices.on_interface_list_changed(&ifnames, &mut NullObserver);
            print_devices(&devices.summaries(), json)?;
        }
        Commands::Run { script, json } => {
            simulate(&config, script, json)?;
        }
        // Already handled above
        Commands::Completion { .. } => {}
    }

    Ok(())
}

fn print_class(name: &str, class: &SubnetClassConfig) {
    println!(
        "  {:<11} {}/{} x{}",
        name, class.base, class.prefix_len, class.count
    );
}

fn print_devices(rows: &[DeviceSummary], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(rows).map_err(io::Error::from)?;
        println!("{}", out);
        return Ok(());
    }

    println!(
        "{:<10} {:<15} {:<16} {:<18} {:<18} {:<8} {:<5} {:<6}",
        "NAME", "KIND", "HOST IFNAME", "HOST ADDR", "GUEST ADDR", "STARTED", "LINK", "IPV6"
    );
    println!("{}", "-".repeat(101));

    for row in rows {
        let ipv6 = row
            .ipv6_table
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<15} {:<16} {:<18} {:<18} {:<8} {:<5} {:<6}",
            row.name,
            row.kind.to_string(),
            row.host_ifname,
            row.host_addr,
            row.guest_addr,
            if row.started { "yes" } else { "no" },
            if row.link_up { "up" } else { "down" },
            ipv6
        );
    }
    Ok(())
}

/// Run the dispatcher until the script ends or Ctrl-C
fn simulate(config: &GuestnetConfig, script: Option<PathBuf>, json: bool) -> Result<()> {
    let guest = config.guest.kind;
    let rt = tokio::runtime::Runtime::new()?;

    let datapath = RecordingDatapath::new().with_table_base(SIM_TABLE_BASE);
    let (mut dispatcher, handle) = Dispatcher::new(DeviceManager::from_config(config));
    dispatcher.add_service(Box::new(ArcService::new(guest, datapath, &config.retry)));

    // The feeder reports its outcome before asking for shutdown
    let (done_tx, done_rx) = std_mpsc::channel();
    let feeder = handle.clone();
    thread::spawn(move || {
        let result = feed(script.as_deref(), guest, &feeder, json);
        let _ = done_tx.send(result);
        // The dispatcher may already be gone after Ctrl-C
        let _ = feeder.blocking_send(Event::Shutdown);
    });

    let devices = rt.block_on(async {
        let interrupt = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                let _ = interrupt.shutdown().await;
            }
        });
        dispatcher.run().await
    });

    if !devices.is_empty() {
        warn!(count = devices.len(), "Devices left after shutdown");
    }
    match done_rx.try_recv() {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

/// Send script commands to the dispatcher
fn feed(
    path: Option<&Path>,
    guest: GuestType,
    handle: &DispatcherHandle,
    json: bool,
) -> Result<()> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            for command in script::parse_script(&content)? {
                execute(command, guest, handle, json)?;
            }
        }
        None => {
            for (index, line) in io::stdin().lock().lines().enumerate() {
                if let Some(command) = script::parse_line(&line?, index + 1)? {
                    execute(command, guest, handle, json)?;
                }
            }
        }
    }
    Ok(())
}

fn execute(command: Command, guest: GuestType, handle: &DispatcherHandle, json: bool) -> Result<()> {
    match command {
        Command::Show => print_devices(&handle.blocking_snapshot()?, json),
        Command::Wait(delay) => {
            thread::sleep(delay);
            Ok(())
        }
        other => match other.into_event(guest) {
            Some(event) => handle.blocking_send(event),
            None => Ok(()),
        },
    }
}
