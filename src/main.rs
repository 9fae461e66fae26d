//! Host error monitor entry point: CLI dispatch, service wiring, signal
//! handlers, async runtime.

mod app;
mod bus;
mod config;
mod decode;
mod hardware;
mod monitors;
mod recovery;
mod registry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use app::cli::{Args, HELP_TEXT};
use app::logging::{init_tracing, resolve_filter, RELOAD_HANDLE};
use bus::proxy::BusctlProxy;
use bus::watch::SignalWatcher;
use config::persistence::{load_config, render_config};
use config::types::Config;
use decode::DiagnosticDecoder;
use hardware::gpio::{self, Polarity, SignalLine, SysfsLine};
use hardware::peci::{PeciCmdsAccess, SocketAccess};
use recovery::RecoveryOrchestrator;
use registry::{FaultRegistry, Services};

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            if err.kind() == clap::error::ErrorKind::DisplayHelp {
                print!("{}", HELP_TEXT);
                std::process::exit(0);
            }
            if err.kind() == clap::error::ErrorKind::DisplayVersion {
                println!("hostfaultd {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }

            eprintln!("{}", err);
            print!("{}", HELP_TEXT);
            std::process::exit(1);
        }
    };

    // Priority: 1. --log-level flag, 2. HOSTFAULTD_LOG env, 3. config file,
    // 4. info. The config value only applies once the file is loaded; SIGHUP
    // re-reads it at runtime.
    let flag_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("HOSTFAULTD_LOG").ok());
    init_tracing(resolve_filter(flag_level.as_deref().unwrap_or("info")));

    let config = load_config(args.config.as_deref()).await?;
    if flag_level.is_none() && config.daemon.log_level != "info" {
        if let Some(handle) = RELOAD_HANDLE.get() {
            let filter = resolve_filter(&config.daemon.log_level);
            if let Err(e) = handle.reload(EnvFilter::new(filter)) {
                warn!("Failed to apply configured log level: {e}");
            }
        }
    }

    if args.show_config {
        println!("{}", render_config(&config)?);
        return Ok(());
    }

    if args.test {
        return run_probe(&config).await;
    }

    info!("Host error monitor v{} starting", env!("CARGO_PKG_VERSION"));

    let proxy = Arc::new(BusctlProxy::new());
    proxy
        .startup_probe()
        .await
        .context("Message bus unavailable")?;

    let shutdown = CancellationToken::new();
    let watcher = SignalWatcher::spawn(proxy.tool(), proxy.as_ref(), shutdown.child_token())
        .await
        .context("Failed to start host state watcher")?;

    let access: Arc<dyn SocketAccess> = Arc::new(PeciCmdsAccess::new());
    let decoder = Arc::new(DiagnosticDecoder::new(
        Arc::clone(&access),
        Arc::clone(&proxy) as _,
        config.peci.min_addr,
        config.peci.max_addr,
    ));
    let orchestrator = RecoveryOrchestrator::new(
        Arc::clone(&proxy) as _,
        Arc::clone(&proxy) as _,
        watcher.crashdump_completions(),
    );
    let services = Services {
        decoder,
        orchestrator,
        power: Arc::clone(&proxy) as _,
        alerts: Arc::clone(&proxy) as _,
        access,
        dumps: Arc::clone(&proxy) as _,
        temperatures: Arc::clone(&proxy) as _,
    };

    let open_line = |name: &str, polarity: Polarity| {
        SysfsLine::open(name, polarity).map(|line| Box::new(line) as Box<dyn SignalLine>)
    };
    let registry = FaultRegistry::build(
        &config,
        &services,
        &open_line,
        watcher.host_power(),
        &shutdown,
    )?;

    spawn_log_reload(args.config.clone());

    wait_for_shutdown().await;
    shutdown.cancel();
    registry.join().await;

    info!("Host error monitor shutdown complete");
    Ok(())
}

/// SIGHUP re-reads the config file and applies its log level.
fn spawn_log_reload(config_path: Option<String>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(e) => {
            warn!("Failed to install SIGHUP handler: {e}");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            sighup.recv().await;
            info!("SIGHUP received, reloading log level configuration");

            match load_config(config_path.as_deref()).await {
                Ok(new_config) => {
                    let filter = resolve_filter(&new_config.daemon.log_level);
                    if let Some(handle) = RELOAD_HANDLE.get() {
                        match handle.reload(EnvFilter::new(filter)) {
                            Ok(_) => info!("Log level reloaded: {}", filter.to_uppercase()),
                            Err(e) => error!("Failed to reload log level: {e}"),
                        }
                    }
                }
                Err(e) => error!("Failed to reload config: {e}"),
            }
        }
    });
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received (Ctrl+C)");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received (Ctrl+C)"),
        _ = sigterm.recv() => info!("Shutdown signal received (SIGTERM)"),
    }
}

/// Hardware probe mode: report each configured line's presence and level and
/// each socket address's ping result, then exit.
async fn run_probe(config: &Config) -> Result<()> {
    info!("Running in hardware probe mode");

    let mut names: Vec<&str> = config.monitors.iter().map(|entry| entry.line()).collect();
    for entry in &config.monitors {
        if let config::types::MonitorEntry::CpuThermtrip {
            fivr_line: Some(fivr),
            ..
        } = entry
        {
            names.push(fivr);
        }
        if let config::types::MonitorEntry::CpldCrc { presence_line, .. } = entry {
            names.push(presence_line);
        }
    }
    names.sort_unstable();
    names.dedup();

    for name in names {
        if !gpio::line_exists(name) {
            println!("line {name}: not found");
            continue;
        }
        match SysfsLine::open(name, Polarity::ActiveLow) {
            Ok(line) => match line.is_asserted() {
                Ok(asserted) => println!(
                    "line {name}: {}",
                    if asserted { "asserted" } else { "idle" }
                ),
                Err(e) => println!("line {name}: unreadable ({e})"),
            },
            Err(e) => println!("line {name}: {e}"),
        }
    }

    let exported = gpio::exported_lines();
    info!("{} lines exported on this platform", exported.len());

    let access = PeciCmdsAccess::new();
    for addr in config.peci.min_addr..=config.peci.max_addr {
        match access.ping(addr).await {
            Ok(()) => match access.read_identity(addr).await {
                Ok(Some(identity)) => println!(
                    "socket {addr:#04x}: responding, CPUID {:#010x} stepping {}",
                    identity.cpuid, identity.stepping
                ),
                Ok(None) => println!("socket {addr:#04x}: responding, no identity"),
                Err(e) => println!("socket {addr:#04x}: responding, identity failed ({e})"),
            },
            Err(_) => println!("socket {addr:#04x}: not responding"),
        }
    }

    Ok(())
}
