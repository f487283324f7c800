//! Harbormaster - web site and application pool watchdog
//!
//! Periodically probes configured sites over HTTP and pools through the
//! service manager, and restarts targets that keep failing.

mod cli;
mod controller;
mod error;
mod logbook;
mod manifest;
mod sickbay;
mod warden;

use cli::{Cli, Commands};
use controller::{AppCmd, ProcessController};
use error::Result;
use logbook::{Logbook, MAX_LOG_LINES};
use manifest::{ConfigStore, GlobalSettings, TargetKind};
use sickbay::UreqProbe;
use warden::{Warden, WardenOptions};

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log lines shown under each status table in watch mode
const WATCH_LOG_LINES: usize = 10;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    init_tracing(cli.verbose);

    let (store, outcome) = ConfigStore::open(&cli.config);
    let logbook = Arc::new(Logbook::new(&cli.log_file, MAX_LOG_LINES));
    let appcmd = match &cli.appcmd {
        Some(program) => AppCmd::new(program),
        None => AppCmd::default(),
    };
    let controller: Arc<dyn ProcessController> =
        Arc::new(appcmd.with_timeout(Duration::from_secs(cli.command_timeout.max(1))));

    let warden = Warden::new(
        Arc::new(store),
        logbook,
        controller,
        Arc::new(UreqProbe),
        WardenOptions::default(),
    );
    warden.log_load(&outcome);

    match cli.command {
        Commands::Watch { refresh, json } => watch(&warden, refresh, json)?,

        Commands::Once { json } => {
            let snapshot = warden.run_once()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", snapshot.render());
            }
        }

        Commands::Status { json } => {
            let doc = warden.store().document();
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("Configuration: {}", warden.store().path().display());
                println!(
                    "  interval: {}s   max failures: {}   auto restart: {}",
                    doc.globals.check_interval,
                    doc.globals.max_failures,
                    if doc.globals.global_auto_restart { "on" } else { "off" }
                );
                println!("\nSites ({}):", doc.websites.len());
                for (name, site) in &doc.websites {
                    println!(
                        "  {:<28} {:<8} {} (expect {}, timeout {}s)",
                        name,
                        if site.enabled { "enabled" } else { "disabled" },
                        site.configured_url().unwrap_or("<binding>"),
                        site.expected_status,
                        site.check_timeout
                    );
                }
                println!("\nPools ({}):", doc.app_pools.len());
                for (name, pool) in &doc.app_pools {
                    println!(
                        "  {:<28} {:<8} auto restart: {}   delay: {}s",
                        name,
                        if pool.enabled { "enabled" } else { "disabled" },
                        if pool.auto_restart { "on" } else { "off" },
                        pool.restart_delay
                    );
                }
            }
        }

        Commands::Sites => list_live(&warden, TargetKind::Site)?,
        Commands::Pools => list_live(&warden, TargetKind::Pool)?,

        Commands::ImportSites { file } => {
            let batch = manifest::parse_batch(&std::fs::read_to_string(&file)?)?;
            let ingest = warden.import_sites(&batch)?;
            println!("{}", ingest.summary("Site"));
        }

        Commands::ImportPools { file } => {
            let batch = manifest::parse_batch(&std::fs::read_to_string(&file)?)?;
            let ingest = warden.import_pools(&batch)?;
            println!("{}", ingest.summary("Pool"));
        }

        Commands::Set {
            interval,
            max_failures,
            auto_restart,
        } => {
            let current = warden.store().globals();
            let globals = GlobalSettings {
                check_interval: interval.unwrap_or(current.check_interval),
                max_failures: max_failures.unwrap_or(current.max_failures),
                global_auto_restart: auto_restart.unwrap_or(current.global_auto_restart),
            };
            warden.set_globals(globals)?;
            println!(
                "Saved: interval {}s, max failures {}, auto restart {}",
                globals.check_interval, globals.max_failures, globals.global_auto_restart
            );
        }

        Commands::Logs { lines } => {
            let tail = warden.logbook().tail_file(lines)?;
            if tail.is_empty() {
                if let Some(path) = warden.logbook().path() {
                    println!("No entries in {}", path.display());
                }
            }
            for line in tail {
                println!("{}", line);
            }
        }

        // Handled before the monitor is built
        Commands::Completion { .. } => unreachable!(),
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "harbormaster=debug" } else { "harbormaster=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Run the monitor until Ctrl+C, printing a status table every `refresh` seconds
fn watch(warden: &Warden, refresh: u64, json: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    let started = warden.start()?;
    println!("{}. Press Ctrl+C to stop.", started.message());

    rt.block_on(async {
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(Duration::from_secs(refresh.max(1)));
        let mut seen = warden.store().modified();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    reload_if_changed(warden, &mut seen);
                    print_status(warden, json);
                }
            }
        }
    });

    println!("\nShutting down...");
    let stopped = warden.stop()?;
    println!("{}", stopped.message());
    Ok(())
}

/// Reload the configuration when another process rewrote the file
fn reload_if_changed(warden: &Warden, seen: &mut Option<SystemTime>) {
    let modified = warden.store().modified();
    if modified != *seen {
        *seen = modified;
        warden.reload();
    }
}

fn print_status(warden: &Warden, json: bool) {
    // A contended lock just means this refresh is skipped
    let Some(snapshot) = warden.get_snapshot() else {
        return;
    };

    if json {
        match serde_json::to_string(&snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "snapshot serialization failed"),
        }
        return;
    }

    println!("{}", snapshot.render());
    let recent = warden.logbook().recent(WATCH_LOG_LINES);
    if !recent.is_empty() {
        println!("Recent log:");
        for line in recent {
            println!("  {}", line);
        }
    }
    println!();
}

/// Print the targets of `kind` known to the service manager
fn list_live(warden: &Warden, kind: TargetKind) -> Result<()> {
    let targets = warden.controller().list_targets(kind)?;
    if targets.is_empty() {
        println!("No {}s reported by the service manager.", kind);
        return Ok(());
    }

    println!("{:<32} {:<10} {:<10} {}", "NAME", "STATE", "MONITORED", "DETAIL");
    println!("{}", "-".repeat(72));
    let started = targets.iter().filter(|t| t.is_started()).count();
    let total = targets.len();
    for target in targets {
        let monitored = if warden.store().contains(kind, &target.name) {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<32} {:<10} {:<10} {}",
            target.name, target.state, monitored, target.detail
        );
    }
    println!("\n{} of {} started", started, total);
    Ok(())
}
