//! hush - machine-wide domain blocking and display grayscale
//!
//! # Usage
//!
//! ```bash
//! hush status                  # Desired state, block list size, recent changes
//! hush enable blocking         # Point system proxy auto-config at the block list
//! hush disable blocking
//! hush add example.com         # Block a domain (reapplied if blocking is on)
//! hush remove example.com
//! hush list                    # Blocked domains
//! hush script                  # Print the generated proxy auto-config script
//! hush run                     # Reapply desired state and follow wake/display events
//! hush version
//! ```
//!
//! Grayscale is held by the running process: displays return to their natural
//! curves when the process that grayed them exits. Use `hush run` to keep it on.

use clap::{Parser, Subcommand};
use hush::audit::AuditLog;
use hush::config::{JsonPreferences, PreferenceStore};
use hush::core::blocking::NetworkBlockController;
use hush::core::blocklist::render_script;
use hush::core::coordinator::{Feature, StateCoordinator, SystemEvent};
use hush::core::gamma::{self, DisplayGammaController, GammaDevice};
use hush::core::lifecycle::{DEFAULT_DISPLAY_POLL, DisplayWatcher, WakeDetector};
use hush::elevation::AuthorizationBroker;
use hush::validators::{normalize_domain, validate_new_domain};
use std::process::ExitCode;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "hush")]
#[command(about = "Toggle domain blocking and display grayscale", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show desired state and recent changes
    Status,
    /// Turn a feature on (blocking or grayscale)
    Enable { feature: Feature },
    /// Turn a feature off (blocking or grayscale)
    Disable { feature: Feature },
    /// Add a domain to the block list
    Add { domain: String },
    /// Remove a domain from the block list
    Remove { domain: String },
    /// List blocked domains
    List,
    /// Print the proxy auto-config script for the current block list
    Script,
    /// Reapply desired state, then follow wake and display changes until Ctrl-C
    Run,
    /// Show build information
    Version,
}

fn main() -> ExitCode {
    let _ = hush::utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

/// Logs to `<state_dir>/hush.log`, filtered by `HUSH_LOG` (default `info`).
fn init_logging() {
    let filter = || EnvFilter::try_from_env("HUSH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(mut log_path) = hush::utils::get_state_dir() {
        log_path.push("hush.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Prints the user-facing explanation of a failure.
fn report(err: &(dyn std::error::Error + 'static)) {
    if let Some(err) = err.downcast_ref::<hush::Error>() {
        let translation = err.translate();
        eprintln!("Error: {}", translation.user_message);
        for suggestion in translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    } else {
        eprintln!("Error: {err}");
    }
}

struct Hush {
    prefs: Arc<JsonPreferences>,
    device: Arc<dyn GammaDevice>,
    coordinator: StateCoordinator,
}

async fn build_runtime() -> Result<Hush, Box<dyn std::error::Error>> {
    let prefs = Arc::new(JsonPreferences::open_default().await?);
    let device = gamma::system_device();
    let broker = Arc::new(AuthorizationBroker::system());
    let blocking = NetworkBlockController::system(broker)?;
    let gamma = Arc::new(DisplayGammaController::new(Arc::clone(&device)));

    let mut coordinator = StateCoordinator::new(blocking, gamma, prefs.clone());
    match AuditLog::new() {
        Ok(audit) => coordinator = coordinator.with_audit(audit),
        Err(e) => tracing::warn!("Audit log unavailable: {e}"),
    }

    Ok(Hush {
        prefs,
        device,
        coordinator,
    })
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Status => {
            let prefs = JsonPreferences::open_default().await?.snapshot().await;
            for feature in Feature::iter() {
                let state = if prefs.desired(feature) { "on" } else { "off" };
                println!("{feature:<10} {state}");
            }
            println!("Blocked domains: {}", prefs.blocked_domains.len());

            if let Ok(audit) = AuditLog::new()
                && let Ok(events) = audit.read_recent(5).await
                && !events.is_empty()
            {
                println!();
                println!("Recent changes:");
                for event in events {
                    let outcome = if event.success { "ok" } else { "failed" };
                    println!(
                        "  {} {:?} {} {outcome}",
                        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        event.event_type,
                        event.feature,
                    );
                }
            }
        }
        Commands::Enable { feature } => {
            let rt = build_runtime().await?;
            rt.coordinator.request_activate(feature).await?;
            println!("✓ {feature} enabled");
            if feature == Feature::Grayscale {
                println!("Note: displays return to normal when this command exits; use `hush run`.");
            }
        }
        Commands::Disable { feature } => {
            let rt = build_runtime().await?;
            rt.coordinator.request_deactivate(feature).await?;
            println!("✓ {feature} disabled");
        }
        Commands::Add { domain } => {
            let rt = build_runtime().await?;
            let existing = rt.prefs.snapshot().await.blocked_domains;
            let domain = validate_new_domain(&domain, &existing)?;
            rt.prefs
                .update(|p| p.blocked_domains.push(domain.clone()))
                .await?;
            println!("✓ Blocking {domain}");
            refresh_blocking(&rt).await?;
        }
        Commands::Remove { domain } => {
            let rt = build_runtime().await?;
            let domain = normalize_domain(&domain);
            if !rt.prefs.snapshot().await.blocked_domains.contains(&domain) {
                return Err(format!("{domain} is not in the block list").into());
            }
            rt.prefs
                .update(|p| p.blocked_domains.retain(|d| *d != domain))
                .await?;
            println!("✓ {domain} removed");
            refresh_blocking(&rt).await?;
        }
        Commands::List => {
            let prefs = JsonPreferences::open_default().await?.snapshot().await;
            for domain in prefs.block_list().sorted() {
                println!("{domain}");
            }
        }
        Commands::Script => {
            let prefs = JsonPreferences::open_default().await?.snapshot().await;
            print!("{}", render_script(&prefs.block_list()));
        }
        Commands::Run => run(build_runtime().await?).await?,
        Commands::Version => {
            println!("hush {}", build::PKG_VERSION);
            println!("commit: {}", build::SHORT_COMMIT);
            println!("built:  {}", build::BUILD_TIME);
            println!("rustc:  {}", build::RUST_VERSION);
        }
    }
    Ok(())
}

/// Rewrites the active script after a block-list edit.
async fn refresh_blocking(rt: &Hush) -> Result<(), Box<dyn std::error::Error>> {
    if rt.prefs.desired(Feature::Blocking).await {
        rt.coordinator.reapply(Feature::Blocking).await?;
        println!("✓ Block list reapplied");
    }
    Ok(())
}

async fn run(rt: Hush) -> Result<(), Box<dyn std::error::Error>> {
    let Hush {
        device,
        coordinator,
        ..
    } = rt;

    let mut transitions = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(t) = transitions.recv().await {
            match t.message {
                Some(message) => println!("{}: {} -> {} ({message})", t.feature, t.from, t.to),
                None => println!("{}: {} -> {}", t.feature, t.from, t.to),
            }
        }
    });

    for (feature, e) in coordinator.handle_event(SystemEvent::Startup).await {
        eprintln!("{feature} was turned off:");
        report(&e);
    }

    let (tx, mut events) = tokio::sync::mpsc::channel(16);
    let wake = WakeDetector::default().spawn(tx.clone());
    let displays = DisplayWatcher::new(device, DEFAULT_DISPLAY_POLL).spawn(tx);

    println!("hush running, Ctrl-C to stop");
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                for (feature, e) in coordinator.handle_event(event).await {
                    eprintln!("{feature} was turned off after {event}:");
                    report(&e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    wake.abort();
    displays.abort();
    coordinator.shutdown().await;
    println!("hush stopped");
    Ok(())
}
