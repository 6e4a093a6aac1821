use std::sync::Arc;

use fluuxd::config::Config;
use fluuxd::server::{ConfigCredentialStore, LoggingRouter, XmppServer};
use fluuxd::tls;

fn print_help() {
    eprintln!("fluuxd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluuxd [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --config=PATH     Configuration file (JSON)");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr");
    eprintln!("      --verbose=xmpp    Verbose logging including stream negotiation traffic");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Logs are always written to a daily-rotating file in:");
    eprintln!("  Linux:   ~/.local/share/fluuxd/logs/");
    eprintln!("  macOS:   ~/Library/Logs/fluuxd/");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

/// Initialize tracing: always write to a rotating file in the platform log
/// directory, optionally mirror to stderr when --verbose is passed.
fn init_tracing(verbose_level: Option<&str>, log_file_path: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = if let Some(path) = log_file_path {
        std::path::PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    } else {
        let base = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let dir = base.join("fluuxd").join("logs");

        #[cfg(target_os = "macos")]
        let dir = dirs::home_dir()
            .map(|h| h.join("Library").join("Logs").join("fluuxd"))
            .unwrap_or(dir);

        dir
    };

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "Warning: could not create log directory '{}': {}",
            log_dir.display(),
            e
        );
    }

    let file_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluuxd=info,info")
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluuxd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || std::env::var("RUST_LOG").is_ok() {
        let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluuxd=debug,debug")
        } else {
            EnvFilter::new("fluuxd=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The guard flushes and stops the background writer thread on drop.
    // Keep it alive until process exit.
    std::mem::forget(guard);

    eprintln!("Log file: {}", log_dir.display());
}

#[tokio::main]
async fn main() {
    // Parse CLI flags early, before the tracing subscriber init.
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }

    let dangerous_insecure_tls = args.iter().any(|arg| arg == "--dangerous-insecure-tls");
    tls::set_dangerous_insecure_tls(dangerous_insecure_tls);
    if dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let log_file_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--log-file="));
    let config_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--config="));

    init_tracing(verbose_level, log_file_path);
    tls::init_crypto_provider();

    let config = match config_path {
        Some(path) => match Config::load(std::path::Path::new(path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("No --config given, using built-in defaults");
            Config::default()
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        domains = ?config.served_domains,
        "Starting fluuxd"
    );

    let store = Arc::new(ConfigCredentialStore::new(config.users.clone()));
    let router = Arc::new(LoggingRouter);
    let mut server = match XmppServer::new(Arc::new(config), store, router) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.start().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
    server.stop().await;
}
