//! MushPi controller entry point: parses CLI args, initializes
//! configuration and tracing, then boots and runs the supervisor until a
//! shutdown signal arrives.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use mushpi::config::{self, MushPiConfig};
use mushpi::error::exit_code;
use mushpi::Supervisor;

/// MushPi: single-chamber environmental controller.
#[derive(Parser, Debug)]
#[command(name = "mushpi", about = "Mushroom cultivation chamber controller")]
struct CliArgs {
    /// Override DB_PATH: where the persistent store lives.
    #[arg(long)]
    data_dir: Option<String>,

    /// Delete the persistent store at startup before opening it fresh.
    #[arg(long)]
    reset_db: bool,

    /// Force the simulated sensor/actuator/BLE backends regardless of
    /// SIMULATION_MODE.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("mushpi=info".parse().unwrap()))
        .json()
        .init();

    let args = CliArgs::parse();
    let mut cfg = MushPiConfig::from_env();
    if let Some(data_dir) = args.data_dir {
        cfg.db_path = data_dir;
    }
    if args.simulate {
        cfg.simulation_mode = true;
    }

    if args.reset_db {
        if let Err(e) = std::fs::remove_dir_all(&cfg.db_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(error = %e, path = %cfg.db_path, "failed to reset store directory");
                std::process::exit(exit_code::STORE_UNAVAILABLE);
            }
        }
    }

    config::init(cfg.clone());

    let (supervisor, commands_rx) = match Supervisor::boot(cfg).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "boot failed");
            let code = if e.to_string().contains("relay init failed") {
                exit_code::RELAY_INIT_FAILED
            } else if e.to_string().contains("migration") {
                exit_code::MIGRATION_FAILURE
            } else {
                exit_code::STORE_UNAVAILABLE
            };
            std::process::exit(code);
        }
    };
    let supervisor = std::sync::Arc::new(supervisor);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    });

    // `run` watches `cancel` itself and performs the drain/relays-off
    // shutdown sequence before returning, so we always await it to
    // completion rather than racing it against the signal future.
    match supervisor.run(commands_rx, cancel).await {
        Ok(()) => std::process::exit(exit_code::CLEAN),
        Err(e) => {
            tracing::error!(error = %e, "supervisor exited with an error");
            std::process::exit(exit_code::UNHANDLED_FATAL);
        }
    }
}
