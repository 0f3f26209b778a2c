//! arenabridge — OpenAI-compatible API bridged through browser workers.

use std::path::PathBuf;
use std::sync::Arc;

use arenabridge_core::DataPaths;
use arenabridge_server::{build_router, resolve_data_dir, validate, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--validate" | "validate" => {
                let data_dir = if args.len() > 2 {
                    PathBuf::from(&args[2])
                } else {
                    resolve_data_dir()
                };
                let report = validate::validate(&data_dir);
                validate::print_report(&report);
                std::process::exit(if report.is_valid() { 0 } else { 1 });
            }
            "--help" | "-h" | "help" => {
                println!("arenabridge — OpenAI-compatible API over browser workers");
                println!();
                println!("Usage: arenabridge [command]");
                println!();
                println!("Commands:");
                println!("  (none)                   Start the server");
                println!("  validate [data-dir]      Check config.json, models.json and id_pool.json");
                println!("  help                     Show this help message");
                println!();
                println!("Environment:");
                println!("  ARENABRIDGE_DATA_DIR     Data directory (default: ../data or ./data)");
                println!("  ARENABRIDGE_API_KEY      Bearer key required on /v1/*");
                println!("  PORT                     Listening port (default: 5102)");
                println!("  RUST_LOG                 Log filter (default: info)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'arenabridge help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let paths = DataPaths::new(&data_dir)?;
    let state = Arc::new(AppState::new(paths)?);

    let port = {
        let config = state.config.read();
        if !config.config_path.exists() {
            // First run: leave an editable config behind.
            if let Err(e) = config.save() {
                warn!("Could not write default config: {}", e);
            }
        }
        if config.api_key.is_none() {
            warn!("No API key configured, /v1 is open to anyone who can reach this port");
        }
        config.port
    };

    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("arenabridge listening on {} (workers connect to ws://{}/ws)", addr, addr);

    axum::serve(listener, app).await?;

    Ok(())
}
