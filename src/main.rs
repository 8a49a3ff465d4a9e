// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! floodwatch — real-time urban flood monitoring backend
//!
//! Usage:
//!   floodwatch serve    --config config.toml
//!   floodwatch sessions --config config.toml [--camera cam1] [--limit 20]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use floodwatch::api::{self, AppState};
use floodwatch::config::Config;
use floodwatch::db::Db;
use floodwatch::yolo::DualModels;

#[derive(Parser)]
#[command(name = "floodwatch", about = "Urban flood monitoring backend", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring server.
    Serve {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print recent persisted sessions and exit.
    Sessions {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Filter by camera ID.
        #[arg(long)]
        camera: Option<String>,
        /// Maximum rows to print.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            run_serve(config).await;
        }
        Command::Sessions { config, camera, limit } => {
            run_sessions(config, camera.as_deref(), limit).await;
        }
    }
}

async fn run_serve(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        port = cfg.server.port,
        video_root = ?cfg.paths.video_root,
        record_root = ?cfg.paths.record_root,
        device = %cfg.models.device,
        db = cfg.db.enabled,
        "Starting floodwatch"
    );

    // Load both model weights up front; the first tick must not stall.
    let models_cfg = cfg.models.clone();
    let models = match tokio::task::spawn_blocking(move || DualModels::load(&models_cfg)).await {
        Ok(Ok(m)) => m,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to load model weights");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "Model loader task failed");
            std::process::exit(1);
        }
    };

    let db = if cfg.db.enabled {
        match Db::connect(&cfg.db.url).await {
            Ok(db) => {
                info!(url = %cfg.db.url, "Database connected");
                Some(db)
            }
            Err(e) => {
                error!(error = %e, "Failed to open database");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.paths.record_root) {
        error!(error = %e, "Cannot create record root");
        std::process::exit(1);
    }

    let port = cfg.server.port;
    let state = Arc::new(AppState { config: cfg, models: Arc::new(models), db });
    api::start_server(state, port).await;
}

async fn run_sessions(config_path: PathBuf, camera: Option<&str>, limit: i64) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };
    if !cfg.db.enabled {
        eprintln!("Database is disabled in {}", config_path.display());
        std::process::exit(1);
    }

    let db = match Db::connect(&cfg.db.url).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let sessions = match db.list_sessions(camera, limit).await {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if sessions.is_empty() {
        println!("No sessions recorded");
        return;
    }

    println!(
        "{:<6} {:<12} {:<8} {:<20} {:<20} {:<8}",
        "ID", "Camera", "Status", "Started", "Ended", "Type"
    );
    println!("{}", "-".repeat(80));
    for s in &sessions {
        let fmt = |t: &Option<chrono::NaiveDateTime>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default()
        };
        println!(
            "{:<6} {:<12} {:<8} {:<20} {:<20} {:<8}",
            s.id,
            s.camera_id,
            s.status,
            fmt(&s.started_at),
            fmt(&s.ended_at),
            s.source_type,
        );
    }
    println!("\nTotal: {} sessions", sessions.len());
}
