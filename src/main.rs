// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! accel-rmd entry point.
//!
//! - `accel-rmd` or `accel-rmd serve` - run the daemon (default)
//! - `accel-rmd status` - query a running daemon's health
//! - `accel-rmd config show|validate` - inspect configuration

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use accel_rm::cli::{config_cmd, run_status};
use accel_rm::config::{self, EnvConfig};
use accel_rm::ipc::server;
use accel_rm::shutdown::ShutdownResult;
use accel_rm::telemetry::init_logging;
use accel_rm::{ManifestProgrammer, Runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" | "--config" => {
            let config = match load_config(&args) {
                Ok(c) => c,
                Err(code) => return code,
            };
            match serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Server error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "status" => {
            let config = match load_config(&args) {
                Ok(c) => c,
                Err(code) => return code,
            };
            let json = has_flag(&args, "--json");
            let code = run_status(&config.socket_path, config.ipc_server.max_frame_size, json).await;
            ExitCode::from(code as u8)
        }
        "config" => {
            let config = match load_config(&args) {
                Ok(c) => c,
                Err(code) => return code,
            };
            match args.get(2).map(|s| s.as_str()).unwrap_or("show") {
                "show" => ExitCode::from(config_cmd::run_show(&config, has_flag(&args, "--json")) as u8),
                "validate" => ExitCode::from(config_cmd::run_validate(&config) as u8),
                other => {
                    eprintln!("Unknown config subcommand: {}", other);
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("accel-rmd {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().skip(1).any(|a| a == flag)
}

/// Environment config, or a TOML file named by `--config FILE` with the
/// environment layered on top.
fn load_config(args: &[String]) -> Result<EnvConfig, ExitCode> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return Ok(config::load());
    };
    let Some(path) = args.get(pos + 1) else {
        eprintln!("Missing value for --config");
        return Err(ExitCode::from(2u8));
    };
    config::load_file(&PathBuf::from(path)).map_err(|e| {
        eprintln!("Configuration error: {}", e);
        ExitCode::from(2u8)
    })
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "accel-rmd - accelerator compute unit resource manager v{}

USAGE:
    accel-rmd [COMMAND] [OPTIONS]

COMMANDS:
    serve            Run the daemon (default when no command given)
    status           Show a running daemon's health
    config show      Print effective configuration
    config validate  Check boot devices and images
    version          Show version information
    help             Show this help message

OPTIONS:
    --config FILE  Load settings from a TOML file (env vars still win)
    --json         JSON output for status and config show

ENVIRONMENT:
    ACCEL_RM_SOCKET     Socket path (default: /tmp/accel-rm.sock)
    ACCEL_RM_LOG_LEVEL  Log filter (default: info)
    ACCEL_RM_LOG_FORMAT json or pretty (default: json)
    See `accel-rmd config show` for every setting.

EXIT CODES:
    0  Success / Healthy
    1  Failure / Unhealthy
    2  Configuration error
    3  Connection error
",
        version
    );
}

async fn serve(config: EnvConfig) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&config.log)?;

    let runtime = Runtime::new(config, Arc::new(ManifestProgrammer));
    let summary = runtime.boot()?;
    tracing::info!(
        devices = ?summary.devices_enabled,
        images = summary.images_loaded.len(),
        "devices ready"
    );

    let socket_path = runtime.config.socket_path.clone();
    let listener = server::bind(&socket_path)?;
    let server_handle = tokio::spawn(server::run_server(
        listener,
        Arc::clone(&runtime.ipc_handler),
        Arc::clone(&runtime.connections),
        Arc::clone(&runtime.shutdown),
        runtime.config.ipc_server.clone(),
    ));

    wait_for_signal().await?;
    tracing::info!("shutdown signal received");

    // New work is refused first, then in-flight requests drain.
    runtime.manager.shutdown();
    match runtime.shutdown.initiate(runtime.config.shutdown_timeout).await {
        ShutdownResult::Complete => tracing::info!("shutdown complete"),
        ShutdownResult::Timeout { remaining } => {
            tracing::warn!(remaining, "shutdown timed out with requests in flight");
        }
    }

    server_handle.await??;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(error = %e, "socket file not removed");
    }
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
