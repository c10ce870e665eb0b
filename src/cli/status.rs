// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! `status` subcommand: fetch the health report from a running daemon.

use std::path::Path;

use super::client::DaemonClient;
use crate::health::{HealthReport, HealthState};
use crate::ipc::{Request, Response};

/// Print daemon health. Returns the process exit code:
/// 0 healthy or degraded, 1 unhealthy, 3 connection error.
pub async fn run_status(socket: &Path, max_frame_size: usize, json: bool) -> i32 {
    let mut client = match DaemonClient::connect(socket, max_frame_size).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 3;
        }
    };
    let report = match client.call(&Request::Health).await {
        Ok(Response::Health(report)) => report,
        Ok(other) => {
            eprintln!("Unexpected response: {:?}", other);
            return 1;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 3;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        print_report(&report);
    }

    match report.state {
        HealthState::Unhealthy => 1,
        HealthState::Healthy | HealthState::Degraded => 0,
    }
}

fn print_report(report: &HealthReport) {
    println!("state:           {:?}", report.state);
    println!("accepting:       {}", report.accepting_requests);
    println!("devices enabled: {}", report.devices_enabled);
    println!("devices loaded:  {}", report.devices_loaded);
    println!("compute units:   {}", report.compute_units);
    println!("live leases:     {} ({} channels)", report.live_leases, report.live_channels);
    println!("pools:           {}", report.pools);
    println!("groups:          {}", report.groups);
    println!("sessions:        {}", report.sessions);
    println!("uptime:          {}s", report.uptime_secs);
}
