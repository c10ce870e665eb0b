// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Config subcommands: show, validate.
//!
//! These read configuration directly, without a running daemon.

use crate::config::{EffectiveConfig, EnvConfig};

/// Print the effective config as `KEY=value` lines, or as JSON.
pub fn run_show(cfg: &EnvConfig, json: bool) -> i32 {
    let eff = cfg.effective_config();
    if json {
        match serde_json::to_string_pretty(&eff) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        for line in render(&eff) {
            println!("{}", line);
        }
    }
    0
}

/// Check for settings that would make boot fail.
///
/// Returns 0 if valid, 1 if any warnings are found.
pub fn run_validate(cfg: &EnvConfig) -> i32 {
    let warnings = validate(cfg);
    for w in &warnings {
        eprintln!("WARNING: {}", w);
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn validate(cfg: &EnvConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let max_devices = cfg.limits.max_devices;

    for &id in &cfg.boot.devices {
        if id >= max_devices {
            warnings.push(format!("boot device {} is outside 0..{}", id, max_devices));
        }
    }
    for image in &cfg.boot.images {
        if let Some(id) = image.device {
            if !cfg.boot.devices.contains(&id) {
                warnings.push(format!("boot image {} targets a device that is not enabled", image));
            }
        }
        if !image.path.exists() {
            warnings.push(format!("boot image {} does not exist", image.path.display()));
        }
    }
    if cfg.boot.images.len() > cfg.boot.devices.len() {
        warnings.push(format!(
            "{} boot images for {} boot devices",
            cfg.boot.images.len(),
            cfg.boot.devices.len()
        ));
    }
    warnings
}

fn render(cfg: &EffectiveConfig) -> Vec<String> {
    let join = |items: Vec<String>| items.join(",");
    vec![
        format!("ACCEL_RM_SOCKET={}", cfg.socket_path),
        format!("ACCEL_RM_LOG_LEVEL={}", cfg.log_level),
        format!("ACCEL_RM_LOG_FORMAT={}", format!("{:?}", cfg.log_format).to_lowercase()),
        format!("ACCEL_RM_LOG_FILE={}", cfg.log_file.as_deref().unwrap_or("")),
        format!("ACCEL_RM_MAX_CONNECTIONS={}", cfg.max_connections),
        format!("ACCEL_RM_IPC_FRAME_LIMIT={}", cfg.ipc_frame_limit),
        format!("ACCEL_RM_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs),
        format!(
            "ACCEL_RM_BOOT_DEVICES={}",
            join(cfg.boot_devices.iter().map(ToString::to_string).collect())
        ),
        format!("ACCEL_RM_BOOT_IMAGES={}", join(cfg.boot_images.clone())),
        format!("ACCEL_RM_MAX_LIST_CUS={}", cfg.limits.max_list_cus),
        format!("ACCEL_RM_MAX_GROUP_OPTIONS={}", cfg.limits.max_group_options),
        format!("ACCEL_RM_MAX_CHANNELS_PER_CU={}", cfg.limits.max_channels_per_cu),
        format!("ACCEL_RM_MAX_DEVICES={}", cfg.limits.max_devices),
        format!("ACCEL_RM_MAX_NAME_LEN={}", cfg.limits.max_name_len),
        format!("ACCEL_RM_MAX_PLUGIN_PARAM_LEN={}", cfg.limits.max_plugin_param_len),
        format!("ACCEL_RM_MAX_POOL_LISTS={}", cfg.limits.max_pool_lists),
    ]
}
