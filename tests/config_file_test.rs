// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! TOML configuration files.

use std::io::Write;
use std::path::PathBuf;

use accel_rm::config::{self, ConfigError};
use accel_rm::telemetry::LogFormat;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn file_values_replace_defaults() {
    let file = write_config(
        r#"
socket_path = "/run/accel-rm/daemon.sock"
log_level = "accel_rm=debug"
log_format = "pretty"
max_connections = 16
shutdown_timeout_secs = 5
boot_devices = [0, 1, 2]

[[boot_images]]
device = 1
path = "/opt/images/codec.json"

[[boot_images]]
path = "/opt/images/scaler.json"

[limits]
max_channels_per_cu = 8
max_devices = 4
"#,
    );
    let cfg = config::load_file(file.path()).unwrap();
    assert_eq!(cfg.socket_path, PathBuf::from("/run/accel-rm/daemon.sock"));
    assert_eq!(cfg.log.level, "accel_rm=debug");
    assert_eq!(cfg.log.format, LogFormat::Pretty);
    assert_eq!(cfg.connections.max_connections, 16);
    assert_eq!(cfg.shutdown_timeout.as_secs(), 5);
    assert_eq!(cfg.boot.devices, vec![0, 1, 2]);
    assert_eq!(cfg.boot.images.len(), 2);
    assert_eq!(cfg.boot.images[0].device, Some(1));
    assert_eq!(cfg.boot.images[1].device, None);
    assert_eq!(cfg.limits.max_channels_per_cu, 8);
    assert_eq!(cfg.limits.max_devices, 4);
    // Unset limit keys keep their defaults.
    assert_eq!(cfg.limits.max_list_cus, 64);
}

#[test]
fn empty_file_gives_defaults() {
    let file = write_config("");
    let cfg = config::load_file(file.path()).unwrap();
    assert_eq!(cfg.connections.max_connections, 64);
    assert_eq!(cfg.boot.devices, vec![0]);
}

#[test]
fn file_values_get_floors() {
    let file = write_config("ipc_frame_limit = 10\nmax_connections = 0\n");
    let cfg = config::load_file(file.path()).unwrap();
    assert_eq!(cfg.ipc_server.max_frame_size, 4096);
    assert_eq!(cfg.connections.max_connections, 1);
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_config("max_conections = 3\n");
    let err = config::load_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn missing_file_is_io_error() {
    let err = config::load_file(&PathBuf::from("/nonexistent/accel-rm.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
