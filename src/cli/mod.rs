// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Subcommands of `accel-rmd` other than `serve`.
//!
//! ```bash
//! accel-rmd config show    # Print effective configuration
//! accel-rmd status         # Query a running daemon's health
//! ```

pub mod client;
pub mod config_cmd;
pub mod status;

pub use client::{CliError, DaemonClient};
pub use status::run_status;
