// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Telemetry for the resource manager.
//!
//! Structured logging through `tracing`, one span per manager operation,
//! and counters/gauges through the `metrics` facade. Nothing here opens a
//! network connection; exporters are up to the embedding process.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_allocation_failure, record_allocation_granted, record_blocking_retry, record_live_leases,
    record_pool_relinquished, record_pool_reserved, record_release,
};
pub use spans::{OperationSpan, SpanExt};
