// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Counters and gauges published through the `metrics` facade.
//!
//! Without an installed recorder every call here is a no-op.

use metrics::{counter, gauge};

pub fn record_allocation_granted(op: &'static str, channels: usize) {
    counter!("accel_rm_allocations_granted_total", "op" => op).increment(1);
    counter!("accel_rm_channels_granted_total", "op" => op).increment(channels as u64);
}

pub fn record_allocation_failure(op: &'static str, code: i32) {
    counter!("accel_rm_allocations_failed_total", "op" => op, "code" => code.to_string()).increment(1);
}

pub fn record_release(channels: usize) {
    counter!("accel_rm_releases_total").increment(1);
    counter!("accel_rm_channels_released_total").increment(channels as u64);
}

pub fn record_pool_reserved() {
    counter!("accel_rm_pools_reserved_total").increment(1);
}

pub fn record_pool_relinquished() {
    counter!("accel_rm_pools_relinquished_total").increment(1);
}

pub fn record_blocking_retry(op: &'static str) {
    counter!("accel_rm_blocking_retries_total", "op" => op).increment(1);
}

pub fn record_live_leases(count: usize) {
    gauge!("accel_rm_live_leases").set(count as f64);
}
