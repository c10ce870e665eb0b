// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Health reporting for the daemon and its supervisors.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    /// Accepting requests but nothing can be allocated.
    Degraded,
    Unhealthy,
}

/// Raw counts sampled from the manager under one read lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSample {
    pub accepting: bool,
    pub devices_enabled: usize,
    pub devices_loaded: usize,
    pub compute_units: usize,
    pub live_leases: usize,
    pub live_channels: usize,
    pub pools: usize,
    pub groups: usize,
    pub sessions: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub accepting_requests: bool,
    pub devices_enabled: usize,
    pub devices_loaded: usize,
    pub compute_units: usize,
    pub live_leases: usize,
    pub live_channels: usize,
    pub pools: usize,
    pub groups: usize,
    pub sessions: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Report `Degraded` until at least one device has an image.
    pub require_loaded_device: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { require_loaded_device: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthChecker {
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn report(&self, sample: HealthSample) -> HealthReport {
        HealthReport {
            state: self.compute_state(&sample),
            accepting_requests: sample.accepting,
            devices_enabled: sample.devices_enabled,
            devices_loaded: sample.devices_loaded,
            compute_units: sample.compute_units,
            live_leases: sample.live_leases,
            live_channels: sample.live_channels,
            pools: sample.pools,
            groups: sample.groups,
            sessions: sample.sessions,
            uptime_secs: sample.uptime_secs,
        }
    }

    fn compute_state(&self, sample: &HealthSample) -> HealthState {
        if !sample.accepting {
            return HealthState::Unhealthy;
        }
        if self.config.require_loaded_device && sample.devices_loaded == 0 {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}
