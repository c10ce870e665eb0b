// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Resource manager error types.
//!
//! All errors are fail-closed: a failed mutating call leaves the inventory
//! exactly as it found it.

use thiserror::Error;

/// Errors surfaced by every resource manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid load encoding: {0:#010x}")]
    InvalidLoadEncoding(i32),

    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capacity exceeded: requested {requested} units, {available} available")]
    CapacityExceeded { requested: u32, available: u32 },

    #[error("Exclusivity conflict on device {0}")]
    ExclusivityConflict(u32),

    #[error("Device {0} not found")]
    DeviceNotFound(u32),

    #[error("Device {0} is busy")]
    DeviceBusy(u32),

    #[error("Device {0} is not enabled or has no image loaded")]
    DeviceNotReady(u32),

    #[error("Partial allocation failure: placed {placed} of {requested} ({cause})")]
    PartialAllocationFailure {
        placed: usize,
        requested: usize,
        cause: Box<ResourceError>,
    },

    #[error("Stale descriptor: {0}")]
    StaleDescriptor(String),

    #[error("Pool {pool_id} still has {leases} live lease(s)")]
    PoolInUse { pool_id: u64, leases: usize },

    #[error("Image load failed: {0}")]
    ImageLoad(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Blocking allocation cancelled")]
    Cancelled,

    #[error("Resource manager is shutting down")]
    ShuttingDown,

    #[error("Session {0} is closed")]
    SessionClosed(u64),
}

impl ResourceError {
    /// Stable negative code for integer-returning call surfaces.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -2,
            Self::InvalidLoadEncoding(_) => -3,
            Self::InvalidConstraint(_) => -4,
            Self::NotFound(_) => -5,
            Self::CapacityExceeded { .. } => -6,
            Self::ExclusivityConflict(_) => -7,
            Self::DeviceNotFound(_) => -8,
            Self::DeviceBusy(_) => -9,
            Self::DeviceNotReady(_) => -10,
            Self::PartialAllocationFailure { .. } => -11,
            Self::StaleDescriptor(_) => -12,
            Self::PoolInUse { .. } => -13,
            Self::ImageLoad(_) => -14,
            Self::Plugin(_) => -15,
            Self::Cancelled => -16,
            Self::ShuttingDown => -17,
            Self::SessionClosed(_) => -18,
        }
    }

    /// Returns true when the request was well formed but the inventory
    /// could not satisfy it right now. Only these failures are retried by
    /// the blocking driver.
    pub fn is_insufficient_resources(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::CapacityExceeded { .. } => true,
            Self::PartialAllocationFailure { cause, .. } => cause.is_insufficient_resources(),
            _ => false,
        }
    }

    /// Returns true if this error should be logged as a warning rather
    /// than an error.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::ExclusivityConflict(_)
                | Self::PartialAllocationFailure { .. }
                | Self::PoolInUse { .. }
                | Self::DeviceBusy(_)
                | Self::NotFound(_)
        )
    }

    /// Pick the more informative of two placement failures. Capacity beats
    /// exclusivity, which beats a plain miss.
    pub(crate) fn prefer(self, other: ResourceError) -> ResourceError {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::CapacityExceeded { .. } => 3,
            Self::ExclusivityConflict(_) => 2,
            Self::NotFound(_) => 0,
            _ => 1,
        }
    }
}

/// Result alias used throughout the crate.
pub type ResourceResult<T> = Result<T, ResourceError>;
