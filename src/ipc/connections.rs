// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Connection slots for the daemon socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { max_connections: 64 }
    }
}

/// Counts open client connections against a fixed limit.
#[derive(Debug)]
pub struct ConnectionPool {
    active: AtomicUsize,
    config: ConnectionConfig,
}

impl ConnectionPool {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self { active: AtomicUsize::new(0), config })
    }

    /// Claim a slot for one connection. The slot is held until the guard
    /// drops, which may be on another task.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.config.max_connections {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(ConnectionGuard { pool: Arc::clone(self) }),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }
}

/// Returns its slot to the pool on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    pool: Arc<ConnectionPool>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
    }
}
