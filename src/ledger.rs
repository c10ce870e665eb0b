// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Lease ledger: which channels each allocation service id holds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelRef, ClientId, PoolId, ServiceId};

/// Which call produced a lease. Releases do not check it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    Cu,
    CuList,
    CuGroup,
}

/// One live allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub service_id: ServiceId,
    pub client_id: ClientId,
    pub pool_id: PoolId,
    pub kind: LeaseKind,
    pub group_name: Option<String>,
    /// Never empty, in request order.
    pub channels: Vec<ChannelRef>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LeaseLedger {
    leases: BTreeMap<ServiceId, Lease>,
    next_service_id: u64,
}

impl Default for LeaseLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseLedger {
    pub fn new() -> Self {
        Self { leases: BTreeMap::new(), next_service_id: 1 }
    }

    /// Hand out a fresh service id. Ids are never reused, even when the
    /// allocation that drew one fails.
    pub fn next_service_id(&mut self) -> ServiceId {
        let id = ServiceId(self.next_service_id);
        self.next_service_id += 1;
        id
    }

    pub fn record(&mut self, lease: Lease) {
        self.leases.insert(lease.service_id, lease);
    }

    pub fn get(&self, service_id: ServiceId) -> Option<&Lease> {
        self.leases.get(&service_id)
    }

    pub fn remove(&mut self, service_id: ServiceId) -> Option<Lease> {
        self.leases.remove(&service_id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn count_in_pool(&self, pool_id: PoolId) -> usize {
        self.leases.values().filter(|l| l.pool_id == pool_id).count()
    }

    pub fn leases_of(&self, client_id: ClientId) -> Vec<ServiceId> {
        self.leases
            .values()
            .filter(|l| l.client_id == client_id)
            .map(|l| l.service_id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }
}
