// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Message schema for the daemon socket.
//!
//! Requests and responses are JSON objects tagged by `type`. Payloads reuse
//! the V1/V2 shapes from [`crate::request`], so a frame carries exactly what
//! the in-process call surface takes.
//!
//! # Limits
//! - Decoding checks the size before parsing.
//! - An oversized response is replaced by an error response.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator::CuResource;
use crate::health::HealthReport;
use crate::inventory::CuInfo;
use crate::load::Load;
use crate::manager::CloseSummary;
use crate::pool::PoolReservationInfo;
use crate::request::{
    AllocationQueryInfo, CuGroupProperty, CuListProperty, CuListPropertyV2, CuPoolProperty,
    CuPoolPropertyV2, CuProperty, CuPropertyV2, CuStat, ReservationQueryInfo,
    UdfCuGroupProperty, UdfCuGroupPropertyV2,
};
use crate::types::DeviceId;

/// Code carried by error responses that never reached the manager.
pub const PROTOCOL_ERROR_CODE: i32 = -1;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("No session on this connection; send a handshake first")]
    NoSession,

    #[error("Session already open on this connection")]
    SessionAlreadyOpen,
}

/// Client-to-daemon messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Handshake { api_version: u32 },
    Close,
    IsRunning,
    Health,

    EnableDevice { device_id: DeviceId },
    DisableDevice { device_id: DeviceId },
    LoadImage {
        #[serde(default)]
        device_id: Option<DeviceId>,
        path: PathBuf,
    },
    UnloadImage { device_id: DeviceId },

    CuAlloc { prop: CuProperty },
    CuAllocV2 { prop: CuPropertyV2 },
    CuAllocFromDev { device_id: DeviceId, prop: CuProperty },
    CuAllocFromDevV2 { device_id: DeviceId, prop: CuPropertyV2 },
    CuAllocWithLoad { prop: CuProperty, image: PathBuf },
    CuRelease { resource: CuResource },
    CuListAlloc { prop: CuListProperty },
    CuListAllocV2 { prop: CuListPropertyV2 },
    CuListRelease { resources: Vec<CuResource> },
    CuGroupAlloc { prop: CuGroupProperty },
    CuGroupRelease { resources: Vec<CuResource> },
    LoadAndAllocAll { image: PathBuf },

    CuBlockingAlloc { prop: CuProperty, interval_us: u64 },
    CuBlockingAllocV2 { prop: CuPropertyV2, interval_us: u64 },
    CuListBlockingAlloc { prop: CuListProperty, interval_us: u64 },
    CuListBlockingAllocV2 { prop: CuListPropertyV2, interval_us: u64 },
    CuGroupBlockingAlloc { prop: CuGroupProperty, interval_us: u64 },

    UdfCuGroupDeclare { name: String, prop: UdfCuGroupProperty },
    UdfCuGroupDeclareV2 { name: String, prop: UdfCuGroupPropertyV2 },
    UdfCuGroupUndeclare { name: String },

    CheckCuAvailableNum { prop: CuProperty },
    CheckCuAvailableNumV2 { prop: CuPropertyV2 },
    CheckCuListAvailableNum { prop: CuListProperty },
    CheckCuListAvailableNumV2 { prop: CuListPropertyV2 },
    CheckCuGroupAvailableNum { prop: CuGroupProperty },
    CheckCuPoolAvailableNum { prop: CuPoolProperty },
    CheckCuPoolAvailableNumV2 { prop: CuPoolPropertyV2 },

    CuPoolReserve { prop: CuPoolProperty },
    CuPoolReserveV2 { prop: CuPoolPropertyV2 },
    CuPoolRelinquish { pool_id: u64 },
    ReservationQuery { info: ReservationQueryInfo },

    AllocationQuery { info: AllocationQueryInfo },
    CuCheckStatus { resource: CuResource },
    CuGetMaxCapacity { prop: CuProperty },

    ExecPlugin { plugin: String, func_id: u32, input: Vec<u8> },
}

impl Request {
    /// Requests answered without an open session.
    pub fn is_sessionless(&self) -> bool {
        matches!(self, Self::Handshake { .. } | Self::IsRunning | Self::Health)
    }
}

/// Daemon-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    HandshakeAck { client_id: u64 },
    Closed(CloseSummary),
    Running { running: bool },
    Health(HealthReport),
    Done,
    Device { device_id: DeviceId },
    Resource { resource: CuResource },
    Resources { resources: Vec<CuResource> },
    Count { count: u32 },
    PoolReserved {
        pool_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<PoolReservationInfo>,
    },
    ComputeUnits { cus: Vec<CuInfo> },
    Status { stat: CuStat },
    Capacity { load: Load },
    PluginOutput { output: Vec<u8> },
    Error { code: i32, message: String },
}

impl Response {
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::Error { code, message: message.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Encode a request to JSON bytes.
pub fn encode_request(request: &Request, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(request)?;
    if bytes.len() > max {
        return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max });
    }
    Ok(bytes)
}

/// Decode a request, checking the size before parsing.
pub fn decode_request(bytes: &[u8], max: usize) -> Result<Request, ProtocolError> {
    if bytes.len() > max {
        return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max });
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a response. Oversized responses become an error response.
pub fn encode_response(response: &Response, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(response)?;
    if bytes.len() > max {
        let error = Response::error(
            PROTOCOL_ERROR_CODE,
            format!("Response too large: {} bytes (max {})", bytes.len(), max),
        );
        return Ok(serde_json::to_vec(&error)?);
    }
    Ok(bytes)
}

pub fn decode_response(bytes: &[u8], max: usize) -> Result<Response, ProtocolError> {
    if bytes.len() > max {
        return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max });
    }
    Ok(serde_json::from_slice(bytes)?)
}
