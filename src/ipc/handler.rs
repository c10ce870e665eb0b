// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Per-connection request dispatch.
//!
//! A connection opens at most one [`Session`] with a handshake. Every later
//! request runs against that session, and the session closes (releasing its
//! leases) when the connection ends.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    decode_request, encode_response, ProtocolError, Request, Response, PROTOCOL_ERROR_CODE,
};
use crate::error::{ResourceError, ResourceResult};
use crate::manager::{ResourceManager, Session};
use crate::types::PoolId;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct IpcHandlerConfig {
    /// Largest request or response body.
    pub max_message_size: usize,
}

impl Default for IpcHandlerConfig {
    fn default() -> Self {
        Self { max_message_size: 1024 * 1024 }
    }
}

/// State owned by one client connection.
#[derive(Debug)]
pub struct ConnectionState {
    session: Option<Session>,
    cancel: CancellationToken,
}

impl ConnectionState {
    /// `cancel` aborts blocking allocations issued on this connection.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { session: None, cancel }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns request frames into response frames for one manager.
#[derive(Debug)]
pub struct IpcHandler {
    manager: Arc<ResourceManager>,
    config: IpcHandlerConfig,
}

impl IpcHandler {
    pub fn new(manager: Arc<ResourceManager>, config: IpcHandlerConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    /// Process one request frame and return the response frame.
    ///
    /// Malformed requests get an error response; only a response that
    /// cannot be encoded fails the call.
    pub async fn process(
        &self,
        conn: &mut ConnectionState,
        bytes: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let response = match decode_request(bytes, self.config.max_message_size) {
            Ok(request) => self.handle(conn, request).await,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting malformed request");
                Response::error(PROTOCOL_ERROR_CODE, e.to_string())
            }
        };
        Ok(encode_response(&response, self.config.max_message_size)?)
    }

    /// Dispatch a decoded request.
    pub async fn handle(&self, conn: &mut ConnectionState, request: Request) -> Response {
        match request {
            Request::Handshake { api_version } => {
                if conn.session.is_some() {
                    return protocol_error(ProtocolError::SessionAlreadyOpen);
                }
                match self.manager.create_session(api_version) {
                    Ok(session) => {
                        let client_id = session.client_id().0;
                        conn.session = Some(session);
                        Response::HandshakeAck { client_id }
                    }
                    Err(e) => resource_error(e),
                }
            }
            Request::IsRunning => Response::Running { running: self.manager.is_running() },
            Request::Health => Response::Health(self.manager.health_report()),
            Request::Close => match conn.session.take() {
                Some(session) => respond(session.close().map(Response::Closed)),
                None => protocol_error(ProtocolError::NoSession),
            },
            request => match conn.session.as_ref() {
                Some(session) => respond(dispatch(session, request, &conn.cancel).await),
                None => protocol_error(ProtocolError::NoSession),
            },
        }
    }
}

fn respond(result: ResourceResult<Response>) -> Response {
    result.unwrap_or_else(resource_error)
}

fn resource_error(e: ResourceError) -> Response {
    Response::error(e.code(), e.to_string())
}

fn protocol_error(e: ProtocolError) -> Response {
    Response::error(PROTOCOL_ERROR_CODE, e.to_string())
}

async fn dispatch(
    session: &Session,
    request: Request,
    cancel: &CancellationToken,
) -> ResourceResult<Response> {
    let resource = |resource| Response::Resource { resource };
    let resources = |resources| Response::Resources { resources };
    let count = |count| Response::Count { count };

    Ok(match request {
        Request::EnableDevice { device_id } => {
            session.enable_device(device_id)?;
            Response::Done
        }
        Request::DisableDevice { device_id } => {
            session.disable_device(device_id)?;
            Response::Done
        }
        Request::LoadImage { device_id, path } => {
            Response::Device { device_id: session.load_image(device_id, &path)? }
        }
        Request::UnloadImage { device_id } => {
            session.unload_image(device_id)?;
            Response::Done
        }

        Request::CuAlloc { prop } => resource(session.cu_alloc(&prop)?),
        Request::CuAllocV2 { prop } => resource(session.cu_alloc_v2(&prop)?),
        Request::CuAllocFromDev { device_id, prop } => {
            resource(session.cu_alloc_from_dev(device_id, &prop)?)
        }
        Request::CuAllocFromDevV2 { device_id, prop } => {
            resource(session.cu_alloc_from_dev_v2(device_id, &prop)?)
        }
        Request::CuAllocWithLoad { prop, image } => {
            resource(session.cu_alloc_with_load(&prop, &image)?)
        }
        Request::CuRelease { resource } => {
            session.cu_release(&resource)?;
            Response::Done
        }
        Request::CuListAlloc { prop } => resources(session.cu_list_alloc(&prop)?),
        Request::CuListAllocV2 { prop } => resources(session.cu_list_alloc_v2(&prop)?),
        Request::CuListRelease { resources } => {
            session.cu_list_release(&resources)?;
            Response::Done
        }
        Request::CuGroupAlloc { prop } => resources(session.cu_group_alloc(&prop)?),
        Request::CuGroupRelease { resources } => {
            session.cu_group_release(&resources)?;
            Response::Done
        }
        Request::LoadAndAllocAll { image } => resources(session.load_and_alloc_all(&image)?),

        Request::CuBlockingAlloc { prop, interval_us } => {
            resource(session.cu_blocking_alloc(&prop, interval_us, cancel).await?)
        }
        Request::CuBlockingAllocV2 { prop, interval_us } => {
            resource(session.cu_blocking_alloc_v2(&prop, interval_us, cancel).await?)
        }
        Request::CuListBlockingAlloc { prop, interval_us } => {
            resources(session.cu_list_blocking_alloc(&prop, interval_us, cancel).await?)
        }
        Request::CuListBlockingAllocV2 { prop, interval_us } => {
            resources(session.cu_list_blocking_alloc_v2(&prop, interval_us, cancel).await?)
        }
        Request::CuGroupBlockingAlloc { prop, interval_us } => {
            resources(session.cu_group_blocking_alloc(&prop, interval_us, cancel).await?)
        }

        Request::UdfCuGroupDeclare { name, prop } => {
            session.udf_cu_group_declare(&name, &prop)?;
            Response::Done
        }
        Request::UdfCuGroupDeclareV2 { name, prop } => {
            session.udf_cu_group_declare_v2(&name, &prop)?;
            Response::Done
        }
        Request::UdfCuGroupUndeclare { name } => {
            session.udf_cu_group_undeclare(&name)?;
            Response::Done
        }

        Request::CheckCuAvailableNum { prop } => count(session.check_cu_available_num(&prop)?),
        Request::CheckCuAvailableNumV2 { prop } => {
            count(session.check_cu_available_num_v2(&prop)?)
        }
        Request::CheckCuListAvailableNum { prop } => {
            count(session.check_cu_list_available_num(&prop)?)
        }
        Request::CheckCuListAvailableNumV2 { prop } => {
            count(session.check_cu_list_available_num_v2(&prop)?)
        }
        Request::CheckCuGroupAvailableNum { prop } => {
            count(session.check_cu_group_available_num(&prop)?)
        }
        Request::CheckCuPoolAvailableNum { prop } => {
            count(session.check_cu_pool_available_num(&prop)?)
        }
        Request::CheckCuPoolAvailableNumV2 { prop } => {
            count(session.check_cu_pool_available_num_v2(&prop)?)
        }

        Request::CuPoolReserve { prop } => {
            let pool_id = session.cu_pool_reserve(&prop)?;
            Response::PoolReserved { pool_id: pool_id.0, info: None }
        }
        Request::CuPoolReserveV2 { prop } => {
            let (pool_id, info) = session.cu_pool_reserve_v2(&prop)?;
            Response::PoolReserved { pool_id: pool_id.0, info: Some(info) }
        }
        Request::CuPoolRelinquish { pool_id } => {
            session.cu_pool_relinquish(PoolId(pool_id))?;
            Response::Done
        }
        Request::ReservationQuery { info } => {
            Response::ComputeUnits { cus: session.reservation_query(&info)? }
        }

        Request::AllocationQuery { info } => resources(session.allocation_query(&info)?),
        Request::CuCheckStatus { resource } => {
            Response::Status { stat: session.cu_check_status(&resource)? }
        }
        Request::CuGetMaxCapacity { prop } => {
            Response::Capacity { load: session.cu_get_max_capacity(&prop)? }
        }

        Request::ExecPlugin { plugin, func_id, input } => {
            Response::PluginOutput { output: session.exec_plugin(&plugin, func_id, &input)? }
        }

        Request::Handshake { .. } | Request::Close | Request::IsRunning | Request::Health => {
            return Err(ResourceError::InvalidArgument(
                "connection request routed to a session".to_string(),
            ))
        }
    })
}
