// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Local socket interface of the daemon.
//!
//! Clients talk to the manager over a Unix socket only. One connection maps
//! to one session.

mod connections;
mod handler;
mod protocol;
pub mod server;

pub use connections::{ConnectionConfig, ConnectionGuard, ConnectionPool};
pub use handler::{ConnectionState, HandlerError, IpcHandler, IpcHandlerConfig};
pub use protocol::{
    decode_request, decode_response, encode_request, encode_response, ProtocolError, Request,
    Response, PROTOCOL_ERROR_CODE,
};
pub use server::{read_frame, write_frame, FrameError, IpcServerConfig, ServerError};
