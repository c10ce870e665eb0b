// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Minimal socket client used by the CLI and by tests.

use std::path::Path;

use thiserror::Error;
use tokio::net::UnixStream;

use crate::ipc::{
    decode_response, encode_request, read_frame, write_frame, FrameError, ProtocolError, Request,
    Response,
};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Cannot connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Daemon closed the connection")]
    Closed,
}

/// One connection to a running daemon.
#[derive(Debug)]
pub struct DaemonClient {
    stream: UnixStream,
    max_frame_size: usize,
}

impl DaemonClient {
    pub async fn connect(path: &Path, max_frame_size: usize) -> Result<Self, CliError> {
        let stream = UnixStream::connect(path).await.map_err(|source| CliError::Connect {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { stream, max_frame_size })
    }

    /// Send one request without waiting for the response.
    pub async fn send(&mut self, request: &Request) -> Result<(), CliError> {
        let bytes = encode_request(request, self.max_frame_size)?;
        write_frame(&mut self.stream, &bytes).await?;
        Ok(())
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &Request) -> Result<Response, CliError> {
        self.send(request).await?;
        let frame = read_frame(&mut self.stream, self.max_frame_size)
            .await?
            .ok_or(CliError::Closed)?;
        Ok(decode_response(&frame, self.max_frame_size)?)
    }

    /// Open a session on this connection. Returns the client id.
    pub async fn handshake(&mut self, api_version: u32) -> Result<Response, CliError> {
        self.call(&Request::Handshake { api_version }).await
    }
}
