// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Unix socket accept loop with length-prefixed frames.
//!
//! Each frame is a little-endian `u32` byte count followed by that many
//! bytes of JSON. One connection handles its requests in order. Frames are
//! read ahead by a separate task, so a peer that hangs up is noticed while
//! one of its requests is still running.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connections::{ConnectionGuard, ConnectionPool};
use super::handler::{ConnectionState, IpcHandler};
use super::protocol::{encode_response, Response, PROTOCOL_ERROR_CODE};
use crate::error::ResourceError;
use crate::shutdown::ShutdownCoordinator;

/// Frames read ahead of dispatch per connection.
const READ_AHEAD: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcServerConfig {
    /// Largest frame body accepted or sent.
    pub max_frame_size: usize,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self { max_frame_size: 1024 * 1024 }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max {
        return Err(FrameError::TooLarge { size: len, max });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(data.len()).map_err(|_| FrameError::TooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Bind the daemon socket, replacing a stale socket file.
pub fn bind(path: &Path) -> Result<UnixListener, ServerError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| ServerError::Bind {
            path: path.display().to_string(),
            source,
        })?;
    }
    UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.display().to_string(),
        source,
    })
}

/// Accept connections until the coordinator starts draining.
pub async fn run_server(
    listener: UnixListener,
    handler: Arc<IpcHandler>,
    connections: Arc<ConnectionPool>,
    shutdown: Arc<ShutdownCoordinator>,
    config: IpcServerConfig,
) -> Result<(), ServerError> {
    let stop = shutdown.stop_token();
    tracing::info!(max_connections = connections.max_connections(), "IPC server listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted.map_err(ServerError::Accept)?,
        };

        let Some(slot) = connections.try_acquire() else {
            tracing::warn!(active = connections.active_count(), "connection limit reached");
            tokio::spawn(refuse(stream, config.max_frame_size));
            continue;
        };

        let handler = Arc::clone(&handler);
        let shutdown = Arc::clone(&shutdown);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler, shutdown, slot, config).await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }

    tracing::info!("IPC server stopped accepting");
    Ok(())
}

async fn refuse(mut stream: UnixStream, max: usize) {
    let response = Response::error(PROTOCOL_ERROR_CODE, "connection limit reached");
    if let Ok(bytes) = encode_response(&response, max) {
        let _ = write_frame(&mut stream, &bytes).await;
    }
}

async fn serve_connection(
    stream: UnixStream,
    handler: Arc<IpcHandler>,
    shutdown: Arc<ShutdownCoordinator>,
    _slot: ConnectionGuard,
    config: IpcServerConfig,
) -> Result<(), FrameError> {
    let stop = shutdown.stop_token();
    let cancel = stop.child_token();
    let (reader, mut writer) = stream.into_split();
    let (frames_tx, mut frames) = mpsc::channel(READ_AHEAD);
    tokio::spawn(read_frames(reader, frames_tx, cancel.clone(), config.max_frame_size));
    let mut conn = ConnectionState::new(cancel);

    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let Some(_in_flight) = shutdown.track() else {
            let e = ResourceError::ShuttingDown;
            let bytes = encode_response(&Response::error(e.code(), e.to_string()), config.max_frame_size)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write_frame(&mut writer, &bytes).await?;
            break;
        };

        let bytes = handler
            .process(&mut conn, &frame)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(&mut writer, &bytes).await?;
    }
    Ok(())
}

/// Forward frames from the peer until it hangs up, then cancel `cancel` so
/// a blocking allocation still in flight on this connection gives up.
async fn read_frames(
    mut reader: OwnedReadHalf,
    frames: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    max: usize,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut reader, max) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("peer closed connection");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping connection after bad frame");
                break;
            }
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framing_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello framing").await.unwrap();
        let received = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(received.as_deref(), Some(&b"hello framing"[..]));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&5000u32.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut server, 4096).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { size: 5000, max: 4096 }));
    }
}
