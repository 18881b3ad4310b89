//! Per-client connection task.
//!
//! One task per accepted socket: register, key exchange, then a read loop
//! that decodes frames and hands them to the router, with a sibling writer
//! task draining the outbound queue under the session cipher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::net::connection::{ClientConnection, Outbound};
use crate::net::handle::SocketId;
use crate::net::registry::ConnectionRegistry;
use crate::observability::metrics;
use crate::protocol::frame::FrameError;
use crate::protocol::handshake::server_handshake;
use crate::protocol::kex::HandshakeError;
use crate::routing::{Disposition, RequestRouter};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-client timing and queue sizes.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Zero disables the auth countdown.
    pub auth_timeout: Duration,
    pub handshake_timeout: Duration,
    pub out_queue: usize,
}

/// Serve one accepted socket until it closes.
pub async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    socket: SocketId,
    registry: ConnectionRegistry,
    router: Arc<RequestRouter>,
    settings: ClientSettings,
) {
    let (out_tx, out_rx) = mpsc::channel(settings.out_queue);
    let lease = match registry.occupy(socket, peer, out_tx) {
        Ok(lease) => lease,
        Err(e) => {
            metrics::record_connection_rejected();
            tracing::warn!(peer = %peer, socket = %socket, error = %e, "Connection rejected");
            return;
        }
    };
    metrics::record_connection_opened(registry.len());

    let conn = Arc::clone(lease.connection());
    let handle = conn.handle();
    conn.start_auth_countdown(settings.auth_timeout);
    tracing::info!(handle = %handle, peer = %peer, socket = %socket, "Client connected");

    match drive(stream, &conn, out_rx, &router, &settings).await {
        Ok(()) => {}
        Err(ClientError::Io(e)) => {
            tracing::debug!(handle = %handle, error = %e, "Client I/O error");
        }
        Err(e) => {
            tracing::warn!(handle = %handle, error = %e, "Client connection failed");
        }
    }

    conn.close();
    registry.erase(handle);
    router.client_offline(handle);
    drop(lease);

    metrics::record_connection_closed(registry.len());
    tracing::info!(handle = %handle, peer = %peer, "Client disconnected");
}

async fn drive(
    mut stream: TcpStream,
    conn: &Arc<ClientConnection>,
    out_rx: mpsc::Receiver<Outbound>,
    router: &RequestRouter,
    settings: &ClientSettings,
) -> Result<(), ClientError> {
    let secret = tokio::select! {
        result = server_handshake(&mut stream, settings.handshake_timeout) => result?,
        _ = conn.closed() => return Ok(()),
    };
    conn.install_cipher(&secret);
    tracing::debug!(handle = %conn.handle(), "Key exchange complete");

    let (mut reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(write_loop(writer, Arc::clone(conn), out_rx));

    let result = read_loop(&mut reader, conn, router).await;

    conn.close();
    let _ = writer_task.await;
    result
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    conn: &ClientConnection,
    router: &RequestRouter,
) -> Result<(), ClientError> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = conn.closed() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }

        for frame in conn.ingest(&buf[..n])? {
            metrics::record_frame("inbound");
            let disposition = tokio::select! {
                disposition = router.dispatch(conn, frame) => disposition,
                _ = conn.closed() => return Ok(()),
            };
            if disposition == Disposition::Close {
                return Ok(());
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    conn: Arc<ClientConnection>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(message) = next else { break };
                let bytes = match conn.encode(&message.name, &message.payload) {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        metrics::record_dropped("frame_too_large");
                        tracing::warn!(handle = %conn.handle(), name = %message.name, error = %e, "Outbound frame dropped");
                        continue;
                    }
                    None => break,
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!(handle = %conn.handle(), error = %e, "Client write failed");
                    conn.close();
                    break;
                }
                metrics::record_frame("outbound");
            }
            _ = conn.closed() => break,
        }
    }
    let _ = writer.shutdown().await;
}
