//! Socket driver: the one task that owns a connection's stream.
//!
//! Reads, writes and cancellation are multiplexed with `select!`. When the
//! loop exits for any reason the connection is disposed and close
//! detection runs exactly once.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::PeerConnection;
use crate::wire::{try_decode_frame, Frame, FrameFlag, WireError};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Receives what the driver reads off the socket.
pub(crate) trait FrameDispatcher: Send + Sync + 'static {
    /// A request frame arrived. Must not block.
    fn on_request(&self, connection: &Arc<PeerConnection>, frame: Frame);

    /// The driver exited; the connection is already disposed.
    fn on_closed(&self, connection: &Arc<PeerConnection>, exit: DriverExit);
}

/// Why a socket driver stopped.
#[derive(Debug)]
pub(crate) enum DriverExit {
    /// The connection was disposed locally.
    Disposed,
    /// The peer closed the socket.
    Eof,
    /// Reading or writing failed.
    Io(std::io::Error),
    /// The peer sent a malformed frame.
    Protocol(WireError),
}

impl fmt::Display for DriverExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverExit::Disposed => f.write_str("disposed locally"),
            DriverExit::Eof => f.write_str("closed by peer"),
            DriverExit::Io(err) => write!(f, "i/o error: {err}"),
            DriverExit::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

/// Run the socket until it closes, then hand the connection to close detection.
pub(crate) async fn drive_connection<S, D>(
    connection: Arc<PeerConnection>,
    stream: S,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    dispatcher: D,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: FrameDispatcher,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    let exit = loop {
        tokio::select! {
            _ = connection.disposed_token().cancelled() => {
                break DriverExit::Disposed;
            }

            Some(bytes) = outbound.recv() => {
                if let Err(err) = writer.write_all(&bytes).await {
                    break DriverExit::Io(err);
                }
            }

            read = reader.read_buf(&mut read_buffer) => {
                match read {
                    Ok(0) => break DriverExit::Eof,
                    Ok(_) => {
                        if let Err(err) = process_read_buffer(&connection, &mut read_buffer, &dispatcher) {
                            break DriverExit::Protocol(err);
                        }
                    }
                    Err(err) => break DriverExit::Io(err),
                }
            }
        }
    };

    connection.dispose();
    if matches!(exit, DriverExit::Disposed) {
        // Replies queued right before disposal (e.g. a rejected Open) still go out
        while let Ok(bytes) = outbound.try_recv() {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    drop(reader);
    drop(writer);

    tracing::debug!(connection_id = %connection.id(), reason = %exit, "socket driver exited");
    dispatcher.on_closed(&connection, exit);
}

/// Decode every complete frame in the buffer and route it.
fn process_read_buffer<D: FrameDispatcher>(
    connection: &Arc<PeerConnection>,
    read_buffer: &mut BytesMut,
    dispatcher: &D,
) -> Result<(), WireError> {
    while let Some(frame) = try_decode_frame(read_buffer)? {
        connection.notify_listeners("on_data_received", |l| l.on_data_received(&frame));
        match frame.flag {
            FrameFlag::Request => dispatcher.on_request(connection, frame),
            FrameFlag::Response | FrameFlag::Error => connection.complete_request(frame),
        }
    }
    Ok(())
}
