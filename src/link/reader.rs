//! Reader loop, one per installed connection.
//!
//! Never reconnects. When the stream fails or misbehaves it shuts the socket
//! down and exits; the writer notices on its next write or heartbeat.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

use super::{heartbeat, Connection, Shared};
use crate::error::LinkError;
use crate::frame::{self, Frame};

/// Decode frames until the stream fails, returning why it stopped.
///
/// An oversized length ends the loop without reading further; the rest of
/// the stream cannot be trusted.
pub(crate) async fn read_loop<R, D, A>(mut reader: R, mut on_data: D, mut on_ack: A) -> LinkError
where
    R: AsyncRead + Unpin,
    D: FnMut(Bytes),
    A: FnMut(),
{
    loop {
        match frame::read_frame(&mut reader).await {
            Ok(Frame::Heartbeat) => on_ack(),
            Ok(Frame::Data(payload)) => on_data(payload),
            Err(e) => return e,
        }
    }
}

pub(crate) async fn run<R>(shared: Arc<Shared>, conn: Arc<Connection>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let generation = conn.generation;
    debug!(peer = %conn.peer, generation, "Reader started");

    let reason = read_loop(
        reader,
        |payload| {
            debug!(generation, len = payload.len(), "Frame received");
            (shared.on_data)(payload)
        },
        || heartbeat::on_ack(&shared, generation),
    )
    .await;

    match &reason {
        LinkError::FrameTooLarge { .. } => {
            error!(peer = %conn.peer, generation, error = %reason, "Protocol violation, dropping connection")
        }
        e if e.is_eof() => info!(peer = %conn.peer, generation, "Peer closed connection"),
        e => warn!(peer = %conn.peer, generation, error = %e, "Read failed"),
    }

    // May race with the writer's own close; shutdown is idempotent.
    conn.shutdown();
}
