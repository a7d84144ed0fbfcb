//! Writer task queue.
//!
//! One task per link, alive across reconnects. It is the only place that
//! writes to the socket, and it also runs connect/retry, heartbeat probes
//! and heartbeat recycling, so none of those can interleave with a user
//! write.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{closed, heartbeat, Shared, WriteCallback, WriteOutcome};
use crate::frame::MAX_FRAME_LEN;

/// Unit of work for the writer queue.
pub(crate) enum Task {
    /// First connect attempt of the link.
    Connect,
    /// A caller's write request.
    Write { payload: Bytes, done: WriteCallback },
    /// Send a heartbeat probe on `generation`.
    Heartbeat { generation: u64 },
    /// The watchdog expired on `generation`: drop it and reconnect.
    Recycle { generation: u64 },
}

impl Task {
    /// Report failure for a task that will never run.
    pub(crate) fn abandon(self) {
        if let Task::Write { payload, done } = self {
            done(WriteOutcome::Failed(payload));
        }
    }
}

/// Process tasks in order until the link is closed, then fail whatever is
/// still queued.
pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Task>) {
    loop {
        let task = tokio::select! {
            biased;
            _ = closed(shared.shutdown.subscribe()) => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        match task {
            Task::Connect => shared.connect().await,
            Task::Write { payload, done } => write(&shared, payload, done).await,
            Task::Heartbeat { generation } => heartbeat::probe(&shared, generation).await,
            Task::Recycle { generation } => {
                if shared.close_connection(generation) {
                    shared.recover().await;
                }
            }
        }
    }

    rx.close();
    let mut abandoned = 0usize;
    while let Ok(task) = rx.try_recv() {
        task.abandon();
        abandoned += 1;
    }
    debug!(abandoned, "Writer stopped");
}

/// Frame and send one payload on the current connection.
///
/// On I/O failure the connection is closed, the request fails, and the
/// error policy decides whether to reconnect before the next task runs.
pub(crate) async fn write(shared: &Arc<Shared>, payload: Bytes, done: WriteCallback) {
    if payload.len() > MAX_FRAME_LEN {
        warn!(len = payload.len(), max = MAX_FRAME_LEN, "Payload too large, not sent");
        done(WriteOutcome::Failed(payload));
        return;
    }

    let Some(conn) = shared.current() else {
        warn!(len = payload.len(), "No connection, write dropped");
        done(WriteOutcome::Failed(payload));
        return;
    };

    match conn.send(&payload).await {
        Ok(()) => {
            trace!(generation = conn.generation, len = payload.len(), "Frame written");
            done(WriteOutcome::Sent);
        }
        Err(e) => {
            warn!(peer = %conn.peer, generation = conn.generation, error = %e, "Write failed");
            shared.close_connection(conn.generation);
            done(WriteOutcome::Failed(payload));
            shared.recover().await;
        }
    }
}
