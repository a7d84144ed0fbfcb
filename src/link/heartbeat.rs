//! Heartbeat monitor.
//!
//! After connect a zero-length probe goes through the writer queue. Each
//! successfully written probe schedules the next one `heartbeat_interval`
//! later and arms a watchdog for `heartbeat_timeout`; the two timers run
//! independently. An inbound zero-length frame disarms the watchdog. If the
//! watchdog fires first the socket is shut down and a recycle is queued.

use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, trace};

use super::writer::{self, Task};
use super::{Shared, WriteCallback, WriteOutcome};

/// Send one probe on `generation`, if it is still the installed connection.
pub(crate) async fn probe(shared: &Arc<Shared>, generation: u64) {
    if shared.connection(generation).is_none() {
        trace!(generation, "Stale heartbeat skipped");
        return;
    }

    let weak = Arc::downgrade(shared);
    let done: WriteCallback = Box::new(move |outcome: WriteOutcome| {
        if let (WriteOutcome::Sent, Some(shared)) = (outcome, weak.upgrade()) {
            on_probe_sent(&shared, generation);
        }
    });
    writer::write(shared, Bytes::new(), done).await;
}

/// Schedule the next probe and arm the watchdog.
fn on_probe_sent(shared: &Arc<Shared>, generation: u64) {
    let mut slot = shared.lock();
    if slot.current_generation() != Some(generation) {
        return;
    }
    trace!(generation, "Heartbeat sent");

    let tasks = shared.tasks.clone();
    let interval = shared.config.heartbeat_interval;
    slot.heartbeat = Some(tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        let _ = tasks.send(Task::Heartbeat { generation });
    }));

    // An unacknowledged earlier probe keeps its earlier deadline.
    let armed = slot.watchdog.as_ref().is_some_and(|task| !task.is_finished());
    if !armed {
        let timeout = shared.config.heartbeat_timeout;
        slot.watchdog = Some(tokio::spawn(watchdog(
            Arc::downgrade(shared),
            generation,
            timeout,
        )));
    }
}

/// A zero-length frame arrived on `generation`.
pub(crate) fn on_ack(shared: &Shared, generation: u64) {
    let mut slot = shared.lock();
    if slot.current_generation() != Some(generation) {
        return;
    }
    if let Some(task) = slot.watchdog.take() {
        task.abort();
    }
    trace!(generation, "Heartbeat acknowledged");
}

async fn watchdog(shared: Weak<Shared>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };

    error!(generation, ?timeout, "Heartbeat timeout, recycling connection");
    if let Some(conn) = shared.connection(generation) {
        // Unblocks the reader and fails any write racing with the recycle.
        conn.shutdown();
    }
    let _ = shared.tasks.send(Task::Recycle { generation });
}

#[cfg(test)]
mod tests {
    use super::super::tests::wait_until;
    use super::super::{ConnectionState, Link};
    use crate::config::LinkConfig;
    use crate::frame::{read_frame, write_frame, Frame};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_heartbeat(port: u16) -> LinkConfig {
        LinkConfig {
            retry_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(60),
            ..LinkConfig::new("127.0.0.1", port)
        }
    }

    #[tokio::test]
    async fn test_silent_peer_is_recycled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let policy_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&policy_calls);

        let link = Link::connect(fast_heartbeat(port), |_| {}, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        // Swallow probes without answering.
        let (mut first, _) = listener.accept().await.unwrap();
        let started = Instant::now();
        let mut sink = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), first.read_to_end(&mut sink)).await;
        // Probe sent immediately, watchdog fires one timeout later.
        assert!(started.elapsed() < Duration::from_millis(1000));

        let (_second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(policy_calls.load(Ordering::SeqCst) >= 1);
        link.close();
    }

    #[tokio::test]
    async fn test_acked_probes_keep_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let policy_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&policy_calls);

        let link = Link::connect(fast_heartbeat(port), |_| {}, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let (mut peer, _) = listener.accept().await.unwrap();
        let echo = tokio::spawn(async move {
            let mut probes = 0usize;
            while let Ok(frame) = read_frame(&mut peer).await {
                if frame == Frame::Heartbeat {
                    probes += 1;
                    if write_frame(&mut peer, b"").await.is_err() {
                        break;
                    }
                }
            }
            probes
        });

        // Several intervals, each longer than the timeout.
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(policy_calls.load(Ordering::SeqCst), 0);

        link.close();
        let probes = echo.await.unwrap();
        assert!(probes >= 3, "only {probes} probes");
    }

    #[tokio::test]
    async fn test_recycle_declined_closes_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let link = Link::connect(fast_heartbeat(port), |_| {}, || false);
        let (_silent, _) = listener.accept().await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || link.state() == ConnectionState::Closed).await);
        assert!(link.shared.current().is_none());
    }
}
