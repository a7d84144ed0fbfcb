//! Persistent framed TCP link.
//!
//! A [`Link`] keeps one long-lived connection to `host:port` and hides
//! reconnection from its caller:
//!
//! ```text
//! write() ──┐
//! heartbeat ┼─► writer queue (one task, FIFO) ──► socket write half
//! recycle ──┘         │
//!                     └─ connect / retry runs inline, so it is ordered
//!                        with every write
//!
//! socket read half ──► reader task (one per connection) ──► on_data / ack
//! ```
//!
//! The current connection and the closed flag live together in one
//! mutex-guarded [`Slot`]. Every connection gets a new generation number;
//! timers and reader tasks only act on the generation they were created for.

mod heartbeat;
mod reader;
mod writer;

use bytes::Bytes;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::frame;
use writer::Task;

/// Observable lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection installed; a connect attempt is pending or running.
    Connecting,
    /// A connection is installed.
    Connected,
    /// Terminal. Closed by the caller or given up by the error policy.
    Closed,
}

/// Result of one write request. Delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The framed payload was handed to the socket.
    Sent,
    /// The payload was not sent; it is handed back.
    Failed(Bytes),
}

type DataCallback = Box<dyn Fn(Bytes) + Send + Sync>;
type ErrorCallback = Box<dyn Fn() -> bool + Send + Sync>;
type WriteCallback = Box<dyn FnOnce(WriteOutcome) + Send>;

/// Handle to a persistent link. Dropping it closes the link.
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Create a link and start connecting in the background.
    ///
    /// `on_data` runs on the reader task for every non-heartbeat frame.
    /// `on_error` runs on the writer task after each connect or write
    /// failure and returns whether to reconnect. Neither may block.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<D, E>(config: LinkConfig, on_data: D, on_error: E) -> Self
    where
        D: Fn(Bytes) + Send + Sync + 'static,
        E: Fn() -> bool + Send + Sync + 'static,
    {
        let (tasks, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        info!(addr = %config.addr(), "Starting link");

        let shared = Arc::new(Shared {
            config,
            slot: Mutex::new(Slot::default()),
            tasks,
            shutdown,
            on_data: Box::new(on_data),
            on_error: Box::new(on_error),
        });

        // Queued before the handle exists, so every write is ordered after
        // the first connect attempt.
        let _ = shared.tasks.send(Task::Connect);
        tokio::spawn(writer::run(Arc::clone(&shared), rx));

        Link { shared }
    }

    /// Queue `payload` for sending. `callback` receives the outcome.
    ///
    /// After [`Link::close`] the callback runs immediately, on the calling
    /// thread, with [`WriteOutcome::Failed`].
    pub fn write<F>(&self, payload: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(WriteOutcome) + Send + 'static,
    {
        let payload = payload.into();
        if self.shared.is_closed() {
            debug!(len = payload.len(), "Write after close rejected");
            callback(WriteOutcome::Failed(payload));
            return;
        }

        let task = Task::Write {
            payload,
            done: Box::new(callback),
        };
        if let Err(mpsc::error::SendError(task)) = self.shared.tasks.send(task) {
            task.abandon();
        }
    }

    /// Queue `payload` and wait for its outcome.
    pub async fn send(&self, payload: impl Into<Bytes>) -> WriteOutcome {
        let payload = payload.into();
        let fallback = payload.clone();
        let (tx, rx) = oneshot::channel();
        self.write(payload, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(WriteOutcome::Failed(fallback))
    }

    /// Close the link permanently. Idempotent and never blocks.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// State shared by the handle, the writer, readers and timers.
pub(crate) struct Shared {
    config: LinkConfig,
    slot: Mutex<Slot>,
    tasks: mpsc::UnboundedSender<Task>,
    shutdown: watch::Sender<bool>,
    on_data: DataCallback,
    on_error: ErrorCallback,
}

/// Everything that must change atomically with the closed flag.
struct Slot {
    state: ConnectionState,
    current: Option<Arc<Connection>>,
    generation: u64,
    heartbeat: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            current: None,
            generation: 0,
            heartbeat: None,
            watchdog: None,
        }
    }
}

impl Slot {
    fn current_generation(&self) -> Option<u64> {
        self.current.as_ref().map(|conn| conn.generation)
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }
}

/// One installed TCP connection.
pub(crate) struct Connection {
    generation: u64,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Duplicate of the socket used only for shutdown, so closing never
    /// waits on an in-flight write.
    control: std::net::TcpStream,
}

impl Connection {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, payload).await
    }

    /// Shut the socket down in both directions. Safe to call repeatedly.
    fn shutdown(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            // Already shut down or reset by the peer.
            debug!(generation = self.generation, error = %e, "Socket shutdown");
        }
    }
}

/// A freshly opened socket, not yet visible to anyone.
struct Transport {
    peer: SocketAddr,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    control: std::net::TcpStream,
}

impl Transport {
    fn discard(self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot updates never panic halfway, so a poisoned guard is still consistent.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().state == ConnectionState::Closed
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.lock().current.clone()
    }

    /// The installed connection, if it is still `generation`.
    fn connection(&self, generation: u64) -> Option<Arc<Connection>> {
        self.lock()
            .current
            .as_ref()
            .filter(|conn| conn.generation == generation)
            .cloned()
    }

    /// Connect, retrying while the error policy allows it.
    ///
    /// Runs on the writer task; queued writes wait until it returns.
    async fn connect(self: &Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            {
                let mut slot = self.lock();
                if slot.state == ConnectionState::Closed {
                    return;
                }
                slot.state = ConnectionState::Connecting;
            }
            attempt += 1;

            let opened = tokio::select! {
                opened = self.open() => opened,
                _ = closed(self.shutdown.subscribe()) => return,
            };

            let error = match opened {
                Ok(transport) => {
                    self.install(transport);
                    return;
                }
                Err(e) => e,
            };

            warn!(addr = %self.config.addr(), attempt, error = %error, "Connect failed");
            if self.is_closed() || !(self.on_error)() {
                self.give_up();
                return;
            }

            debug!(delay = ?self.config.retry_interval, "Retrying connect");
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                _ = closed(self.shutdown.subscribe()) => return,
            }
        }
    }

    async fn open(&self) -> Result<Transport> {
        let timeout = self.config.connect_timeout;
        let connecting = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let stream = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| LinkError::ConnectTimeout(timeout))??;

        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let (reader, writer) = TcpStream::from_std(std_stream)?.into_split();

        Ok(Transport {
            peer,
            reader,
            writer,
            control,
        })
    }

    /// Publish a connection, unless the link was closed while connecting.
    fn install(self: &Arc<Self>, transport: Transport) {
        let mut slot = self.lock();
        if slot.state == ConnectionState::Closed {
            drop(slot);
            info!(peer = %transport.peer, "Link closed while connecting, dropping new connection");
            transport.discard();
            return;
        }

        if let Some(previous) = slot.current.take() {
            previous.shutdown();
        }
        slot.cancel_timers();
        slot.generation += 1;

        let Transport {
            peer,
            reader,
            writer,
            control,
        } = transport;
        let conn = Arc::new(Connection {
            generation: slot.generation,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            control,
        });
        slot.current = Some(Arc::clone(&conn));
        slot.state = ConnectionState::Connected;

        info!(peer = %peer, generation = conn.generation, "Connected");

        tokio::spawn(reader::run(Arc::clone(self), Arc::clone(&conn), reader));
        let _ = self.tasks.send(Task::Heartbeat {
            generation: conn.generation,
        });
    }

    /// Uninstall and shut down `generation` if it is still current.
    ///
    /// Returns whether a connection was closed.
    fn close_connection(&self, generation: u64) -> bool {
        let mut slot = self.lock();
        if slot.current_generation() != Some(generation) {
            return false;
        }
        let conn = slot.current.take();
        slot.cancel_timers();
        if slot.state != ConnectionState::Closed {
            slot.state = ConnectionState::Connecting;
        }
        drop(slot);

        if let Some(conn) = conn {
            info!(peer = %conn.peer, generation, "Connection closed");
            conn.shutdown();
        }
        true
    }

    /// After a failure: ask the error policy, then reconnect or give up.
    async fn recover(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if (self.on_error)() {
            self.connect().await;
        } else {
            self.give_up();
        }
    }

    fn give_up(&self) {
        let mut slot = self.lock();
        if slot.state != ConnectionState::Closed {
            warn!(addr = %self.config.addr(), "Error policy declined reconnect, link is closed");
            slot.state = ConnectionState::Closed;
        }
    }

    fn close(&self) {
        let conn = {
            let mut slot = self.lock();
            slot.state = ConnectionState::Closed;
            slot.cancel_timers();
            slot.current.take()
        };
        if let Some(conn) = conn {
            conn.shutdown();
        }
        // Wakes the writer out of recv, connect and retry sleeps.
        if !self.shutdown.send_replace(true) {
            info!(addr = %self.config.addr(), "Link closed");
        }
    }
}

/// Resolves once the link has been closed.
async fn closed(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    pub(crate) async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    /// A port nothing listens on.
    pub(crate) async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Next application payload from the peer side, skipping heartbeats.
    pub(crate) async fn next_data<R: tokio::io::AsyncRead + Unpin>(peer: &mut R) -> Bytes {
        loop {
            match frame::read_frame(peer).await.unwrap() {
                frame::Frame::Heartbeat => continue,
                frame::Frame::Data(payload) => return payload,
            }
        }
    }

    pub(crate) fn quiet_config(port: u16) -> LinkConfig {
        LinkConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(60),
            ..LinkConfig::new("127.0.0.1", port)
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let link = Link::connect(quiet_config(port), |_| {}, || true);
        let (_peer, _) = listener.accept().await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || link.state() == ConnectionState::Connected).await);

        link.close();
        assert_eq!(link.state(), ConnectionState::Closed);
        link.close();
        assert_eq!(link.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_retry_count_then_give_up() {
        let port = refused_port().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let config = LinkConfig {
            retry_interval: Duration::from_millis(30),
            ..quiet_config(port)
        };
        let started = Instant::now();
        // Retry three times, refuse on the fourth failure.
        let link = Link::connect(config, |_| {}, move || counter.fetch_add(1, Ordering::SeqCst) < 3);

        assert!(wait_until(Duration::from_secs(5), || link.state() == ConnectionState::Closed).await);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(90));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(link.shared.current().is_none());
    }

    #[tokio::test]
    async fn test_close_interrupts_retry_sleep() {
        let port = refused_port().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let config = LinkConfig {
            retry_interval: Duration::from_secs(30),
            ..quiet_config(port)
        };
        let link = Link::connect(config, |_| {}, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1).await);

        // Queued behind the sleeping connect task.
        let (tx, rx) = oneshot::channel();
        link.write(&b"queued"[..], move |outcome| {
            let _ = tx.send(outcome);
        });
        link.close();

        let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Failed(Bytes::from_static(b"queued")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_during_connect_leaves_nothing_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let link = Link::connect(quiet_config(port), |_| {}, || true);
        link.close();

        // The kernel may complete the handshake before close wins the race;
        // in that case the accepted socket must see EOF promptly.
        if let Ok(Ok((mut peer, _))) =
            tokio::time::timeout(Duration::from_millis(200), listener.accept()).await
        {
            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    // Skip a heartbeat probe that may have been written first.
                    match peer.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            })
            .await;
            assert!(read.is_ok(), "connection left open after close");
        }

        assert_eq!(link.state(), ConnectionState::Closed);
        assert!(link.shared.current().is_none());
    }

    #[tokio::test]
    async fn test_drop_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let link = Link::connect(quiet_config(port), |_| {}, || true);
        let (mut peer, _) = listener.accept().await.unwrap();
        let shared = Arc::clone(&link.shared);
        drop(link);

        assert!(shared.is_closed());
        let mut buf = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(2), peer.read_to_end(&mut buf)).await;
        assert!(drained.is_ok());
    }
}
