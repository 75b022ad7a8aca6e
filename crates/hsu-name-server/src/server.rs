//! Name server lifecycle: start, stop and the background worker.
//!
//! # Rust Learning Note
//!
//! ## One worker, one runtime
//!
//! `NameServer::start()` binds the listeners on the caller's thread, then
//! moves them together with a fresh [`TransportContext`] onto a dedicated OS
//! thread. That thread runs a current-thread tokio runtime, so every socket
//! read and write of the server happens on the one worker:
//!
//! ```text
//!  owner thread                      worker thread
//!  ------------                      -------------
//!  start() --bind--> BoundListener --move--> Listener::from_bound
//!                                            accept loop
//!                                              +-- connection task (in order)
//!                                              +-- subscriber fan-out
//!  stop()  --cancel token----------------->  finish current reply, exit
//!          <--done channel (bounded wait)--  clear registry, release context
//! ```
//!
//! The public API is synchronous on purpose: the owner does not need to be
//! inside a runtime to embed the server.
//!
//! ## Graceful stop
//!
//! Each connection waits for input with a bounded poll timeout and also
//! selects on a `CancellationToken`, so a stop is noticed promptly. Once a
//! frame has been read, dispatch and reply run outside the `select!`, which
//! means a started request/reply cycle always completes before the
//! connection exits.

use crate::dispatcher::RequestDispatcher;
use crate::protocol::{Response, MAX_FRAME_LEN, UNKNOWN_COMMAND};
use crate::publisher::{serve_subscribers, EventPublisher};
use crate::state::{ServerState, ServerStateMachine, StateTransition};
use crate::storage::RegistryStore;
use crate::transport::{BoundListener, Connection, Listener, TransportAddress, TransportContext};
use hsu_common::{Error, Result, ResultExt};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WORKER_NAME: &str = "hsu-name-server";

/// How long the worker waits for leftover runtime tasks when releasing its
/// transport context. All serving tasks are joined before this point.
const CONTEXT_RELEASE_GRACE: Duration = Duration::from_millis(250);

/// Runtime tuning for a [`NameServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Upper bound on how long a connection waits for input before it
    /// re-checks the stop signal.
    pub poll_interval: Duration,

    /// Upper bound on how long `stop()` waits for the worker to exit.
    pub join_timeout: Duration,

    /// Capacity of the event fan-out channel.
    pub event_buffer: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
            event_buffer: 1024,
        }
    }
}

/// Concurrent name server / service registry broker.
///
/// All methods take `&self` and are safe to call from any thread, so the
/// server can be shared as `Arc<NameServer>`. Dropping it stops it.
///
/// # Example
///
/// ```no_run
/// use hsu_name_server::{NameServer, ServerOptions};
///
/// let server = NameServer::new(ServerOptions::default());
/// server.start("tcp://127.0.0.1:5555", Some("tcp://127.0.0.1:5556"))?;
/// // ... serve ...
/// server.stop();
/// server.stop(); // idempotent
/// # Ok::<(), hsu_common::Error>(())
/// ```
pub struct NameServer {
    options: ServerOptions,
    worker: Mutex<Option<WorkerHandle>>,
    state: Arc<Mutex<ServerStateMachine>>,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl NameServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            worker: Mutex::new(None),
            state: Arc::new(Mutex::new(ServerStateMachine::new())),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Binds the request transport (and the publish transport, if given) and
    /// spawns the worker.
    ///
    /// A no-op while the server is already starting or running.
    pub fn start(&self, request_address: &str, publish_address: Option<&str>) -> Result<()> {
        if self.is_serving() {
            debug!(state = %self.state(), "Name server already running, start ignored");
            return Ok(());
        }

        let request = TransportAddress::parse(request_address).map_err(|e| self.record_error(e))?;
        let publish = publish_address
            .map(TransportAddress::parse)
            .transpose()
            .map_err(|e| self.record_error(e))?;

        self.start_with(request, publish)
    }

    /// Same as [`start`](Self::start) with already-parsed addresses.
    pub fn start_with(&self, request: TransportAddress, publish: Option<TransportAddress>) -> Result<()> {
        let mut worker = self.worker.lock();

        if self.is_serving() {
            debug!(state = %self.state(), "Name server already running, start ignored");
            return Ok(());
        }

        // A worker that stopped by itself (wire SHUTDOWN or transport failure)
        // still has a thread to reap.
        if let Some(stale) = worker.take() {
            stale.join(self.options.join_timeout);
        }
        self.state.lock().settle_stopped("previous worker reaped");

        self.state.lock().transition_to(ServerState::Starting, "start requested")?;

        // Cleared before the worker exists so an early worker failure stays visible
        *self.last_error.lock() = None;

        match self.spawn_worker(request, publish) {
            Ok(handle) => {
                info!(
                    request = %handle.request_address,
                    publish = %handle.publish_address.as_ref().map(|a| a.to_string()).unwrap_or_else(|| "disabled".to_string()),
                    "Name server started"
                );
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Name server failed to start");
                self.state.lock().settle_stopped("start failed");
                Err(self.record_error(e))
            }
        }
    }

    /// Stops the server and waits (bounded) for the worker to exit.
    ///
    /// Idempotent: calling it again, or concurrently, is harmless.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();

        let Some(handle) = worker.take() else {
            debug!("Name server not running, stop ignored");
            return;
        };

        {
            let mut state = self.state.lock();
            if state.current_state() == ServerState::Running {
                let _ = state.transition_to(ServerState::Stopping, "stop requested");
            }
        }

        info!("Stopping name server");
        if !handle.join(self.options.join_timeout) {
            warn!(
                timeout = ?self.options.join_timeout,
                "Name server worker did not exit in time, detaching it"
            );
        }

        self.state.lock().settle_stopped("stopped by owner");
        info!("Name server stopped");
    }

    pub fn state(&self) -> ServerState {
        self.state.lock().current_state()
    }

    /// Recent state transitions, oldest first.
    pub fn state_history(&self) -> Vec<StateTransition> {
        self.state.lock().history().cloned().collect()
    }

    /// The last fatal error (bind failure, transport failure), if any.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }

    /// The bound request address while serving (the real port if 0 was asked).
    pub fn request_address(&self) -> Option<TransportAddress> {
        self.with_live_worker(|w| w.request_address.clone())
    }

    /// The bound publish address while serving, if publishing is enabled.
    pub fn publish_address(&self) -> Option<TransportAddress> {
        self.with_live_worker(|w| w.publish_address.clone()).flatten()
    }

    /// In-process access to the live registry.
    ///
    /// Calls through this handle take the same lock as network requests.
    /// They do not publish events.
    pub fn registry(&self) -> Option<Arc<RegistryStore>> {
        self.with_live_worker(|w| Arc::clone(&w.store))
    }

    /// Blocks until the server is Stopped or `timeout` expires.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == ServerState::Stopped {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn is_serving(&self) -> bool {
        matches!(self.state(), ServerState::Starting | ServerState::Running)
    }

    fn with_live_worker<T>(&self, f: impl FnOnce(&WorkerHandle) -> T) -> Option<T> {
        if !self.is_serving() {
            return None;
        }
        self.worker.lock().as_ref().map(f)
    }

    fn record_error(&self, e: Error) -> Error {
        *self.last_error.lock() = Some(e.clone());
        e
    }

    fn spawn_worker(&self, request: TransportAddress, publish: Option<TransportAddress>) -> Result<WorkerHandle> {
        let request_listener = request.bind().context("Failed to bind request transport")?;
        let publish_listener = publish
            .as_ref()
            .map(TransportAddress::bind)
            .transpose()
            .context("Failed to bind publish transport")?;

        let request_address = request_listener.local_address().clone();
        let publish_address = publish_listener.as_ref().map(|l| l.local_address().clone());

        let context = TransportContext::new(WORKER_NAME)?;
        let store = Arc::new(RegistryStore::new());
        let publisher = if publish_listener.is_some() {
            EventPublisher::new(self.options.event_buffer)
        } else {
            EventPublisher::disabled()
        };
        let shutdown = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel();

        let worker = Worker {
            context,
            request: request_listener,
            publish: publish_listener,
            dispatcher: RequestDispatcher::new(Arc::clone(&store), publisher.clone()),
            publisher,
            store: Arc::clone(&store),
            shutdown: shutdown.clone(),
            poll_interval: self.options.poll_interval,
            exit: ExitGuard {
                state: Arc::clone(&self.state),
                done_tx,
            },
            last_error: Arc::clone(&self.last_error),
        };

        self.state.lock().transition_to(ServerState::Running, "worker spawned")?;

        let thread = std::thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::internal(format!("failed to spawn worker thread: {}", e)))?;

        Ok(WorkerHandle {
            shutdown,
            thread,
            done_rx,
            store,
            request_address,
            publish_address,
        })
    }
}

impl Default for NameServer {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Drop for NameServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owner-side handle to a running worker.
struct WorkerHandle {
    shutdown: CancellationToken,
    thread: std::thread::JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
    store: Arc<RegistryStore>,
    request_address: TransportAddress,
    publish_address: Option<TransportAddress>,
}

impl WorkerHandle {
    /// Signals the worker and waits up to `timeout`. Returns whether it exited.
    fn join(self, timeout: Duration) -> bool {
        self.shutdown.cancel();

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    error!("Name server worker panicked");
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Settles the state machine and signals the owner when the worker ends,
/// including by panic.
struct ExitGuard {
    state: Arc<Mutex<ServerStateMachine>>,
    done_tx: mpsc::Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.state.lock().settle_stopped("worker exited");
        let _ = self.done_tx.send(());
    }
}

/// Everything the worker thread owns.
struct Worker {
    context: TransportContext,
    request: BoundListener,
    publish: Option<BoundListener>,
    dispatcher: RequestDispatcher,
    publisher: EventPublisher,
    store: Arc<RegistryStore>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    exit: ExitGuard,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl Worker {
    fn run(self) {
        let Worker {
            context,
            request,
            publish,
            dispatcher,
            publisher,
            store,
            shutdown,
            poll_interval,
            exit,
            last_error,
        } = self;

        debug!("Name server worker running");

        let result = context.block_on(serve(request, publish, dispatcher, publisher, shutdown, poll_interval));
        if let Err(e) = result {
            error!(error = %e, "Name server worker failed");
            *last_error.lock() = Some(e);
        }

        store.clear();
        context.release(CONTEXT_RELEASE_GRACE);
        debug!("Name server worker exited, transport context released");

        drop(exit);
    }
}

/// Accept loop of the request transport. Returns when `shutdown` fires or a
/// listener fails.
async fn serve(
    request: BoundListener,
    publish: Option<BoundListener>,
    dispatcher: RequestDispatcher,
    publisher: EventPublisher,
    shutdown: CancellationToken,
    poll_interval: Duration,
) -> Result<()> {
    let listener = Listener::from_bound(request)?;
    let mut fanout = match publish {
        Some(bound) => {
            let listener = Listener::from_bound(bound)?;
            Some(tokio::spawn(serve_subscribers(listener, publisher, shutdown.clone())))
        }
        None => None,
    };

    let mut connections = JoinSet::new();

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),

            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    connections.spawn(serve_connection(
                        conn,
                        peer,
                        dispatcher.clone(),
                        shutdown.clone(),
                        poll_interval,
                    ));
                }
                Err(e) => break Err(Error::transport(format!("accept on request transport: {}", e))),
            },

            joined = join_fanout(&mut fanout), if fanout.is_some() => {
                fanout = None;
                match joined {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(e)) => break Err(Error::transport(format!("accept on publish transport: {}", e))),
                    Err(e) => break Err(Error::internal(format!("publish task failed: {}", e))),
                }
            }

            // Reap finished connections so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    shutdown.cancel();
    drop(listener);

    while connections.join_next().await.is_some() {}
    if let Some(handle) = fanout {
        if let Ok(Err(e)) = handle.await {
            warn!(error = %e, "Publish transport failed during shutdown");
        }
    }

    result
}

async fn join_fanout(
    fanout: &mut Option<JoinHandle<std::io::Result<()>>>,
) -> std::result::Result<std::io::Result<()>, tokio::task::JoinError> {
    match fanout {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Serves one client connection: strictly one reply per request, in order.
async fn serve_connection(
    conn: Box<dyn Connection>,
    peer: String,
    dispatcher: RequestDispatcher,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    debug!(peer = %peer, "Client connected");

    let (reader, mut writer) = tokio::io::split(conn);
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // `read_until` keeps partially read bytes in `frame`, so a poll
        // timeout in the middle of a line loses nothing. The limit leaves
        // room for one byte past MAX_FRAME_LEN plus the newline.
        let limit = (MAX_FRAME_LEN + 1 - frame.len()) as u64;
        let mut limited = (&mut reader).take(limit);
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(poll_interval, limited.read_until(b'\n', &mut frame)) => read,
        };

        match read {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Client read failed");
                break;
            }
        }

        if is_oversized(&frame) {
            warn!(peer = %peer, limit = MAX_FRAME_LEN, "Request line too long, closing connection");
            let reply = Response::error(UNKNOWN_COMMAND).encode();
            let _ = write_reply(&mut writer, &reply, &shutdown, poll_interval).await;
            break;
        }

        let outcome = dispatcher.dispatch(trim_line(&frame));
        frame.clear();

        let reply = outcome.response().encode();
        if let Err(e) = write_reply(&mut writer, &reply, &shutdown, poll_interval).await {
            debug!(peer = %peer, error = %e, "Client write failed");
            break;
        }

        if outcome.is_shutdown() {
            info!(peer = %peer, "Shutdown requested over the wire");
            shutdown.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!(peer = %peer, "Client disconnected");
}

/// Writes one reply. Once `shutdown` fires the write gets `grace` more time
/// to finish, so a peer that stopped reading cannot hold the worker.
async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &[u8],
    shutdown: &CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    let write = async {
        writer.write_all(reply).await?;
        writer.flush().await
    };

    tokio::select! {
        written = write => written,
        _ = cancelled_after(shutdown, grace) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "reply not written before shutdown",
        )),
    }
}

async fn cancelled_after(shutdown: &CancellationToken, grace: Duration) {
    shutdown.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// A line that hit the read limit without a newline.
fn is_oversized(frame: &[u8]) -> bool {
    frame.len() > MAX_FRAME_LEN && !frame.ends_with(b"\n")
}

fn trim_line(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options() -> ServerOptions {
        ServerOptions {
            poll_interval: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
            event_buffer: 16,
        }
    }

    #[test]
    fn test_server_creation() {
        let server = NameServer::new(fast_options());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.last_error().is_none());
        assert!(server.registry().is_none());
        assert!(server.request_address().is_none());
    }

    #[test]
    fn test_trim_line() {
        assert_eq!(trim_line(b"{}\n"), b"{}");
        assert_eq!(trim_line(b"{}\r\n"), b"{}");
        assert_eq!(trim_line(b"{}"), b"{}");
        assert_eq!(trim_line(b"\n"), b"");
    }

    #[test]
    fn test_is_oversized() {
        let mut frame = vec![b'a'; MAX_FRAME_LEN];
        assert!(!is_oversized(&frame));

        frame.push(b'\n');
        assert!(!is_oversized(&frame));

        frame.pop();
        frame.push(b'a');
        assert!(is_oversized(&frame));
    }

    #[tokio::test]
    async fn test_write_reply_gives_up_after_shutdown() {
        // A peer that never reads: the in-memory pipe holds only 8 bytes
        let (mut writer, _reader) = tokio::io::duplex(8);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let reply = vec![b'x'; 1024];
        let err = write_reply(&mut writer, &reply, &shutdown, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_start_stop_cycle() {
        let server = NameServer::new(fast_options());

        server.start("tcp://127.0.0.1:0", None).unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.request_address().is_some());
        assert!(server.publish_address().is_none());

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.registry().is_none());

        let states: Vec<_> = server.state_history().iter().map(|t| t.to_state).collect();
        assert_eq!(
            states,
            vec![ServerState::Starting, ServerState::Running, ServerState::Stopping, ServerState::Stopped]
        );
    }

    #[test]
    fn test_start_while_running_is_noop() {
        let server = NameServer::new(fast_options());
        server.start("tcp://127.0.0.1:0", None).unwrap();
        let first = server.request_address().unwrap();

        server.start("tcp://127.0.0.1:0", None).unwrap();
        assert_eq!(server.request_address().unwrap(), first);

        server.stop();
    }

    #[test]
    fn test_stop_twice_and_before_start() {
        let server = NameServer::new(fast_options());
        server.stop();

        server.start("tcp://127.0.0.1:0", None).unwrap();
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.last_error().is_none());
    }

    #[test]
    fn test_invalid_address_is_recorded() {
        let server = NameServer::new(fast_options());
        let err = server.start("bogus", None).unwrap_err();

        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert_eq!(server.last_error(), Some(err));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_start_resets_error_and_keeps_worker_failures() {
        let server = NameServer::new(fast_options());
        let _ = server.start("bogus", None);
        assert!(server.last_error().is_some());

        server.start("tcp://127.0.0.1:0", None).unwrap();
        assert!(server.last_error().is_none());

        // The worker records into the same slot; start has already returned
        let failure = Error::transport("accept on request transport: reset");
        *server.last_error.lock() = Some(failure.clone());
        server.start("tcp://127.0.0.1:0", None).unwrap();
        assert_eq!(server.last_error(), Some(failure));

        server.stop();
    }

    #[test]
    fn test_in_process_registry_shares_state() {
        let server = NameServer::new(fast_options());
        server.start("tcp://127.0.0.1:0", None).unwrap();

        let registry = server.registry().unwrap();
        registry.register("svc-a", "tcp://10.0.0.1:9000");
        assert_eq!(server.registry().unwrap().lookup("svc-a").unwrap(), "tcp://10.0.0.1:9000");

        server.stop();
        // Registry is discarded on stop
        assert!(registry.is_empty());
    }

    #[test]
    fn test_restart_gets_fresh_registry() {
        let server = NameServer::new(fast_options());

        server.start("tcp://127.0.0.1:0", None).unwrap();
        server.registry().unwrap().register("svc-a", "tcp://10.0.0.1:9000");
        server.stop();

        server.start("tcp://127.0.0.1:0", None).unwrap();
        assert!(server.registry().unwrap().is_empty());
        server.stop();
    }
}
