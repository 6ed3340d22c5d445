//! The process supervisor.
//!
//! A [`Worker`] owns one loopback listener and one runtime process. The
//! runtime connects back over a WebSocket and announces itself with the
//! `init` handshake; messages posted before that are queued.
//!
//! ```text
//! Starting ──bind+spawn──▶ Listening ──accept──▶ Handshaking ──init──▶ Ready
//!     │                        │                      │                  │
//!     └──────── Failed ◀───────┴──────────────────────┘                  │
//!                                                   Terminated ◀─────────┘
//! ```
//!
//! Every path out of a running worker (natural exit, crash, `terminate`,
//! startup failure) ends in a single [`WorkerExit`] report.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use isoworker_structure::{
    EventTarget, ListenerId, MessageChannel, MessageEvent, Side, Transferable, Value,
};
use isoworker_transport::{serve, Multiplexer};

use crate::args::{runtime_args, Script};
use crate::error::{Result, WorkerError};
use crate::options::WorkerOptions;
use crate::process::{exit_signal, kill_process};

/// Exit code reported when the worker could not be started.
pub const STARTUP_FAILURE_CODE: i32 = -1;

/// Unique identifier of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        WorkerId(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Created; the socket is not bound yet.
    Starting,
    /// The socket is bound and the runtime spawned.
    Listening,
    /// The runtime connected and the `init` handshake is pending.
    Handshaking,
    /// Messages flow in both directions.
    Ready,
    Terminated,
    /// The socket could not be bound or the runtime could not be spawned.
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Failed)
    }
}

/// How a worker's process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Signal name, or the failure description for a worker that never
    /// started.
    pub signal: Option<String>,
}

impl WorkerExit {
    fn startup_failure(error: &WorkerError) -> Self {
        Self {
            code: Some(STARTUP_FAILURE_CODE),
            signal: Some(error.to_string()),
        }
    }
}

#[derive(Default)]
struct ProcessSlot {
    /// Set while the child is spawned and not yet reaped.
    pid: Option<u32>,
    address: Option<SocketAddr>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

struct WorkerInner {
    id: WorkerId,
    script: Script,
    options: WorkerOptions,
    mux: Multiplexer,
    state: watch::Sender<WorkerState>,
    exit: watch::Sender<Option<WorkerExit>>,
    exit_events: EventTarget<WorkerExit>,
    started: AtomicBool,
    terminated: AtomicBool,
    reported: AtomicBool,
    socket: CancellationToken,
    process: Mutex<ProcessSlot>,
}

/// A script running in a separately spawned runtime process.
///
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker without starting it.
    ///
    /// Register handlers, then call [`Worker::start`].
    pub fn new(script: Script, options: WorkerOptions) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: WorkerId::new(),
                script,
                options,
                mux: Multiplexer::new(Side::Host),
                state: watch::Sender::new(WorkerState::Starting),
                exit: watch::Sender::new(None),
                exit_events: EventTarget::new(),
                started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                reported: AtomicBool::new(false),
                socket: CancellationToken::new(),
                process: Mutex::new(ProcessSlot::default()),
            }),
        }
    }

    /// Create and start a worker. Must be called within a Tokio runtime.
    pub fn spawn(script: Script, options: WorkerOptions) -> Self {
        let worker = Self::new(script, options);
        worker.start();
        worker
    }

    /// Bind the socket and spawn the runtime in the background.
    ///
    /// Calling this more than once has no effect. Must be called within a
    /// Tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let span = info_span!("worker", id = %inner.id);
        tokio::spawn(inner.drive().instrument(span));
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    /// Process id of the runtime while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.inner.process.lock().pid
    }

    /// Address of the listener the runtime connects to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.process.lock().address
    }

    /// Wait until the handshake completes. Returns `false` if the worker
    /// ended first.
    pub async fn ready(&self) -> bool {
        let mut state = self.inner.state.subscribe();
        let ready = match state
            .wait_for(|s| *s == WorkerState::Ready || s.is_terminal())
            .await
        {
            Ok(state) => *state == WorkerState::Ready,
            Err(_) => false,
        };
        ready
    }

    /// Wait for the worker's single exit report.
    pub async fn exited(&self) -> WorkerExit {
        let mut exit = self.inner.exit.subscribe();
        let report = match exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            Err(_) => WorkerExit::default(),
        };
        report
    }

    /// Send `data` to the script's top-level `onmessage`.
    ///
    /// Silently dropped after [`Worker::terminate`]; fails with
    /// [`WorkerError::WorkerUnavailable`] if the worker failed to start.
    pub fn post_message(&self, data: Value, transfer: Vec<Transferable>) -> Result<()> {
        if self.state() == WorkerState::Failed {
            return Err(WorkerError::WorkerUnavailable(self.inner.id));
        }
        if self.inner.terminated.load(Ordering::SeqCst) {
            debug!(id = %self.inner.id, "worker terminated, dropping message");
            return Ok(());
        }
        self.inner.mux.post_message(None, data, transfer)?;
        Ok(())
    }

    /// Create a channel whose ports can be transferred to this worker.
    pub fn channel(&self) -> MessageChannel {
        self.inner.mux.channel()
    }

    /// Stop the worker immediately: close the socket and kill the process.
    ///
    /// Idempotent. A process that already exited is not an error.
    pub fn terminate(&self) -> Result<()> {
        self.inner.terminate()
    }

    /// Close only the connection, letting the process exit on its own.
    ///
    /// Messages posted afterwards are dropped.
    pub fn close_socket(&self) {
        debug!(id = %self.inner.id, "closing worker socket");
        self.inner.socket.cancel();
        self.inner.mux.close();
    }

    /// Install the `onmessage` handler.
    pub fn on_message(&self, handler: impl Fn(&MessageEvent) + Send + Sync + 'static) {
        self.inner.mux.on_message(handler);
    }

    pub fn add_message_listener(
        &self,
        listener: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.mux.add_message_listener(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.inner.mux.remove_message_listener(id)
    }

    /// Install the `onexit` handler.
    pub fn on_exit(&self, handler: impl Fn(&WorkerExit) + Send + Sync + 'static) {
        self.inner.exit_events.set_handler(handler);
    }

    pub fn add_exit_listener(
        &self,
        listener: impl Fn(&WorkerExit) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.exit_events.add_listener(listener)
    }

    pub fn remove_exit_listener(&self, id: ListenerId) -> bool {
        self.inner.exit_events.remove_listener(id)
    }

    /// The runtime's stdout, when it is not forwarded to the log.
    ///
    /// Available once the process has been spawned, and only once.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.inner.process.lock().stdout.take()
    }

    /// The runtime's stderr, when it is not forwarded to the log.
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.inner.process.lock().stderr.take()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl WorkerInner {
    async fn drive(self: Arc<Self>) {
        let exit = match self.run().await {
            Ok(exit) => exit,
            Err(error) => {
                warn!(%error, "worker failed");
                self.state.send_modify(|state| *state = WorkerState::Failed);
                WorkerExit::startup_failure(&error)
            }
        };
        if let Err(error) = self.terminate() {
            warn!(%error, "failed to terminate worker");
        }
        self.report_exit(exit);
    }

    async fn run(self: &Arc<Self>) -> Result<WorkerExit> {
        let bind = SocketAddr::new(self.options.host, 0);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| WorkerError::SocketBindFailure {
                address: bind.to_string(),
                source,
            })?;
        let address = listener.local_addr()?;
        self.process.lock().address = Some(address);

        let mut command = Command::new(&self.options.runtime_executable);
        command
            .args(runtime_args(&self.options, address, &self.script))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = {
            let mut process = self.process.lock();
            if self.terminated.load(Ordering::SeqCst) {
                debug!("terminated before the runtime was spawned");
                return Ok(WorkerExit::default());
            }
            let child = command
                .spawn()
                .map_err(|source| WorkerError::ProcessSpawnFailure {
                    program: self.options.runtime_executable.clone(),
                    source,
                })?;
            process.pid = child.id();
            child
        };
        self.advance(WorkerState::Starting, WorkerState::Listening);
        info!(pid = ?child.id(), %address, "runtime spawned");
        self.capture_output(&mut child);

        let status = self.supervise(listener, &mut child).await?;
        Ok(WorkerExit {
            code: status.code(),
            signal: exit_signal(&status),
        })
    }

    /// Accept the runtime's connection and wait for the process to exit.
    async fn supervise(
        self: &Arc<Self>,
        listener: TcpListener,
        child: &mut Child,
    ) -> io::Result<ExitStatus> {
        let mut listener = Some(listener);
        let mut connected = false;
        let wait = child.wait();
        tokio::pin!(wait);

        loop {
            tokio::select! {
                status = poll_fn(|cx| self.poll_reap(cx, wait.as_mut())) => {
                    let status = status?;
                    info!(%status, "runtime exited");
                    return Ok(status);
                }
                accepted = accept(&listener) => match accepted {
                    Ok((stream, peer)) if !connected => {
                        connected = true;
                        debug!(%peer, "runtime connected");
                        self.advance(WorkerState::Listening, WorkerState::Handshaking);
                        self.connect(stream);
                    }
                    Ok((_stream, peer)) => {
                        warn!(%peer, "rejecting second connection");
                    }
                    Err(error) => warn!(%error, "accept failed"),
                },
                _ = self.socket.cancelled(), if listener.is_some() => {
                    debug!("socket closed");
                    listener = None;
                }
            }
        }
    }

    /// Poll the child's exit under the process lock.
    ///
    /// The pid is cleared in the same critical section that reaps the
    /// child, so `terminate` never signals a pid the OS may have reused.
    fn poll_reap(
        &self,
        cx: &mut Context<'_>,
        wait: Pin<&mut impl Future<Output = io::Result<ExitStatus>>>,
    ) -> Poll<io::Result<ExitStatus>> {
        let mut process = self.process.lock();
        let poll = wait.poll(cx);
        if poll.is_ready() {
            process.pid = None;
        }
        poll
    }

    fn connect(self: &Arc<Self>, stream: TcpStream) {
        let mux = self.mux.clone();
        let shutdown = self.socket.clone();
        tokio::spawn(
            async move {
                if let Err(error) = serve(stream, mux, shutdown).await {
                    warn!(%error, "worker connection failed");
                }
            }
            .in_current_span(),
        );

        let inner = self.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = inner.mux.wait_available() => {
                        if inner.advance(WorkerState::Handshaking, WorkerState::Ready) {
                            info!("worker ready");
                        }
                    }
                    _ = inner.socket.cancelled() => {}
                }
            }
            .in_current_span(),
        );
    }

    fn capture_output(&self, child: &mut Child) {
        let mut process = self.process.lock();
        match child.stdout.take() {
            Some(stdout) if self.options.log_stdout => {
                tokio::spawn(forward_lines(stdout, Stream::Stdout).in_current_span());
            }
            stdout => process.stdout = stdout,
        }
        match child.stderr.take() {
            Some(stderr) if self.options.log_stderr => {
                tokio::spawn(forward_lines(stderr, Stream::Stderr).in_current_span());
            }
            stderr => process.stderr = stderr,
        }
    }

    /// Move from `from` to `to`; no-op from any other state.
    fn advance(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn terminate(&self) -> Result<()> {
        let killed = {
            let process = self.process.lock();
            if self.terminated.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            info!(id = %self.id, pid = ?process.pid, "terminating worker");
            // Still unreaped while the lock is held.
            process.pid.map(kill_process).transpose()
        };

        self.socket.cancel();
        self.mux.close();
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = WorkerState::Terminated;
                true
            }
        });

        // Never started, so no driver will report.
        if !self.started.load(Ordering::SeqCst) {
            self.report_exit(WorkerExit::default());
        }

        killed?;
        Ok(())
    }

    fn report_exit(&self, exit: WorkerExit) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(id = %self.id, code = ?exit.code, signal = ?exit.signal, "worker exited");
        self.exit_events.dispatch(&exit);
        self.exit.send_replace(Some(exit));
    }
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn forward_lines(reader: impl AsyncRead + Unpin, stream: Stream) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream {
                Stream::Stdout => info!(target: "isoworker::stdout", "{}", line),
                Stream::Stderr => info!(target: "isoworker::stderr", "{}", line),
            },
            Ok(None) => break,
            Err(error) => {
                debug!(?stream, %error, "stopped reading runtime output");
                break;
            }
        }
    }
}
