//! Worker process lifecycle: deduplicated starts, exit monitoring and stops

use crate::app::{AppSpec, LaunchKind};
use crate::config::SupervisorConfig;
use crate::error::{ProxyError, StartError};
use crate::event::{AppFailure, Bus, Event};
#[cfg(unix)]
use crate::ipc::{IpcChannel, Message};
use crate::proxy::Listener;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitResult {
    /// No process was running
    NotRunning,
    /// The process terminated with an exit code or a signal
    Exited { code: Option<i32>, signal: Option<i32> },
    /// Waiting on the process failed
    Failed(String),
}

impl ExitResult {
    pub fn success(&self) -> bool {
        matches!(self, ExitResult::Exited { code: Some(0), .. })
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        ExitResult::Exited {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitResult::NotRunning => write!(f, "not running"),
            ExitResult::Exited { code: Some(code), .. } => write!(f, "exit code {}", code),
            ExitResult::Exited { signal: Some(signal), .. } => write!(f, "killed by signal {}", signal),
            ExitResult::Exited { .. } => write!(f, "exited"),
            ExitResult::Failed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

/// Lifecycle state of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// No worker process
    Stopped,
    /// A start is in flight
    Starting,
    /// Worker is ready and accepting traffic
    Running,
    /// A stop was requested and the process has not exited yet
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Terminate,
    Kill,
}

/// Handle to a spawned worker process
pub struct WorkerHandle {
    /// Value of the entry's start count when this worker was spawned
    generation: u64,
    pid: Option<u32>,
    handshake: bool,
    #[cfg(unix)]
    ipc: Option<IpcChannel>,
    control: mpsc::UnboundedSender<Signal>,
    stop_requested: AtomicBool,
    exit: watch::Receiver<Option<ExitResult>>,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Which start of its app produced this worker (1-based)
    pub fn start_count(&self) -> u64 {
        self.generation
    }

    /// Wait for this process to end; immediate if it already has
    pub async fn exited(&self) -> ExitResult {
        wait_exit(self.exit.clone()).await
    }

    fn signal(&self, signal: Signal) {
        let _ = self.control.send(signal);
    }

    async fn request_exit(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        if let Some(ipc) = &self.ipc {
            return ipc.send(&Message::Exit).await;
        }
        Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "worker has no IPC channel"))
    }
}

type StartFuture = Shared<BoxFuture<'static, Option<Arc<WorkerHandle>>>>;

struct EntryState {
    /// Set only once a start has completed; cleared when the process ends
    running: Option<Arc<WorkerHandle>>,
    /// Process that has been spawned and not yet reaped, ready or not
    spawned: Option<Arc<WorkerHandle>>,
    /// At most one start in flight; every caller awaits the same future
    starting: Option<StartFuture>,
    /// Exit of the most recently spawned process
    exit: watch::Receiver<Option<ExitResult>>,
    start_count: u64,
}

/// Runtime state of one registered app
pub struct AppEntry {
    spec: Arc<AppSpec>,
    state: Mutex<EntryState>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    /// Set when the app is shut down; no listener or worker is added after
    retired: AtomicBool,
}

impl AppEntry {
    pub fn new(spec: Arc<AppSpec>) -> Self {
        let (_, exit) = watch::channel(Some(ExitResult::NotRunning));
        Self {
            spec,
            state: Mutex::new(EntryState {
                running: None,
                spawned: None,
                starting: None,
                exit,
                start_count: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &Arc<AppSpec> {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The ready worker, if any
    pub fn running(&self) -> Option<Arc<WorkerHandle>> {
        self.state.lock().running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running.is_some()
    }

    pub fn start_count(&self) -> u64 {
        self.state.lock().start_count
    }

    pub fn state(&self) -> AppState {
        let state = self.state.lock();
        if let Some(worker) = &state.spawned {
            if worker.stop_requested.load(Ordering::SeqCst) {
                return AppState::Stopping;
            }
        }
        if state.running.is_some() {
            AppState::Running
        } else if state.starting.is_some() {
            AppState::Starting
        } else {
            AppState::Stopped
        }
    }

    /// Pid of the spawned process, ready or not
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().spawned.as_ref().and_then(|w| w.pid)
    }

    /// Attach a listener. Returns `false`, leaving the listener to the
    /// caller, once the entry is retired.
    pub(crate) fn add_listener(&self, listener: Arc<Listener>) -> bool {
        let mut listeners = self.listeners.lock();
        if self.retired.load(Ordering::SeqCst) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Mark the entry as shut down and return its listeners
    pub(crate) fn retire(&self) -> Vec<Arc<Listener>> {
        let listeners = self.listeners.lock();
        self.retired.store(true, Ordering::SeqCst);
        listeners.clone()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Send SIGKILL to the spawned process, if any, without waiting
    pub(crate) fn kill_now(&self) {
        let worker = self.state.lock().spawned.clone();
        if let Some(worker) = worker {
            worker.stop_requested.store(true, Ordering::SeqCst);
            worker.signal(Signal::Kill);
        }
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.listeners.lock().clone()
    }

    /// Connections currently open across all listeners
    pub fn live_connections(&self) -> usize {
        self.listeners.lock().iter().map(|l| l.live_connections()).sum()
    }
}

/// Starts and stops worker processes.
///
/// Cheap to clone; every clone publishes to the same [`Bus`].
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: Arc<SupervisorConfig>,
    bus: Bus,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<SupervisorConfig>, bus: Bus) -> Self {
        Self { config, bus }
    }

    /// Make sure the app's worker is running.
    ///
    /// Returns the running worker, joins a start that is already in flight,
    /// or begins a new one. A failed start resolves to `None` after the
    /// failure has been published; it is never an error.
    pub async fn ensure_started(&self, entry: &Arc<AppEntry>) -> Option<Arc<WorkerHandle>> {
        let start = {
            let mut state = entry.state.lock();
            if let Some(worker) = &state.running {
                return Some(Arc::clone(worker));
            }
            if entry.is_retired() && state.starting.is_none() {
                debug!(app = %entry.name(), "App is shut down, not starting a worker");
                return None;
            }
            match &state.starting {
                Some(start) => start.clone(),
                None => {
                    state.start_count += 1;
                    let generation = state.start_count;
                    let task = tokio::spawn(self.clone().run_start(Arc::clone(entry), generation));
                    let start = async move { task.await.ok().flatten() }.boxed().shared();
                    state.starting = Some(start.clone());
                    start
                }
            }
        };
        start.await
    }

    async fn run_start(self, entry: Arc<AppEntry>, generation: u64) -> Option<Arc<WorkerHandle>> {
        let result = self.launch(&entry, generation).await;

        let result = {
            let mut state = entry.state.lock();
            state.starting = None;
            match result {
                Ok(worker) => {
                    let alive = state.spawned.as_ref().is_some_and(|w| w.generation == generation);
                    if alive {
                        state.running = Some(Arc::clone(&worker));
                        Ok(worker)
                    } else {
                        let exit = state.exit.borrow().clone().unwrap_or(ExitResult::NotRunning);
                        Err(StartError::ExitedBeforeReady(exit))
                    }
                }
                Err(e) => Err(e),
            }
        };

        let app = Arc::clone(&entry.spec);
        match result {
            Ok(worker) => {
                info!(app = %app.name, pid = worker.pid, start_count = generation, "Worker is ready");
                self.bus.publish(Event::AppStart {
                    app,
                    pid: worker.pid,
                    start_count: generation,
                });
                Some(worker)
            }
            Err(e) => {
                let e = Arc::new(e);
                warn!(app = %app.name, start_count = generation, error = %e, "Worker failed to start");
                self.bus.publish(Event::AppError {
                    app: Arc::clone(&app),
                    failure: AppFailure::Start(Arc::clone(&e)),
                });
                self.bus.publish(Event::Error {
                    app,
                    error: Arc::new(ProxyError::App(e)),
                });
                None
            }
        }
    }

    /// Spawn the worker and wait for it to become ready
    async fn launch(&self, entry: &Arc<AppEntry>, generation: u64) -> Result<Arc<WorkerHandle>, StartError> {
        let spec = Arc::clone(&entry.spec);
        let mut cmd = self.command(&spec);

        #[cfg(unix)]
        let channel = if spec.kind.uses_ipc() {
            Some(IpcChannel::attach(&mut cmd).map_err(StartError::Channel)?)
        } else {
            None
        };
        #[cfg(not(unix))]
        if spec.kind.uses_ipc() {
            return Err(StartError::Channel(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "script and client workers require a Unix platform",
            )));
        }

        info!(
            app = %spec.name,
            kind = spec.kind.as_str(),
            path = %spec.kind.path().display(),
            start_count = generation,
            "Starting worker"
        );

        let mut child = cmd.spawn().map_err(StartError::Spawn)?;
        let pid = child.id();
        info!(app = %spec.name, pid, "Worker process spawned");

        #[cfg(unix)]
        let (ipc, messages) = match channel {
            Some((ipc, messages, child_end)) => {
                drop(child_end);
                (Some(ipc), Some(messages))
            }
            None => (None, None),
        };

        relay_output(&spec.name, &mut child);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let worker = Arc::new(WorkerHandle {
            generation,
            pid,
            handshake: spec.kind.uses_handshake(),
            #[cfg(unix)]
            ipc,
            control: control_tx,
            stop_requested: AtomicBool::new(false),
            exit: exit_rx.clone(),
        });

        {
            let mut state = entry.state.lock();
            state.spawned = Some(Arc::clone(&worker));
            state.exit = exit_rx.clone();
        }
        if entry.is_retired() {
            debug!(app = %spec.name, pid, "App was shut down during spawn, killing worker");
            worker.stop_requested.store(true, Ordering::SeqCst);
            worker.signal(Signal::Kill);
        }
        tokio::spawn(self.clone().monitor(
            Arc::clone(entry),
            Arc::clone(&worker),
            child,
            control_rx,
            exit_tx,
        ));

        #[cfg(unix)]
        let ready = self.await_readiness(&spec, &worker, messages, exit_rx).await;
        #[cfg(not(unix))]
        let ready = self.await_readiness(&spec, exit_rx).await;

        match ready {
            Ok(()) => Ok(worker),
            Err(e) => {
                if !matches!(e, StartError::ExitedBeforeReady(_)) {
                    worker.signal(Signal::Kill);
                }
                Err(e)
            }
        }
    }

    fn command(&self, spec: &AppSpec) -> Command {
        let mut cmd = match (&spec.kind, &self.config.script_runtime) {
            (LaunchKind::Executable(path), _) => Command::new(path),
            (kind, Some(runtime)) => {
                let mut cmd = Command::new(runtime);
                cmd.arg(kind.path());
                cmd
            }
            (kind, None) => Command::new(kind.path()),
        };
        cmd.args(&spec.params);
        cmd.stdin(Stdio::null());

        if spec.options.silent {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        if let Some(ref cwd) = spec.options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.options.env);
        cmd.kill_on_drop(true);
        cmd
    }

    #[cfg(unix)]
    async fn await_readiness(
        &self,
        spec: &AppSpec,
        worker: &WorkerHandle,
        messages: Option<mpsc::UnboundedReceiver<Message>>,
        exit: watch::Receiver<Option<ExitResult>>,
    ) -> Result<(), StartError> {
        let (true, Some(ipc), Some(messages)) = (spec.kind.uses_handshake(), &worker.ipc, messages) else {
            return wait_init_time(spec, exit).await;
        };

        let init = Message::Init {
            src: spec.primary_dst().clone(),
            connections: spec.connections.clone(),
            data: spec.data.clone(),
        };
        ipc.send(&init).await.map_err(StartError::Handshake)?;
        debug!(app = %spec.name, "Sent init message, waiting for readiness");

        let timeout = self.config.handshake_timeout();
        tokio::select! {
            _ = wait_ready(messages) => Ok(()),
            exit = wait_exit(exit) => Err(StartError::ExitedBeforeReady(exit)),
            _ = tokio::time::sleep(timeout) => Err(StartError::HandshakeTimeout(timeout)),
        }
    }

    #[cfg(not(unix))]
    async fn await_readiness(
        &self,
        spec: &AppSpec,
        exit: watch::Receiver<Option<ExitResult>>,
    ) -> Result<(), StartError> {
        wait_init_time(spec, exit).await
    }

    /// Reap the process, deliver stop signals, and publish its exit
    async fn monitor(
        self,
        entry: Arc<AppEntry>,
        worker: Arc<WorkerHandle>,
        mut child: Child,
        mut control: mpsc::UnboundedReceiver<Signal>,
        exit_tx: watch::Sender<Option<ExitResult>>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = control.recv() => deliver(&mut child, signal),
            }
        };
        let exit = match status {
            Ok(status) => ExitResult::from_status(status),
            Err(e) => ExitResult::Failed(e.to_string()),
        };

        let was_running = {
            let mut state = entry.state.lock();
            if state.spawned.as_ref().is_some_and(|w| w.generation == worker.generation) {
                state.spawned = None;
            }
            let was_running = state.running.as_ref().is_some_and(|w| w.generation == worker.generation);
            if was_running {
                state.running = None;
            }
            was_running
        };

        let app = Arc::clone(&entry.spec);
        let requested = worker.stop_requested.load(Ordering::SeqCst);
        info!(app = %app.name, pid = worker.pid, %exit, requested, "Worker exited");

        self.bus.publish(Event::AppStop {
            app: Arc::clone(&app),
            pid: worker.pid,
            exit: exit.clone(),
        });
        if was_running && !requested && !exit.success() {
            warn!(app = %app.name, pid = worker.pid, %exit, "Worker exited abnormally");
            self.bus.publish(Event::AppError {
                app,
                failure: AppFailure::Exit(exit.clone()),
            });
        }

        exit_tx.send_replace(Some(exit));
    }

    /// Stop the app's worker and wait for it to exit.
    ///
    /// Client workers are asked to exit over IPC; other kinds get SIGTERM,
    /// or SIGKILL when `force` is set. A worker that is still alive after
    /// the shutdown grace period is killed.
    pub async fn stop(&self, entry: &Arc<AppEntry>, force: bool) -> ExitResult {
        let (worker, exit) = {
            let state = entry.state.lock();
            (state.spawned.clone(), state.exit.clone())
        };

        let Some(worker) = worker else {
            let last = exit.borrow().clone();
            return last.unwrap_or(ExitResult::NotRunning);
        };
        worker.stop_requested.store(true, Ordering::SeqCst);

        if worker.handshake {
            info!(app = %entry.name(), pid = worker.pid, "Requesting worker exit");
            if let Err(e) = worker.request_exit().await {
                warn!(app = %entry.name(), error = %e, "Failed to send exit request, sending SIGTERM");
                worker.signal(Signal::Terminate);
            }
        } else {
            let signal = if force { Signal::Kill } else { Signal::Terminate };
            info!(app = %entry.name(), pid = worker.pid, ?signal, "Stopping worker");
            worker.signal(signal);
        }

        let grace_period = self.config.shutdown_grace_period();
        match tokio::time::timeout(grace_period, wait_exit(exit.clone())).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    app = %entry.name(),
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                worker.signal(Signal::Kill);
                wait_exit(exit).await
            }
        }
    }
}

fn deliver(child: &mut Child, signal: Signal) {
    match signal {
        Signal::Kill => {
            let _ = child.start_kill();
        }
        Signal::Terminate => {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }
    }
}

async fn wait_exit(mut exit: watch::Receiver<Option<ExitResult>>) -> ExitResult {
    let result = exit.wait_for(Option::is_some).await.map(|e| (*e).clone());
    match result {
        Ok(Some(exit)) => exit,
        _ => ExitResult::NotRunning,
    }
}

#[cfg(unix)]
async fn wait_ready(mut messages: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = messages.recv().await {
        if msg == Message::Ready {
            return;
        }
    }
    // Channel closed without readiness; the exit or timeout branch decides.
    std::future::pending::<()>().await
}

async fn wait_init_time(spec: &AppSpec, exit: watch::Receiver<Option<ExitResult>>) -> Result<(), StartError> {
    tokio::select! {
        _ = tokio::time::sleep(spec.init_time) => Ok(()),
        exit = wait_exit(exit) => Err(StartError::ExitedBeforeReady(exit)),
    }
}

/// Forward worker stdout/stderr to the log, line by line
fn relay_output(app: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(relay_lines(app.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_lines(app.to_string(), "stderr", stderr));
    }
}

/// Log each line of `reader`. Bytes that are not UTF-8 are replaced, and
/// the pipe is always read to EOF.
async fn relay_lines<R: AsyncRead + Unpin>(app: String, stream: &'static str, reader: R) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(target: "worker", app = %app, stream, "{}", text);
                }
            }
            Err(e) => {
                debug!(app = %app, stream, error = %e, "Failed to read worker output, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}
