//! Public listeners that start workers on demand and splice connections to them

use crate::app::ConnectionSpec;
use crate::config::SupervisorConfig;
use crate::error::ProxyError;
use crate::event::{Bus, Event};
#[cfg(unix)]
use crate::net::SocketFile;
use crate::net::{self, BoundListener, Stream};
use crate::process::{AppEntry, ProcessSupervisor};
use crate::target::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Public listener for one connection of an app.
///
/// Every accepted connection is spliced to the app's internal address,
/// starting the worker on demand. The listener tracks its live connections
/// so that [`close`](Listener::close) can wait for them to drain.
pub struct Listener {
    address: Address,
    live: Mutex<HashMap<u64, AbortHandle>>,
    drained: Notify,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    #[cfg(unix)]
    socket_file: Option<SocketFile>,
}

/// Times one connection may restart a worker that died before it could be
/// dialed. Refused dials to a live worker count against `dial_retries`.
const MAX_RESTARTS_PER_CONNECTION: u32 = 3;

/// Per-listener forwarding context, cloned into every connection task
#[derive(Clone)]
struct Forwarder {
    entry: Arc<AppEntry>,
    dst: Address,
    processes: ProcessSupervisor,
    bus: Bus,
    dial_retries: u32,
    dial_retry_interval: Duration,
}

impl Listener {
    /// Bind `conn.src` and start accepting.
    ///
    /// Binding happens before this returns, so a bad address is reported to
    /// the caller. Must be called from within a tokio runtime.
    pub fn open(
        entry: &Arc<AppEntry>,
        conn: &ConnectionSpec,
        processes: ProcessSupervisor,
        config: &SupervisorConfig,
        bus: Bus,
    ) -> io::Result<Arc<Self>> {
        let bound = BoundListener::bind(&conn.src, &config.bind)?;
        let address = bound.local_address().unwrap_or_else(|_| conn.src.clone());
        #[cfg(unix)]
        let socket_file = bound.socket_file();
        info!(app = %entry.name(), src = %address, dst = %conn.dst, "Listening");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = Arc::new(Self {
            address,
            live: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            next_id: AtomicU64::new(0),
            shutdown,
            accept_task: Mutex::new(None),
            #[cfg(unix)]
            socket_file,
        });

        let forwarder = Forwarder {
            entry: Arc::clone(entry),
            dst: conn.dst.clone(),
            processes,
            bus,
            dial_retries: config.dial_retries,
            dial_retry_interval: config.dial_retry_interval(),
        };
        let task = tokio::spawn(Arc::clone(&listener).accept_loop(bound, forwarder, shutdown_rx));
        *listener.accept_task.lock() = Some(task);

        Ok(listener)
    }

    /// Address actually bound; port 0 is resolved to the assigned port
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn live_connections(&self) -> usize {
        self.live.lock().len()
    }

    async fn accept_loop(self: Arc<Self>, bound: BoundListener, forwarder: Forwarder, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = bound.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(app = %forwarder.entry.name(), peer = %peer, "Accepted connection");
                            forwarder.bus.publish(Event::Connection {
                                app: Arc::clone(forwarder.entry.spec()),
                                peer,
                            });
                            self.track(forwarder.clone(), stream);
                        }
                        Err(e) => {
                            error!(app = %forwarder.entry.name(), src = %self.address, error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(app = %forwarder.entry.name(), src = %self.address, "Listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn track(self: &Arc<Self>, forwarder: Forwarder, stream: Stream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = LiveGuard {
            listener: Arc::clone(self),
            id,
        };
        // Hold the map while spawning so the guard cannot remove the id first.
        let mut live = self.live.lock();
        let task = tokio::spawn(async move {
            let _guard = guard;
            forwarder.handle(stream).await;
        });
        live.insert(id, task.abort_handle());
    }

    /// Stop accepting new connections and release the bound address.
    ///
    /// Live connections are left alone. The socket file of a Unix listener
    /// is removed unless something else has been bound at its path since.
    pub async fn stop_accepting(&self) {
        let _ = self.shutdown.send(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.release_path();
    }

    /// Stop accepting and wait for live connections to end.
    ///
    /// With `force` every live connection is torn down first. Otherwise the
    /// wait lasts until the peers disconnect. Closing twice is a no-op.
    pub async fn close(&self, force: bool) {
        self.stop_accepting().await;

        if force {
            let handles: Vec<AbortHandle> = self.live.lock().values().cloned().collect();
            if !handles.is_empty() {
                info!(src = %self.address, count = handles.len(), "Destroying live connections");
            }
            for handle in handles {
                handle.abort();
            }
        }

        loop {
            let drained = self.drained.notified();
            if self.live.lock().is_empty() {
                break;
            }
            drained.await;
        }
    }

    /// Tell the accept loop to stop and abort live connections without
    /// waiting for either. Used where no runtime may be awaited, e.g. `Drop`.
    pub(crate) fn shutdown_now(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<AbortHandle> = self.live.lock().values().cloned().collect();
        for handle in handles {
            handle.abort();
        }
        self.release_path();
    }

    fn release_path(&self) {
        #[cfg(unix)]
        if let Some(file) = &self.socket_file {
            if file.remove() {
                debug!(path = %file.path().display(), "Removed socket file");
            }
        }
    }
}

/// Removes a connection from its listener when the task ends or is aborted
struct LiveGuard {
    listener: Arc<Listener>,
    id: u64,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.listener.live.lock().remove(&self.id);
        self.listener.drained.notify_waiters();
    }
}

impl Forwarder {
    async fn handle(&self, inbound: Stream) {
        let Some(outbound) = self.dial().await else {
            return;
        };
        self.splice(inbound, outbound).await;
    }

    /// Get a ready worker and connect to it.
    ///
    /// After a refused dial the worker gets one retry interval to exit. A
    /// worker that exits is started again without using up the dial retries;
    /// one that stays up is dialed again up to `dial_retries` times.
    async fn dial(&self) -> Option<Stream> {
        let app = self.entry.name();
        let mut attempts = 0;
        let mut restarts = 0;
        loop {
            let worker = match self.entry.running() {
                Some(worker) => worker,
                None => match self.processes.ensure_started(&self.entry).await {
                    Some(worker) => worker,
                    None => {
                        debug!(app, "Worker unavailable, dropping connection");
                        return None;
                    }
                },
            };

            let e = match net::connect(&self.dst).await {
                Ok(stream) => return Some(stream),
                Err(e) => e,
            };

            let exited = tokio::time::timeout(self.dial_retry_interval, worker.exited()).await.is_ok();
            if exited && restarts < MAX_RESTARTS_PER_CONNECTION {
                restarts += 1;
                debug!(app, dst = %self.dst, restarts, "Worker went away before dial, restarting");
                continue;
            }
            if !exited && attempts < self.dial_retries {
                attempts += 1;
                debug!(app, dst = %self.dst, attempts, error = %e, "Worker refused connection, retrying");
                continue;
            }

            warn!(app, dst = %self.dst, error = %e, "Failed to connect to worker");
            self.bus.publish(Event::Error {
                app: Arc::clone(self.entry.spec()),
                error: Arc::new(ProxyError::Outgoing(e)),
            });
            return None;
        }
    }

    async fn splice(&self, inbound: Stream, mut outbound: Stream) {
        let app = self.entry.name();
        let mut inbound = Tracked::new(inbound);

        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((to_worker, to_client)) => {
                debug!(app, to_worker, to_client, "Connection closed");
            }
            Err(e) if inbound.failed => {
                debug!(app, error = %e, "Incoming connection failed");
                self.bus.publish(Event::Error {
                    app: Arc::clone(self.entry.spec()),
                    error: Arc::new(ProxyError::Incoming(e)),
                });
            }
            Err(e) if self.entry.is_running() => {
                debug!(app, error = %e, "Outgoing connection failed");
                self.bus.publish(Event::Error {
                    app: Arc::clone(self.entry.spec()),
                    error: Arc::new(ProxyError::Outgoing(e)),
                });
            }
            Err(e) => {
                debug!(app, error = %e, "Worker went away mid-connection");
            }
        }
    }
}

/// Stream wrapper that remembers whether its own I/O failed
struct Tracked<S> {
    inner: S,
    failed: bool,
}

impl<S> Tracked<S> {
    fn new(inner: S) -> Self {
        Self { inner, failed: false }
    }

    fn track<T>(&mut self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(_)) = &poll {
            self.failed = true;
        }
        poll
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.track(poll)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.track(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.track(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.track(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppDescriptor, AppSpec};
    use crate::error::ErrorKind;
    use crate::event::Topic;
    use crate::target::Target;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn config() -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.bind = "127.0.0.1".to_string();
        config.dial_retries = 0;
        config
    }

    fn entry_for(dst: u16) -> Arc<AppEntry> {
        let desc = AppDescriptor::exe("sleeper", "sleep")
            .with_params(["60"])
            .with_init_time(0.05)
            .with_src(Target::port(0))
            .with_dst(Target::port(dst));
        Arc::new(AppEntry::new(Arc::new(AppSpec::from_descriptor(&desc, Path::new("/tmp")).unwrap())))
    }

    fn open(entry: &Arc<AppEntry>, config: &SupervisorConfig, bus: &Bus) -> Arc<Listener> {
        let processes = ProcessSupervisor::new(Arc::new(config.clone()), bus.clone());
        Listener::open(entry, &entry.spec().connections[0], processes, config, bus.clone()).unwrap()
    }

    fn port_of(listener: &Listener) -> u16 {
        match listener.address() {
            Address::Port(port) => *port,
            other => panic!("expected a port, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_dial_publishes_outgoing_error() {
        let config = config();
        let bus = Bus::new(64);
        let mut events = bus.subscribe_to(&[Topic::Connection, Topic::Error]);
        let entry = entry_for(free_port());
        let listener = open(&entry, &config, &bus);

        let mut client = TcpStream::connect(("127.0.0.1", port_of(&listener))).await.unwrap();

        assert_eq!(events.recv().await.map(|e| e.topic()), Some(Topic::Connection));
        assert_eq!(events.recv().await.and_then(|e| e.error_kind()), Some(ErrorKind::Outgoing));

        // Connection is dropped after the failure
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);

        listener.close(true).await;
        ProcessSupervisor::new(Arc::new(config), bus).stop(&entry, true).await;
    }

    #[tokio::test]
    async fn test_splices_to_worker_address() {
        let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let config = config();
        let bus = Bus::new(64);
        let entry = entry_for(backend_port);
        let listener = open(&entry, &config, &bus);

        let mut client = TcpStream::connect(("127.0.0.1", port_of(&listener))).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(entry.is_running());
        assert_eq!(listener.live_connections(), 1);

        drop(client);
        listener.close(false).await;
        assert_eq!(listener.live_connections(), 0);
        ProcessSupervisor::new(Arc::new(config), bus).stop(&entry, true).await;
    }

    #[tokio::test]
    async fn test_forced_close_drops_live_connections() {
        let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = backend.accept().await {
                held.push(stream);
            }
        });

        let config = config();
        let bus = Bus::new(64);
        let entry = entry_for(backend_port);
        let listener = open(&entry, &config, &bus);
        let port = port_of(&listener);

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"x").await.unwrap();
            clients.push(client);
        }
        while listener.live_connections() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), listener.close(true))
            .await
            .expect("forced close should not wait for peers");
        assert_eq!(listener.live_connections(), 0);

        for mut client in clients {
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        }
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        ProcessSupervisor::new(Arc::new(config), bus).stop(&entry, true).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("public.sock");
        let desc = AppDescriptor::exe("sleeper", "sleep")
            .with_src(Target::path(&path))
            .with_dst(Target::port(free_port()));
        let entry = Arc::new(AppEntry::new(Arc::new(AppSpec::from_descriptor(&desc, dir.path()).unwrap())));

        let config = config();
        let listener = open(&entry, &config, &Bus::new(4));
        assert!(path.exists());

        listener.close(false).await;
        assert!(!path.exists());
        listener.close(false).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_keeps_socket_bound_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("public.sock");
        let desc = AppDescriptor::exe("sleeper", "sleep")
            .with_src(Target::path(&path))
            .with_dst(Target::port(free_port()));
        let entry = Arc::new(AppEntry::new(Arc::new(AppSpec::from_descriptor(&desc, dir.path()).unwrap())));
        let listener = open(&entry, &config(), &Bus::new(4));

        std::fs::remove_file(&path).unwrap();
        let newcomer = std::os::unix::net::UnixListener::bind(&path).unwrap();

        listener.close(false).await;
        assert!(path.exists());
        std::os::unix::net::UnixStream::connect(&path).unwrap();
        newcomer.accept().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_now_stops_accepting() {
        let config = config();
        let bus = Bus::new(64);
        let entry = entry_for(free_port());
        let listener = open(&entry, &config, &bus);
        let port = port_of(&listener);

        listener.shutdown_now();

        let refused = async {
            while TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), refused)
            .await
            .expect("listener should stop accepting");
        ProcessSupervisor::new(Arc::new(config), bus).stop(&entry, true).await;
    }
}
