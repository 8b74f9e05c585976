//! Registry of apps and the public entry point of the crate

use crate::app::{AppDescriptor, AppSpec, ConnectionSpec};
use crate::config::SupervisorConfig;
use crate::error::{ConfigError, ProxyError, SupervisorError};
use crate::event::{Bus, Event, Subscription, Topic};
use crate::process::{AppEntry, AppState, ExitResult, ProcessSupervisor, WorkerHandle};
use crate::proxy::Listener;
use crate::target::Address;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Point-in-time view of one app
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub kind: &'static str,
    pub state: AppState,
    pub pid: Option<u32>,
    pub start_count: u64,
    /// Addresses the app's listeners are bound to
    pub listening: Vec<Address>,
    pub live_connections: usize,
}

/// Lazily starts workers behind their listeners and shuts them all down
/// together.
///
/// Apps are kept in registration order. Every method takes `&self`; share a
/// supervisor between tasks with an `Arc`.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    bus: Bus,
    processes: ProcessSupervisor,
    apps: Mutex<Vec<Arc<AppEntry>>>,
    /// Apps swapped out by a close that has not finished yet
    closing: Mutex<Vec<Arc<AppEntry>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let config = Arc::new(config);
        let bus = Bus::new(config.event_capacity);
        let processes = ProcessSupervisor::new(Arc::clone(&config), bus.clone());
        Self {
            config,
            bus,
            processes,
            apps: Mutex::new(Vec::new()),
            closing: Mutex::new(Vec::new()),
        }
    }

    /// Create a supervisor and register `apps` in order.
    ///
    /// Stops at the first invalid descriptor. The partly built supervisor is
    /// dropped with the error, which closes the listeners already opened.
    pub fn with_apps<'a>(
        apps: impl IntoIterator<Item = &'a AppDescriptor>,
        config: SupervisorConfig,
    ) -> Result<Self, ConfigError> {
        let supervisor = Self::new(config);
        for desc in apps {
            supervisor.add(desc)?;
        }
        Ok(supervisor)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Receive every lifecycle event published from now on
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Receive only events of the given topics
    pub fn subscribe_to(&self, topics: &[Topic]) -> Subscription {
        self.bus.subscribe_to(topics)
    }

    /// Register an app and start listening on its public addresses.
    ///
    /// No worker is spawned until the first connection arrives. A listener
    /// that fails to bind is reported as an incoming [`Event::Error`]; the
    /// app is still registered with its remaining listeners.
    ///
    /// Registering a name again replaces the previous app, which is closed
    /// in the background. Public addresses the previous app is listening on
    /// are taken over once it has stopped accepting, so they may show up in
    /// [`listening`](Self::listening) shortly after this returns. Must be
    /// called from within a tokio runtime.
    pub fn add(&self, desc: &AppDescriptor) -> Result<(), ConfigError> {
        let spec = Arc::new(AppSpec::from_descriptor(desc, &self.config.socket_dir)?);
        let entry = Arc::new(AppEntry::new(Arc::clone(&spec)));
        let opener = ListenerOpener {
            processes: self.processes.clone(),
            config: Arc::clone(&self.config),
            bus: self.bus.clone(),
        };

        let previous = self.apps.lock().iter().find(|e| e.name() == spec.name).cloned();
        let held: Vec<Address> = previous
            .map(|old| old.listeners().iter().map(|l| l.address().clone()).collect())
            .unwrap_or_default();

        let mut deferred = Vec::new();
        for conn in &spec.connections {
            if held.contains(&conn.src) {
                deferred.push(conn.clone());
            } else if let Some(listener) = opener.open(&entry, conn) {
                entry.add_listener(listener);
            }
        }

        let replaced = {
            let mut apps = self.apps.lock();
            match apps.iter().position(|e| e.name() == spec.name) {
                Some(i) => Some(std::mem::replace(&mut apps[i], Arc::clone(&entry))),
                None => {
                    apps.push(Arc::clone(&entry));
                    None
                }
            }
        };

        info!(app = %spec.name, kind = spec.kind.as_str(), connections = spec.connections.len(), "Registered app");

        let Some(old) = replaced else {
            for conn in &deferred {
                if let Some(listener) = opener.open(&entry, conn) {
                    entry.add_listener(listener);
                }
            }
            return Ok(());
        };

        warn!(app = %spec.name, "App registered again, closing the previous registration");
        tokio::spawn(async move {
            for listener in old.retire() {
                listener.stop_accepting().await;
            }
            for conn in &deferred {
                if let Some(listener) = opener.open(&entry, conn) {
                    if !entry.add_listener(Arc::clone(&listener)) {
                        listener.close(true).await;
                    }
                }
            }
            shutdown_entry(&opener.processes, &old, false).await;
        });

        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Arc<AppEntry>, SupervisorError> {
        self.apps
            .lock()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownApp(name.to_string()))
    }

    /// Start an app's worker without waiting for a connection.
    ///
    /// Joins a start already in flight. Resolves to `None` when the start
    /// failed; the failure itself is published on the bus.
    pub async fn start(&self, name: &str) -> Result<Option<Arc<WorkerHandle>>, SupervisorError> {
        let entry = self.entry(name)?;
        Ok(self.processes.ensure_started(&entry).await)
    }

    /// Stop an app's worker, leaving its listeners open.
    ///
    /// The next connection starts it again.
    pub async fn stop(&self, name: &str, force: bool) -> Result<ExitResult, SupervisorError> {
        let entry = self.entry(name)?;
        Ok(self.processes.stop(&entry, force).await)
    }

    /// Close every listener and stop every worker.
    ///
    /// Without `force`, waits for open connections to end on their own.
    /// Publishes [`Event::Closing`] before and [`Event::Closed`] after. The
    /// registry is emptied at once; apps added meanwhile are not closed. A
    /// graceful close abandoned midway can be followed by a forced one, which
    /// picks up the apps still shutting down.
    pub async fn close(&self, force: bool) {
        let apps = {
            let swapped = std::mem::take(&mut *self.apps.lock());
            let mut closing = self.closing.lock();
            closing.extend(swapped);
            closing.clone()
        };
        info!(apps = apps.len(), force, "Closing supervisor");
        self.bus.publish(Event::Closing);

        join_all(apps.iter().map(|entry| shutdown_entry(&self.processes, entry, force))).await;

        self.closing.lock().retain(|e| !apps.iter().any(|closed| Arc::ptr_eq(e, closed)));
        self.bus.publish(Event::Closed);
        info!("Supervisor closed");
    }

    /// Registered app names in registration order
    pub fn all(&self) -> Vec<String> {
        self.apps.lock().iter().map(|e| e.name().to_string()).collect()
    }

    pub fn status(&self) -> Vec<AppStatus> {
        let apps = self.apps.lock().clone();
        apps.iter()
            .map(|entry| AppStatus {
                name: entry.name().to_string(),
                kind: entry.spec().kind.as_str(),
                state: entry.state(),
                pid: entry.pid(),
                start_count: entry.start_count(),
                listening: entry.listeners().iter().map(|l| l.address().clone()).collect(),
                live_connections: entry.live_connections(),
            })
            .collect()
    }

    /// Bound public addresses of an app, in connection order
    pub fn listening(&self, name: &str) -> Result<Vec<Address>, SupervisorError> {
        let entry = self.entry(name)?;
        Ok(entry.listeners().iter().map(|l| l.address().clone()).collect())
    }
}

impl Drop for Supervisor {
    /// Stop accepting on every listener and kill every worker still owned by
    /// this supervisor, without waiting for either.
    fn drop(&mut self) {
        let mut apps = std::mem::take(self.apps.get_mut());
        apps.append(self.closing.get_mut());
        if apps.is_empty() {
            return;
        }
        warn!(apps = apps.len(), "Supervisor dropped without close, tearing down apps");
        for entry in apps {
            for listener in entry.retire() {
                listener.shutdown_now();
            }
            entry.kill_now();
        }
    }
}

/// What it takes to open listeners outside of `&Supervisor`
struct ListenerOpener {
    processes: ProcessSupervisor,
    config: Arc<SupervisorConfig>,
    bus: Bus,
}

impl ListenerOpener {
    /// Open one listener, publishing a bind failure as an incoming error
    fn open(&self, entry: &Arc<AppEntry>, conn: &ConnectionSpec) -> Option<Arc<Listener>> {
        match Listener::open(entry, conn, self.processes.clone(), &self.config, self.bus.clone()) {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(app = %entry.name(), src = %conn.src, error = %e, "Failed to open listener");
                self.bus.publish(Event::Error {
                    app: Arc::clone(entry.spec()),
                    error: Arc::new(ProxyError::Incoming(e)),
                });
                None
            }
        }
    }
}

/// Close an app's listeners, then stop its worker
async fn shutdown_entry(processes: &ProcessSupervisor, entry: &Arc<AppEntry>, force: bool) {
    for listener in entry.retire() {
        listener.close(force).await;
    }
    let exit = processes.stop(entry, force).await;
    info!(app = %entry.name(), %exit, "App shut down");
}
