//! Autostart - lazily started workers behind socket listeners
//!
//! This library lets a supervisor own the public addresses of a set of apps:
//! - Listens on each app's external TCP port or Unix socket immediately
//! - Spawns the app's worker process on the first inbound connection
//! - Splices every connection byte-for-byte to the worker's internal address
//! - Restarts a worker that died when the next connection arrives
//! - Hands client workers their addresses over an IPC handshake
//! - Publishes lifecycle events on a broadcast bus
//! - Shuts every listener and worker down together, gracefully or forcibly

pub mod app;
pub mod config;
pub mod error;
pub mod event;
#[cfg(unix)]
pub mod ipc;
pub mod net;
pub mod process;
pub mod proxy;
pub mod supervisor;
pub mod target;

pub use app::{AppDescriptor, AppSpec, ConnectionDescriptor, ConnectionSpec, LaunchKind, LaunchOptions};
pub use config::{Config, SupervisorConfig};
pub use error::{ConfigError, ErrorKind, ProxyError, StartError, SupervisorError};
pub use event::{AppFailure, Event, Subscription, Topic};
pub use process::{AppState, ExitResult, WorkerHandle};
pub use supervisor::{AppStatus, Supervisor};
pub use target::{Address, Target};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
