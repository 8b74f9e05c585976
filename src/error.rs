//! Error types for registration, worker startup and proxying
//!
//! Only [`ConfigError`] (and [`SupervisorError`] for unknown app names) ever
//! surfaces synchronously from the public API. Everything else is delivered
//! through the event bus as part of an [`Event`](crate::event::Event).

use crate::process::ExitResult;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// A descriptor or target could not be turned into an app
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A target was required but none was given
    #[error("unresolved target")]
    UnresolvedTarget,

    /// A target table carried neither a usable `port` nor `socket`
    #[error("unrecognized target: {0}")]
    UnrecognizedTarget(String),

    /// The descriptor has an empty name
    #[error("app descriptor requires a non-empty 'name'")]
    MissingName,

    /// None of `client`, `script` or `exe` was set
    #[error("app '{0}': one of 'client', 'script' or 'exe' is required")]
    MissingLaunchTarget(String),

    /// More than one of `client`, `script` or `exe` was set
    #[error("app '{name}': 'client', 'script' and 'exe' are mutually exclusive (got {kinds})")]
    AmbiguousLaunchTarget { name: String, kinds: String },

    /// An explicit but empty `connections` list
    #[error("app '{0}': 'connections' must not be empty")]
    NoConnections(String),

    /// `init_time` is negative or not a finite number
    #[error("app '{name}': invalid 'init_time' {value}")]
    InvalidInitTime { name: String, value: f64 },

    /// Resolving a connection endpoint failed
    #[error("app '{name}': {source}")]
    Connection {
        name: String,
        #[source]
        source: Box<ConfigError>,
    },
}

/// A worker could not be brought to readiness
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The OS refused to spawn the process
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// The IPC channel for a script or client worker could not be set up
    #[error("failed to set up worker IPC channel: {0}")]
    Channel(#[source] io::Error),

    /// The init message could not be delivered
    #[error("failed to send init message: {0}")]
    Handshake(#[source] io::Error),

    /// The worker never answered the init message
    #[error("worker did not signal readiness within {0:?}")]
    HandshakeTimeout(Duration),

    /// The worker went away before it was ready
    #[error("worker exited before becoming ready ({0})")]
    ExitedBeforeReady(ExitResult),
}

/// Asynchronous fault published as [`Event::Error`](crate::event::Event::Error)
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Fault on an externally accepted connection or its listener
    #[error("incoming connection error: {0}")]
    Incoming(#[source] io::Error),

    /// Fault dialing or using the internal connection to the worker
    #[error("outgoing connection error: {0}")]
    Outgoing(#[source] io::Error),

    /// The worker failed to start
    #[error("app error: {0}")]
    App(#[source] Arc<StartError>),
}

/// Classification of a [`ProxyError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Incoming,
    Outgoing,
    App,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Incoming(_) => ErrorKind::Incoming,
            ProxyError::Outgoing(_) => ErrorKind::Outgoing,
            ProxyError::App(_) => ErrorKind::App,
        }
    }
}

/// Errors returned by [`Supervisor`](crate::supervisor::Supervisor) methods
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown app: {0}")]
    UnknownApp(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
