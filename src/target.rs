//! Resolution of endpoint descriptions into concrete addresses
//!
//! A [`Target`] is what a user writes in a descriptor (`8080`,
//! `"/run/app.sock"`, `{ socket = "name" }`, `{ socket = true }`, or
//! nothing at all). [`resolve`] turns it into an [`Address`] the proxy can
//! bind or dial. The socket-path mapping is shared with any other
//! implementation that uses the same socket directory, so it must not
//! change:
//!
//! - Windows: `\\.\pipe\<name>`
//! - elsewhere: `<cwd>/<socket_dir>/<name>.sock`, lexically normalized

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Length in bytes of the random part of a generated socket name
const GENERATED_NAME_BYTES: usize = 16;

/// A concrete listen or dial address
///
/// Serializes untagged: a port as a JSON number, a socket as a string. This
/// is the form workers receive in the `#asc-init` message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    /// TCP port
    Port(u16),
    /// Unix domain socket path (or named pipe on Windows)
    Socket(PathBuf),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Port(port) => write!(f, "port {}", port),
            Address::Socket(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Endpoint description as written in an app descriptor
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// Explicit TCP port
    Port(u16),
    /// Explicit socket path, used unchanged
    Path(PathBuf),
    /// Table form: `{ port = N }`, `{ socket = "name" }` or `{ socket = true }`
    Spec(TargetSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub socket: Option<SocketRequest>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SocketRequest {
    /// `true` asks for a generated socket; `false` is the same as absent
    Auto(bool),
    /// Named socket under the socket directory
    Named(String),
}

impl Target {
    pub fn port(port: u16) -> Self {
        Target::Port(port)
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Target::Path(path.into())
    }

    /// Named socket under the configured socket directory
    pub fn socket(name: impl Into<String>) -> Self {
        Target::Spec(TargetSpec {
            port: None,
            socket: Some(SocketRequest::Named(name.into())),
        })
    }

    /// Freshly generated socket under the configured socket directory
    pub fn auto_socket() -> Self {
        Target::Spec(TargetSpec {
            port: None,
            socket: Some(SocketRequest::Auto(true)),
        })
    }
}

impl From<u16> for Target {
    fn from(port: u16) -> Self {
        Target::Port(port)
    }
}

/// Resolve a target into an address.
///
/// With `autogenerate` set, a missing target (or `{ socket = true }`) yields
/// a random socket path under `socket_dir`. Without it, a missing target is
/// a [`ConfigError::UnresolvedTarget`]. No file is created.
pub fn resolve(
    target: Option<&Target>,
    socket_dir: &Path,
    autogenerate: bool,
) -> Result<Address, ConfigError> {
    let Some(target) = target else {
        if autogenerate {
            return Ok(Address::Socket(generate_socket(socket_dir)));
        }
        return Err(ConfigError::UnresolvedTarget);
    };

    match target {
        Target::Port(port) => Ok(Address::Port(*port)),
        Target::Path(path) => Ok(Address::Socket(path.clone())),
        Target::Spec(spec) => match (&spec.socket, spec.port) {
            (Some(SocketRequest::Auto(true)), _) => Ok(Address::Socket(generate_socket(socket_dir))),
            (Some(SocketRequest::Named(name)), _) => Ok(Address::Socket(make_socket(name, socket_dir))),
            (_, Some(port)) => Ok(Address::Port(port)),
            _ => Err(ConfigError::UnrecognizedTarget(format!("{:?}", spec))),
        },
    }
}

/// Deterministic socket path for `name`
#[cfg(windows)]
pub fn make_socket(name: &str, _socket_dir: &Path) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{}", name))
}

/// Deterministic socket path for `name`
#[cfg(not(windows))]
pub fn make_socket(name: &str, socket_dir: &Path) -> PathBuf {
    let joined = socket_dir.join(format!("{}.sock", name));
    let absolute = if joined.is_absolute() {
        joined
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(joined),
            Err(_) => joined,
        }
    };
    normalize(&absolute)
}

/// Random, collision-resistant socket path under `socket_dir`
pub fn generate_socket(socket_dir: &Path) -> PathBuf {
    let bytes: [u8; GENERATED_NAME_BYTES] = rand::random();
    make_socket(&hex::encode(bytes), socket_dir)
}

/// Lexically resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
