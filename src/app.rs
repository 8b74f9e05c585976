//! App descriptors and their normalized form
//!
//! An [`AppDescriptor`] is the loose, user-facing shape (the `[[apps]]`
//! table of the config file, or a value built in code). Registration turns
//! it into an immutable [`AppSpec`]: the launch kind is chosen once, every
//! endpoint is resolved to an [`Address`], and defaults are filled in.

use crate::error::ConfigError;
use crate::target::{self, Address, Target};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Readiness delay used when a descriptor does not set `init_time`
pub const DEFAULT_INIT_TIME_SECS: f64 = 5.0;

/// User-supplied description of an app
///
/// # Security Warning
///
/// `client`, `script` and `exe` are executed with the permissions of the
/// supervisor. Only register descriptors from trusted sources.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppDescriptor {
    /// Unique app name
    #[serde(default)]
    pub name: String,

    /// Script that takes part in the `#asc-init`/`#asc-ready` handshake
    pub client: Option<PathBuf>,

    /// Script launched with an IPC channel but no handshake
    pub script: Option<PathBuf>,

    /// Plain executable
    pub exe: Option<PathBuf>,

    /// Arguments passed to the worker
    #[serde(default)]
    pub params: Vec<String>,

    /// Working directory (overridden by `options.cwd`)
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub options: LaunchOptions,

    /// External address of the single default connection
    pub src: Option<Target>,

    /// Internal address of the single default connection
    pub dst: Option<Target>,

    /// Explicit connection pairs; replaces `src`/`dst` when present
    pub connections: Option<Vec<ConnectionDescriptor>>,

    /// Seconds to wait before assuming a non-client worker is ready
    pub init_time: Option<f64>,

    /// Opaque payload forwarded to client workers in `#asc-init`
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Process options for a worker
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct LaunchOptions {
    /// Working directory
    pub cwd: Option<PathBuf>,

    /// Discard worker stdout/stderr instead of relaying them to the log
    #[serde(default)]
    pub silent: bool,

    /// Extra environment variables, added on top of the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One `{ src, dst }` pair as written in a descriptor
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ConnectionDescriptor {
    pub src: Option<Target>,
    pub dst: Option<Target>,
}

/// How a worker is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchKind {
    /// Script with IPC channel and readiness handshake
    Client(PathBuf),
    /// Script with IPC channel, readiness after `init_time`
    Script(PathBuf),
    /// Plain process, readiness after `init_time`
    Executable(PathBuf),
}

impl LaunchKind {
    /// Script or executable path
    pub fn path(&self) -> &Path {
        match self {
            LaunchKind::Client(p) | LaunchKind::Script(p) | LaunchKind::Executable(p) => p,
        }
    }

    /// Whether the worker is launched with an IPC channel
    pub fn uses_ipc(&self) -> bool {
        matches!(self, LaunchKind::Client(_) | LaunchKind::Script(_))
    }

    /// Whether readiness is signalled with `#asc-ready`
    pub fn uses_handshake(&self) -> bool {
        matches!(self, LaunchKind::Client(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchKind::Client(_) => "client",
            LaunchKind::Script(_) => "script",
            LaunchKind::Executable(_) => "exe",
        }
    }
}

/// Resolved external/internal address pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub src: Address,
    pub dst: Address,
}

/// Normalized, immutable description of a registered app
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    pub name: String,
    pub kind: LaunchKind,
    pub params: Vec<String>,
    pub options: LaunchOptions,
    /// Never empty
    pub connections: Vec<ConnectionSpec>,
    pub init_time: Duration,
    pub data: serde_json::Value,
}

impl AppSpec {
    /// Normalize a descriptor, resolving every endpoint against `socket_dir`
    pub fn from_descriptor(desc: &AppDescriptor, socket_dir: &Path) -> Result<Self, ConfigError> {
        let kind = desc.kind()?;
        let name = desc.name.clone();

        let pairs = match &desc.connections {
            Some(list) if list.is_empty() => return Err(ConfigError::NoConnections(name)),
            Some(list) => list.clone(),
            None => vec![ConnectionDescriptor {
                src: desc.src.clone(),
                dst: desc.dst.clone(),
            }],
        };

        let connections = pairs
            .iter()
            .map(|pair| {
                Ok(ConnectionSpec {
                    src: target::resolve(pair.src.as_ref(), socket_dir, false)?,
                    dst: target::resolve(pair.dst.as_ref(), socket_dir, true)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()
            .map_err(|e| ConfigError::Connection {
                name: name.clone(),
                source: Box::new(e),
            })?;

        let secs = desc.init_time.unwrap_or(DEFAULT_INIT_TIME_SECS);
        let init_time = Duration::try_from_secs_f64(secs)
            .map_err(|_| ConfigError::InvalidInitTime { name: name.clone(), value: secs })?;

        let mut options = desc.options.clone();
        if options.cwd.is_none() {
            options.cwd = desc.dir.clone();
        }

        let data = match &desc.data {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };

        Ok(Self {
            name,
            kind,
            params: desc.params.clone(),
            options,
            connections,
            init_time,
            data,
        })
    }

    /// The first connection's internal address, sent as `src` in `#asc-init`
    pub fn primary_dst(&self) -> &Address {
        &self.connections[0].dst
    }
}

impl AppDescriptor {
    fn with_kind(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Create a client-kind descriptor
    pub fn client(name: &str, path: impl Into<PathBuf>) -> Self {
        let mut desc = Self::with_kind(name);
        desc.client = Some(path.into());
        desc
    }

    /// Create a script-kind descriptor
    pub fn script(name: &str, path: impl Into<PathBuf>) -> Self {
        let mut desc = Self::with_kind(name);
        desc.script = Some(path.into());
        desc
    }

    /// Create an executable-kind descriptor
    pub fn exe(name: &str, path: impl Into<PathBuf>) -> Self {
        let mut desc = Self::with_kind(name);
        desc.exe = Some(path.into());
        desc
    }

    /// Set arguments (builder pattern)
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Set the external address (builder pattern)
    pub fn with_src(mut self, src: Target) -> Self {
        self.src = Some(src);
        self
    }

    /// Set the internal address (builder pattern)
    pub fn with_dst(mut self, dst: Target) -> Self {
        self.dst = Some(dst);
        self
    }

    /// Set explicit connection pairs (builder pattern)
    pub fn with_connections(mut self, connections: Vec<ConnectionDescriptor>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Set the readiness delay in seconds (builder pattern)
    pub fn with_init_time(mut self, secs: f64) -> Self {
        self.init_time = Some(secs);
        self
    }

    /// Set the init payload (builder pattern)
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Set process options (builder pattern)
    pub fn with_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    /// Determine the launch kind from the mutually exclusive launch fields
    pub fn kind(&self) -> Result<LaunchKind, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }

        let mut present = Vec::new();
        if let Some(p) = &self.client {
            present.push(LaunchKind::Client(p.clone()));
        }
        if let Some(p) = &self.script {
            present.push(LaunchKind::Script(p.clone()));
        }
        if let Some(p) = &self.exe {
            present.push(LaunchKind::Executable(p.clone()));
        }

        match present.len() {
            0 => Err(ConfigError::MissingLaunchTarget(self.name.clone())),
            1 => Ok(present.remove(0)),
            _ => Err(ConfigError::AmbiguousLaunchTarget {
                name: self.name.clone(),
                kinds: present.iter().map(LaunchKind::as_str).collect::<Vec<_>>().join(", "),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_dir() -> PathBuf {
        PathBuf::from("/tmp/autostart-test")
    }

    #[test]
    fn test_kind_selection() {
        let spec = AppSpec::from_descriptor(&AppDescriptor::client("a", "a.js").with_src(Target::port(8080)), &socket_dir()).unwrap();
        assert_eq!(spec.kind, LaunchKind::Client(PathBuf::from("a.js")));
        assert!(spec.kind.uses_handshake());

        let spec = AppSpec::from_descriptor(&AppDescriptor::script("b", "b.js").with_src(Target::port(8080)), &socket_dir()).unwrap();
        assert!(spec.kind.uses_ipc());
        assert!(!spec.kind.uses_handshake());

        let spec = AppSpec::from_descriptor(&AppDescriptor::exe("c", "/bin/c").with_src(Target::port(8080)), &socket_dir()).unwrap();
        assert_eq!(spec.kind.path(), Path::new("/bin/c"));
        assert!(!spec.kind.uses_ipc());
    }

    #[test]
    fn test_ambiguous_kind_is_rejected() {
        let mut desc = AppDescriptor::client("both", "a.js").with_src(Target::port(8080));
        desc.script = Some(PathBuf::from("b.js"));

        let err = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap_err();
        match err {
            ConfigError::AmbiguousLaunchTarget { name, kinds } => {
                assert_eq!(name, "both");
                assert_eq!(kinds, "client, script");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_kind_and_name_are_rejected() {
        let desc = AppDescriptor {
            name: "nothing".to_string(),
            src: Some(Target::Port(8080)),
            ..Default::default()
        };
        assert!(matches!(
            AppSpec::from_descriptor(&desc, &socket_dir()),
            Err(ConfigError::MissingLaunchTarget(_))
        ));

        let desc = AppDescriptor::exe("", "/bin/true").with_src(Target::port(8080));
        assert!(matches!(
            AppSpec::from_descriptor(&desc, &socket_dir()),
            Err(ConfigError::MissingName)
        ));
    }

    #[test]
    fn test_default_connection_from_src_dst() {
        let desc = AppDescriptor::exe("echo", "/bin/echo").with_src(Target::port(8080)).with_dst(Target::port(9001));
        let spec = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap();

        assert_eq!(
            spec.connections,
            vec![ConnectionSpec {
                src: Address::Port(8080),
                dst: Address::Port(9001),
            }]
        );
        assert_eq!(spec.primary_dst(), &Address::Port(9001));
        assert_eq!(spec.init_time, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_dst_generates_socket() {
        let desc = AppDescriptor::client("implicit", "a.js").with_src(Target::port(8080));
        let spec = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap();

        match spec.primary_dst() {
            Address::Socket(path) => assert!(path.starts_with(socket_dir())),
            other => panic!("expected generated socket, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_src_is_rejected() {
        let desc = AppDescriptor::client("nosrc", "a.js").with_dst(Target::port(9001));
        let err = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap_err();

        match err {
            ConfigError::Connection { name, source } => {
                assert_eq!(name, "nosrc");
                assert!(matches!(*source, ConfigError::UnresolvedTarget));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_connections_replace_src_dst() {
        let desc = AppDescriptor::client("multi", "a.js")
            .with_src(Target::port(1111))
            .with_connections(vec![
                ConnectionDescriptor { src: Some(Target::Port(8080)), dst: None },
                ConnectionDescriptor { src: Some(Target::Port(8081)), dst: Some(Target::Port(9001)) },
            ]);
        let spec = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap();

        assert_eq!(spec.connections.len(), 2);
        assert_eq!(spec.connections[0].src, Address::Port(8080));
        assert!(matches!(spec.connections[0].dst, Address::Socket(_)));
        assert_eq!(spec.connections[1].dst, Address::Port(9001));

        let empty = AppDescriptor::client("none", "a.js").with_connections(Vec::new());
        assert!(matches!(
            AppSpec::from_descriptor(&empty, &socket_dir()),
            Err(ConfigError::NoConnections(_))
        ));
    }

    #[test]
    fn test_options_and_data_defaults() {
        let mut desc = AppDescriptor::script("opts", "a.js").with_src(Target::port(8080)).with_init_time(0.25);
        desc.dir = Some(PathBuf::from("/srv/app"));
        let spec = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap();

        assert_eq!(spec.options.cwd, Some(PathBuf::from("/srv/app")));
        assert_eq!(spec.data, serde_json::json!({}));
        assert_eq!(spec.init_time, Duration::from_millis(250));

        let desc = desc.with_options(LaunchOptions {
            cwd: Some(PathBuf::from("/override")),
            silent: true,
            env: HashMap::new(),
        });
        let spec = AppSpec::from_descriptor(&desc, &socket_dir()).unwrap();
        assert_eq!(spec.options.cwd, Some(PathBuf::from("/override")));
        assert!(spec.options.silent);
    }

    #[test]
    fn test_negative_init_time_is_rejected() {
        let desc = AppDescriptor::exe("neg", "/bin/true").with_src(Target::port(8080)).with_init_time(-1.0);
        assert!(matches!(
            AppSpec::from_descriptor(&desc, &socket_dir()),
            Err(ConfigError::InvalidInitTime { .. })
        ));
    }
}
