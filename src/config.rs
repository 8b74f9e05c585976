use crate::app::AppDescriptor;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file for the `autostart` binary
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Supervisor-wide settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Apps to register at startup, in order
    #[serde(default)]
    pub apps: Vec<AppDescriptor>,
}

/// Settings shared by every app of one [`Supervisor`](crate::supervisor::Supervisor)
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Directory for named and generated sockets (default: system temp dir)
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Host TCP listeners bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Interpreter used to launch `script` and `client` apps, e.g. "node".
    /// When unset the script itself is executed.
    #[serde(default)]
    pub script_runtime: Option<String>,

    /// Maximum time a client app may take to answer `#asc-init`
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Dial attempts repeated against a live worker that refuses the connection
    #[serde(default = "default_dial_retries")]
    pub dial_retries: u32,

    /// Delay between dial attempts in milliseconds
    #[serde(default = "default_dial_retry_interval")]
    pub dial_retry_interval_ms: u64,

    /// Time a stopping worker gets before it is sent SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            bind: default_bind_address(),
            script_runtime: None,
            handshake_timeout_secs: default_handshake_timeout(),
            dial_retries: default_dial_retries(),
            dial_retry_interval_ms: default_dial_retry_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SupervisorConfig {
    /// Set the socket directory (builder pattern)
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Set the script interpreter (builder pattern)
    pub fn with_script_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.script_runtime = Some(runtime.into());
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dial_retry_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bind.trim().is_empty() {
            return Err("'bind' must not be empty".to_string());
        }
        if self.event_capacity == 0 {
            return Err("'event_capacity' must be greater than 0".to_string());
        }
        if matches!(self.script_runtime.as_deref(), Some(r) if r.trim().is_empty()) {
            return Err("'script_runtime' must not be empty when set".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_dial_retries() -> u32 {
    3
}

fn default_dial_retry_interval() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between the stop request and SIGKILL
}

fn default_event_capacity() -> usize {
    1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.supervisor.validate() {
            errors.push(e);
        }

        for app in &self.apps {
            if let Err(e) = app.kind() {
                errors.push(e.to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for app in &self.apps {
            if !seen.insert(app.name.as_str()) {
                errors.push(format!("app '{}' is defined more than once", app.name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[supervisor]
socket_dir = "/run/autostart"
bind = "127.0.0.1"
script_runtime = "node"
handshake_timeout_secs = 5

[[apps]]
name = "echo"
exe = "./echo"
params = ["--listen", "9001"]
src = 8080
dst = 9001
init_time = 0.5

[[apps]]
name = "api"
client = "server.js"
src = 8081
dst = { socket = true }
data = { greeting = "hi" }
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.supervisor.socket_dir, PathBuf::from("/run/autostart"));
        assert_eq!(config.supervisor.bind, "127.0.0.1");
        assert_eq!(config.supervisor.script_runtime.as_deref(), Some("node"));
        assert_eq!(config.supervisor.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.apps[0].name, "echo");
        assert_eq!(config.apps[0].src, Some(Target::Port(8080)));
        assert_eq!(config.apps[1].dst, Some(Target::auto_socket()));
        assert_eq!(config.apps[1].data["greeting"], "hi");
    }

    #[test]
    fn test_default_supervisor_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.socket_dir, std::env::temp_dir());
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.script_runtime, None);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.dial_retries, 3);
        assert_eq!(config.dial_retry_interval(), Duration::from_millis(100));
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(10));
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_ambiguous_app() {
        let config: Config = toml::from_str(
            r#"
[[apps]]
name = "broken"
client = "a.js"
script = "b.js"
src = 8080
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("mutually exclusive"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config: Config = toml::from_str(
            r#"
[[apps]]
name = "echo"
exe = "a"
src = 8080

[[apps]]
name = "echo"
exe = "b"
src = 8081
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("defined more than once"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.supervisor.event_capacity = 0;
        assert!(config.validate().is_err());
    }
}
