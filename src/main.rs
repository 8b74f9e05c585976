use autostart::{Config, Event, Supervisor, PKG_NAME, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autostart=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("autostart.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let grace_period = config.supervisor.shutdown_grace_period();
    let supervisor = Supervisor::new(config.supervisor.clone());

    let mut events = supervisor.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    for app in &config.apps {
        supervisor.add(app)?;
    }

    for status in supervisor.status() {
        info!(
            app = %status.name,
            kind = status.kind,
            listening = ?status.listening.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "App ready for connections"
        );
    }

    wait_for_shutdown_signal().await;

    info!("Closing all apps...");
    if tokio::time::timeout(grace_period, supervisor.close(false)).await.is_err() {
        warn!(
            grace_period_secs = grace_period.as_secs(),
            "Graceful close timed out, forcing remaining connections closed"
        );
        supervisor.close(true).await;
    }

    drop(supervisor);
    let _ = tokio::time::timeout(Duration::from_secs(1), event_logger).await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT (Ctrl+C), shutting down...");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

fn log_event(event: &Event) {
    match event {
        Event::Connection { app, peer } => {
            tracing::debug!(app = %app.name, peer = %peer, "Inbound connection");
        }
        Event::AppStart { app, pid, start_count } => {
            info!(app = %app.name, pid = ?pid, start_count, "App started");
        }
        Event::AppStop { app, pid, exit } => {
            info!(app = %app.name, pid = ?pid, %exit, "App stopped");
        }
        Event::AppError { app, failure } => {
            warn!(app = %app.name, failure = ?failure, "App error");
        }
        Event::Error { app, error } => {
            warn!(app = %app.name, kind = ?error.kind(), error = %error, "Proxy error");
        }
        Event::Closing => info!("Closing"),
        Event::Closed => info!("Closed"),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        bind = %config.supervisor.bind,
        socket_dir = %config.supervisor.socket_dir.display(),
        script_runtime = config.supervisor.script_runtime.as_deref().unwrap_or("(direct)"),
        handshake_timeout_secs = config.supervisor.handshake_timeout_secs,
        shutdown_grace_period_secs = config.supervisor.shutdown_grace_period_secs,
        "Supervisor configuration"
    );
    info!(apps = config.apps.len(), "Apps configured");
}
