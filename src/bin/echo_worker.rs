//! Echo worker for trying out and testing the supervisor
//!
//! Echoes every byte it receives back to the sender.
//!
//! Environment variables:
//! - LISTEN: Port or socket path to listen on (plain `exe` mode)
//! - STARTUP_DELAY_MS: Delay before listening and signalling readiness (default: 0)
//! - NODE_CHANNEL_FD: Set by the supervisor for `client` apps. The worker then
//!   waits for `#asc-init`, listens on every connection's `dst`, answers
//!   `#asc-ready` and exits on `#asc-exit`.

use anyhow::{bail, Context, Result};
use autostart::net::{BoundListener, Stream};
use autostart::Address;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("echo worker: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    #[cfg(unix)]
    if env::var_os(autostart::ipc::CHANNEL_FD_ENV).is_some() {
        return run_client().await;
    }

    let listen = env::var("LISTEN").context("LISTEN environment variable required")?;
    let addr = parse_address(&listen);
    let listener = BoundListener::bind(&addr, "127.0.0.1").with_context(|| format!("failed to bind {}", addr))?;
    eprintln!("echo worker: listening on {}", addr);
    serve(listener).await;
    Ok(())
}

#[cfg(unix)]
async fn run_client() -> Result<()> {
    use autostart::ipc::{Message, WorkerChannel};

    let mut channel = WorkerChannel::from_env().context("failed to open supervisor channel")?;
    let connections = match channel.recv().await? {
        Some(Message::Init { connections, .. }) => connections,
        Some(other) => bail!("expected init message, got {:?}", other),
        None => bail!("supervisor closed the channel before init"),
    };

    let mut sockets = Vec::new();
    for conn in &connections {
        let listener = BoundListener::bind(&conn.dst, "127.0.0.1")
            .with_context(|| format!("failed to bind {}", conn.dst))?;
        eprintln!("echo worker: listening on {} for {}", conn.dst, conn.src);
        if let Address::Socket(path) = &conn.dst {
            sockets.push(path.clone());
        }
        tokio::spawn(serve(listener));
    }

    channel.send(&Message::Ready).await?;

    loop {
        match channel.recv().await? {
            Some(Message::Exit) | None => break,
            Some(_) => {}
        }
    }

    eprintln!("echo worker: exiting");
    for path in sockets {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn parse_address(value: &str) -> Address {
    match value.parse::<u16>() {
        Ok(port) => Address::Port(port),
        Err(_) => Address::Socket(PathBuf::from(value)),
    }
}

async fn serve(listener: BoundListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                eprintln!("echo worker: connection from {}", peer);
                tokio::spawn(echo(stream));
            }
            Err(e) => {
                eprintln!("echo worker: accept error: {}", e);
            }
        }
    }
}

async fn echo(stream: Stream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    if tokio::io::copy(&mut reader, &mut writer).await.is_ok() {
        let _ = writer.shutdown().await;
    }
}
