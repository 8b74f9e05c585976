//! Control channel between the supervisor and script/client workers
//!
//! The channel is one end of a Unix socket pair, inherited by the worker as
//! file descriptor 3. Messages are single-line JSON objects terminated by
//! `\n`, which is the framing Node.js uses for `child_process.fork` in json
//! serialization mode. The environment advertises the descriptor through
//! `NODE_CHANNEL_FD`, so a Node worker can use `process.on("message")` and
//! `process.send()` unchanged.
//!
//! Wire contract:
//!
//! | direction       | message                                          |
//! |-----------------|--------------------------------------------------|
//! | parent → worker | `{"type":"#asc-init","src":..,"connections":..,"data":..}` |
//! | worker → parent | `{"type":"#asc-ready"}`                          |
//! | parent → worker | `{"type":"#asc-exit"}`                           |
//!
//! Lines that are not one of these are ignored on both sides.

use crate::app::ConnectionSpec;
use crate::target::Address;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Descriptor number the worker inherits the channel on
pub const CHILD_FD: RawFd = 3;

/// Environment variable naming the inherited descriptor
pub const CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";

const SERIALIZATION_ENV: &str = "NODE_CHANNEL_SERIALIZATION_MODE";

/// Control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Sent once after spawn to client workers
    #[serde(rename = "#asc-init")]
    Init {
        /// Internal address of the first connection
        src: Address,
        connections: Vec<ConnectionSpec>,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Worker is listening on its internal addresses
    #[serde(rename = "#asc-ready")]
    Ready,
    /// Worker should close its listeners and exit
    #[serde(rename = "#asc-exit")]
    Exit,
}

impl Message {
    /// Serialize as one newline-terminated line
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self).map_err(io::Error::from)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse one line; anything unrecognized yields `None`
    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Supervisor side of the channel
pub struct IpcChannel {
    writer: Mutex<OwnedWriteHalf>,
}

/// Worker end of a channel, kept open until the process has been spawned
pub struct ChildEnd {
    _stream: std::os::unix::net::UnixStream,
}

impl IpcChannel {
    /// Arrange for `cmd` to inherit a new channel as [`CHILD_FD`].
    ///
    /// Returns the parent side, a receiver for messages from the worker, and
    /// the worker end, which must be dropped once `cmd` has been spawned.
    pub fn attach(cmd: &mut Command) -> io::Result<(Self, mpsc::UnboundedReceiver<Message>, ChildEnd)> {
        let (parent, child) = std::os::unix::net::UnixStream::pair()?;
        let child_fd = child.as_raw_fd();

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if child_fd == CHILD_FD {
                    let flags = libc::fcntl(CHILD_FD, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(CHILD_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, CHILD_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.env(CHANNEL_FD_ENV, CHILD_FD.to_string());
        cmd.env(SERIALIZATION_ENV, "json");

        parent.set_nonblocking(true)?;
        let (channel, rx) = Self::from_stream(UnixStream::from_std(parent)?);
        Ok((channel, rx, ChildEnd { _stream: child }))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: UnixStream) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match Message::decode(&line) {
                        Some(msg) => {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                        None => debug!(line, "Ignoring unrecognized worker message"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Worker channel read failed");
                        break;
                    }
                }
            }
        });

        (Self { writer: Mutex::new(write) }, rx)
    }

    pub async fn send(&self, msg: &Message) -> io::Result<()> {
        let line = msg.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

/// Worker side of the channel
pub struct WorkerChannel {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl WorkerChannel {
    /// Open the channel inherited from the supervisor.
    ///
    /// Must be called at most once per process, from within a tokio runtime.
    pub fn from_env() -> io::Result<Self> {
        let fd: RawFd = std::env::var(CHANNEL_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, format!("{} is not set", CHANNEL_FD_ENV)))?
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid {}: {}", CHANNEL_FD_ENV, e)))?;

        // SAFETY: the supervisor hands over ownership of this descriptor.
        let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;
        Ok(Self::from_stream(UnixStream::from_std(stream)?))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Next recognized message, `None` once the supervisor side is closed
    pub async fn recv(&mut self) -> io::Result<Option<Message>> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(msg) = Message::decode(&line) {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        let line = msg.encode()?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn init_message() -> Message {
        Message::Init {
            src: Address::Socket(PathBuf::from("/tmp/a.sock")),
            connections: vec![ConnectionSpec {
                src: Address::Port(8080),
                dst: Address::Socket(PathBuf::from("/tmp/a.sock")),
            }],
            data: serde_json::json!({ "key": "value" }),
        }
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(Message::Ready.encode().unwrap(), b"{\"type\":\"#asc-ready\"}\n".to_vec());
        assert_eq!(Message::Exit.encode().unwrap(), b"{\"type\":\"#asc-exit\"}\n".to_vec());

        let line = String::from_utf8(init_message().encode().unwrap()).unwrap();
        assert_eq!(
            line,
            "{\"type\":\"#asc-init\",\"src\":\"/tmp/a.sock\",\"connections\":[{\"src\":8080,\"dst\":\"/tmp/a.sock\"}],\"data\":{\"key\":\"value\"}}\n"
        );
    }

    #[test]
    fn test_decode_ignores_foreign_messages() {
        assert_eq!(Message::decode("{\"type\":\"#asc-ready\"}"), Some(Message::Ready));
        assert_eq!(Message::decode("  {\"type\":\"#asc-exit\"}\r"), Some(Message::Exit));
        assert_eq!(Message::decode("{\"cmd\":\"NODE_HANDLE_ACK\"}"), None);
        assert_eq!(Message::decode("{\"type\":\"other\"}"), None);
        assert_eq!(Message::decode("not json"), None);
        assert_eq!(Message::decode(""), None);
    }

    #[tokio::test]
    async fn test_handshake_over_socket_pair() {
        let (parent, child) = UnixStream::pair().unwrap();
        let (channel, mut from_worker) = IpcChannel::from_stream(parent);
        let mut worker = WorkerChannel::from_stream(child);

        channel.send(&init_message()).await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), Some(init_message()));

        worker.send(&Message::Ready).await.unwrap();
        assert_eq!(from_worker.recv().await, Some(Message::Ready));

        channel.send(&Message::Exit).await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), Some(Message::Exit));

        drop(channel);
        assert_eq!(worker.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_parent_skips_unknown_lines() {
        let (parent, mut child) = UnixStream::pair().unwrap();
        let (_channel, mut from_worker) = IpcChannel::from_stream(parent);

        child.write_all(b"{\"cmd\":\"NODE_HANDLE\"}\n{\"type\":\"#asc-ready\"}\n").await.unwrap();
        assert_eq!(from_worker.recv().await, Some(Message::Ready));

        drop(child);
        assert_eq!(from_worker.recv().await, None);
    }
}
