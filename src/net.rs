//! TCP and Unix socket plumbing keyed on [`Address`]

use crate::target::Address;
use std::io;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Host workers are dialed on when their internal address is a port
const LOOPBACK: &str = "127.0.0.1";

/// A bound, listening socket
pub enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, SocketFile),
}

impl BoundListener {
    /// Bind and listen on `addr`. Ports bind on `host`.
    ///
    /// Binding is synchronous so registration can report failures at once,
    /// but it must run inside a tokio runtime. A socket file nobody listens
    /// on is replaced; any other file at the target path, or a socket that
    /// still accepts connections, fails with [`io::ErrorKind::AddrInUse`].
    pub fn bind(addr: &Address, host: &str) -> io::Result<Self> {
        match addr {
            Address::Port(port) => {
                let listener = std::net::TcpListener::bind((host, *port))?;
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Tcp(TcpListener::from_std(listener)?))
            }
            #[cfg(unix)]
            Address::Socket(path) => {
                clear_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                let file = SocketFile::of(path)?;
                Ok(BoundListener::Unix(listener, file))
            }
            #[cfg(not(unix))]
            Address::Socket(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("socket listeners are not supported on this platform: {}", path.display()),
            )),
        }
    }

    /// Accept one connection, returning it with a printable peer address
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            BoundListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            BoundListener::Unix(listener, _) => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix".to_string());
                Ok((Stream::Unix(stream), peer))
            }
        }
    }

    /// Actual bound address; resolves port 0 to the assigned port
    pub fn local_address(&self) -> io::Result<Address> {
        match self {
            BoundListener::Tcp(listener) => Ok(Address::Port(listener.local_addr()?.port())),
            #[cfg(unix)]
            BoundListener::Unix(listener, _) => listener
                .local_addr()?
                .as_pathname()
                .map(|p| Address::Socket(p.to_path_buf()))
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unnamed unix listener")),
        }
    }

    /// The socket file created by this bind, if any
    #[cfg(unix)]
    pub fn socket_file(&self) -> Option<SocketFile> {
        match self {
            BoundListener::Tcp(_) => None,
            BoundListener::Unix(_, file) => Some(file.clone()),
        }
    }
}

/// Socket file created by a bind, identified by device, inode and change
/// time. A later bind at the same path is a different file even when the
/// inode number is reused.
#[cfg(unix)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFile {
    path: PathBuf,
    dev: u64,
    ino: u64,
    ctime: (i64, i64),
}

#[cfg(unix)]
impl SocketFile {
    fn of(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            dev: meta.dev(),
            ino: meta.ino(),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the file if it is still the one this bind created.
    ///
    /// Returns whether a file was removed.
    pub fn remove(&self) -> bool {
        match Self::of(&self.path) {
            Ok(current) if current == *self => std::fs::remove_file(&self.path).is_ok(),
            _ => false,
        }
    }
}

/// Make room for a bind at `path`.
///
/// Only a socket that refuses connections is removed.
#[cfg(unix)]
fn clear_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by another listener", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}

/// Dial `addr`. Ports are dialed on loopback.
pub async fn connect(addr: &Address) -> io::Result<Stream> {
    match addr {
        Address::Port(port) => {
            let stream = TcpStream::connect((LOOPBACK, *port)).await?;
            let _ = stream.set_nodelay(true);
            Ok(Stream::Tcp(stream))
        }
        #[cfg(unix)]
        Address::Socket(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Address::Socket(path) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("socket connections are not supported on this platform: {}", path.display()),
        )),
    }
}

/// Connected TCP or Unix stream
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = BoundListener::bind(&Address::Port(0), "127.0.0.1").unwrap();
        let addr = listener.local_address().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = connect(&addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let addr = Address::Socket(path.clone());
        let listener = BoundListener::bind(&addr, "127.0.0.1").unwrap();
        assert_eq!(listener.local_address().unwrap(), addr);

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        connect(&addr).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_keeps_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"keep me").unwrap();

        let err = BoundListener::bind(&Address::Socket(path.clone()), "127.0.0.1").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _live = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let err = BoundListener::bind(&Address::Socket(path.clone()), "127.0.0.1").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(std::os::unix::net::UnixStream::connect(&path).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_file_removes_only_its_own_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.sock");
        let addr = Address::Socket(path.clone());

        let first = BoundListener::bind(&addr, "127.0.0.1").unwrap();
        let first_file = first.socket_file().unwrap();
        let moved = dir.path().join("moved.sock");
        std::fs::rename(&path, &moved).unwrap();

        let second = BoundListener::bind(&addr, "127.0.0.1").unwrap();
        assert!(!first_file.remove());
        assert!(path.exists());
        assert!(moved.exists());

        drop(first);
        assert!(second.socket_file().unwrap().remove());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(connect(&Address::Port(port)).await.is_err());
    }
}
