//! Transport layer for the name server.
//!
//! # Rust Learning Note
//!
//! This module demonstrates **platform-specific code** in Rust.
//!
//! ```rust,ignore
//! #[cfg(unix)]
//! UnixSocket(PathBuf),
//! ```
//!
//! Unix domain sockets only exist in Unix builds; on other targets the
//! variant is not compiled at all, so there is nothing to forget to handle.
//!
//! ## Binding happens twice
//!
//! Listeners are bound with `std::net` on the caller's thread, so a bind
//! failure comes back from `NameServer::start()` synchronously. They are then
//! handed to the worker and registered with its runtime there
//! (`Listener::from_bound`), because a tokio listener belongs to the runtime
//! it was created in.

use hsu_common::{Error, Result};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

#[cfg(unix)]
use std::path::PathBuf;

/// Where a transport lives.
///
/// Formats:
/// - `tcp://host:port` (`tcp://*:port` binds all interfaces)
/// - `unix:///path/to/socket` (Unix only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    /// TCP address (host:port).
    Tcp(String),

    /// Unix domain socket path.
    #[cfg(unix)]
    UnixSocket(PathBuf),
}

impl TransportAddress {
    /// Parses a transport address from a string.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| Error::invalid_address(s, "expected tcp://host:port"))?;
            if host.is_empty() {
                return Err(Error::invalid_address(s, "missing host"));
            }
            port.parse::<u16>()
                .map_err(|_| Error::invalid_address(s, format!("invalid port '{}'", port)))?;

            let host = if host == "*" { "0.0.0.0" } else { host };
            Ok(Self::Tcp(format!("{}:{}", host, port)))
        } else if let Some(path) = s.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(Error::invalid_address(s, "missing socket path"));
                }
                Ok(Self::UnixSocket(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(Error::invalid_address(s, "Unix sockets not supported on this platform"))
            }
        } else {
            Err(Error::invalid_address(s, "expected tcp:// or unix:// scheme"))
        }
    }

    /// Binds a listener on this address.
    ///
    /// A stale Unix socket file at the path is removed first.
    pub fn bind(&self) -> Result<BoundListener> {
        match self {
            TransportAddress::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr.as_str())
                    .map_err(|e| Error::transport(format!("bind {}: {}", self, e)))?;
                listener.set_nonblocking(true)?;
                let local = TransportAddress::Tcp(listener.local_addr()?.to_string());
                debug!(address = %local, "Bound TCP listener");
                Ok(BoundListener {
                    inner: StdListener::Tcp(listener),
                    local,
                })
            }

            #[cfg(unix)]
            TransportAddress::UnixSocket(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = std::os::unix::net::UnixListener::bind(path)
                    .map_err(|e| Error::transport(format!("bind {}: {}", self, e)))?;
                listener.set_nonblocking(true)?;
                debug!(path = %path.display(), "Bound Unix socket listener");
                Ok(BoundListener {
                    inner: StdListener::Unix(listener),
                    local: self.clone(),
                })
            }
        }
    }

    /// Opens a client connection to this address.
    pub async fn connect(&self) -> Result<Box<dyn Connection>> {
        match self {
            TransportAddress::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| Error::transport(format!("connect {}: {}", self, e)))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }

            #[cfg(unix)]
            TransportAddress::UnixSocket(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::transport(format!("connect {}: {}", self, e)))?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl FromStr for TransportAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            TransportAddress::UnixSocket(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Any bidirectional byte stream a transport can hand out.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

enum StdListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

/// A listener bound on the caller's thread, not yet attached to a runtime.
pub struct BoundListener {
    inner: StdListener,
    local: TransportAddress,
}

impl BoundListener {
    /// The actual bound address (the real port when port 0 was requested).
    pub fn local_address(&self) -> &TransportAddress {
        &self.local
    }
}

/// A listener registered with the worker's runtime.
pub enum Listener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// Attaches a bound listener to the current runtime.
    ///
    /// Must be called from inside the runtime that will drive it.
    pub fn from_bound(bound: BoundListener) -> Result<Self> {
        match (bound.inner, bound.local) {
            (StdListener::Tcp(listener), _) => Ok(Listener::Tcp(tokio::net::TcpListener::from_std(listener)?)),
            #[cfg(unix)]
            (StdListener::Unix(listener), TransportAddress::UnixSocket(path)) => Ok(Listener::Unix {
                listener: tokio::net::UnixListener::from_std(listener)?,
                path,
            }),
            #[cfg(unix)]
            (StdListener::Unix(_), local) => Err(Error::internal(format!(
                "Unix listener with non-Unix address {}",
                local
            ))),
        }
    }

    /// Waits for the next client connection. Returns the stream and a peer label.
    pub async fn accept(&self) -> std::io::Result<(Box<dyn Connection>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), format!("unix:{}", path.display())))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

/// The runtime that drives all transport I/O of one server run.
///
/// Created by `NameServer::start()`, moved onto the worker thread, and
/// released when the worker exits. There is no process-wide instance.
pub struct TransportContext {
    runtime: tokio::runtime::Runtime,
}

impl TransportContext {
    pub fn new(worker_name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(worker_name)
            .build()
            .map_err(|e| Error::transport(format!("failed to create transport context: {}", e)))?;
        Ok(Self { runtime })
    }

    /// Drives `future` to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Shuts the runtime down, waiting up to `grace` for leftover tasks.
    ///
    /// Must not be called from inside an async context.
    pub fn release(self, grace: Duration) {
        self.runtime.shutdown_timeout(grace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_address_parse_tcp() {
        let addr = TransportAddress::parse("tcp://localhost:8080").unwrap();
        assert_eq!(addr, TransportAddress::Tcp("localhost:8080".to_string()));
        assert_eq!(addr.to_string(), "tcp://localhost:8080");
    }

    #[test]
    fn test_transport_address_parse_wildcard() {
        let addr: TransportAddress = "tcp://*:5555".parse().unwrap();
        assert_eq!(addr, TransportAddress::Tcp("0.0.0.0:5555".to_string()));
    }

    #[test]
    #[cfg(unix)]
    fn test_transport_address_parse_unix() {
        let addr = TransportAddress::parse("unix:///tmp/test.sock").unwrap();
        assert_eq!(addr, TransportAddress::UnixSocket(PathBuf::from("/tmp/test.sock")));
        assert_eq!(addr.to_string(), "unix:///tmp/test.sock");
    }

    #[test]
    fn test_transport_address_parse_invalid() {
        for bad in ["invalid://something", "tcp://localhost", "tcp://:80", "tcp://host:notaport", "10.0.0.1:80"] {
            assert!(
                matches!(TransportAddress::parse(bad), Err(Error::InvalidAddress { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_bind_reports_real_port() {
        let bound = TransportAddress::parse("tcp://127.0.0.1:0").unwrap().bind().unwrap();
        match bound.local_address() {
            TransportAddress::Tcp(addr) => assert!(!addr.ends_with(":0"), "got {}", addr),
            #[cfg(unix)]
            other => panic!("Expected TCP address, got {}", other),
        }
    }

    #[test]
    fn test_bind_conflict_is_transport_error() {
        let first = TransportAddress::parse("tcp://127.0.0.1:0").unwrap().bind().unwrap();
        let taken = first.local_address().clone();

        let err = taken.bind().err().expect("second bind should fail");
        assert!(err.is_transport());
    }

    #[test]
    #[cfg(unix)]
    fn test_unix_socket_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        // Stale file at the socket path
        std::fs::write(&socket_path, "").unwrap();

        let addr = TransportAddress::UnixSocket(socket_path.clone());
        let bound = addr.bind().unwrap();

        let context = TransportContext::new("test-worker").unwrap();
        context.block_on(async move {
            let listener = Listener::from_bound(bound).unwrap();
            drop(listener);
        });
        context.release(Duration::from_millis(100));

        assert!(!socket_path.exists());
    }
}
