// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Socket plumbing shared by the listener and the per-connection workers.
//!
//! A server listens either on a TCP address (IPv4 or IPv6, the latter
//! bracketed) or on a Unix-domain stream socket written as `unix://path`.
//! Both flavors are unified behind [`HttpStream`] so that the rest of the
//! crate never branches on the transport.

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

pub mod reader;
pub mod writer;

/// An address the server can listen on.
///
/// Parsed from a string: `127.0.0.1:8080`, `[::1]:8080` or `unix:///tmp/app.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A TCP socket address.
    Tcp(SocketAddr),
    /// A Unix-domain stream socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Address {
    /// Parses an address string.
    ///
    /// # Example
    ///
    /// ```
    /// use estaminet::Address;
    /// let addr = Address::parse("127.0.0.1:8080").unwrap();
    /// ```
    pub fn parse(s: &str) -> Result<Address, AddressParseError> {
        if let Some(path) = s.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(AddressParseError::EmptyUnixPath);
                }
                return Ok(Address::Unix(PathBuf::from(path)));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(AddressParseError::UnixNotSupported);
            }
        }

        match s.parse::<SocketAddr>() {
            Ok(addr) => Ok(Address::Tcp(addr)),
            Err(_) => Err(AddressParseError::InvalidSocketAddr(s.to_owned())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "{}", addr),
            #[cfg(unix)]
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Error returned when an address string cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    /// Not `unix://…` and not parseable as `IP:PORT`.
    InvalidSocketAddr(String),
    /// `unix://` with nothing after it.
    EmptyUnixPath,
    /// `unix://` on a platform without Unix-domain sockets.
    UnixNotSupported,
}

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddressParseError::InvalidSocketAddr(s) => {
                write!(f, "`{}` is not a valid socket address", s)
            }
            AddressParseError::EmptyUnixPath => write!(f, "empty path after `unix://`"),
            AddressParseError::UnixNotSupported => {
                write!(f, "unix-domain sockets are not supported on this platform")
            }
        }
    }
}

impl std::error::Error for AddressParseError {}

/// The peer of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    /// Peer of a TCP connection.
    Tcp(SocketAddr),
    /// Peer of a Unix-domain connection. The peer address of a Unix socket
    /// is rarely meaningful, so only the fact is recorded.
    Unix,
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RemoteAddr::Tcp(addr) => write!(f, "{}", addr),
            RemoteAddr::Unix => write!(f, "unix"),
        }
    }
}

/// A listening socket, TCP or Unix.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Binds to the given address.
    pub fn bind(addr: &Address) -> io::Result<Listener> {
        match addr {
            Address::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr)?)),
            #[cfg(unix)]
            Address::Unix(path) => {
                // A previous unclean shutdown can leave the socket file around.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                Ok(Listener::Unix(UnixListener::bind(path)?, path.clone()))
            }
        }
    }

    /// Puts the listener in non-blocking mode so the accept loop can poll
    /// the stopping flag.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Listener::Unix(l, _) => l.set_nonblocking(nonblocking),
        }
    }

    /// Accepts one pending connection, if any.
    pub fn accept(&self) -> io::Result<(HttpStream, RemoteAddr)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                let stream = HttpStream::Tcp(stream);
                stream.apply_socket_options();
                Ok((stream, RemoteAddr::Tcp(peer)))
            }
            #[cfg(unix)]
            Listener::Unix(l, _) => {
                let (stream, _) = l.accept()?;
                let stream = HttpStream::Unix(stream);
                stream.apply_socket_options();
                Ok((stream, RemoteAddr::Unix))
            }
        }
    }

    /// The address the listener is bound to, useful with port 0.
    pub fn local_addr(&self) -> io::Result<Address> {
        match self {
            Listener::Tcp(l) => Ok(Address::Tcp(l.local_addr()?)),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Address::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// One accepted client connection, TCP or Unix.
///
/// Reads and writes are blocking. On Linux every write goes through
/// `send(2)` with `MSG_NOSIGNAL` so a peer that went away produces an
/// `EPIPE` error instead of a fatal `SIGPIPE`; on Darwin-likes the same is
/// achieved with the `SO_NOSIGPIPE` socket option at accept time.
pub enum HttpStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl HttpStream {
    /// Clones the underlying socket handle. Both clones refer to the same
    /// socket, so timeouts and shutdown affect all of them.
    pub fn try_clone(&self) -> io::Result<HttpStream> {
        match self {
            HttpStream::Tcp(s) => Ok(HttpStream::Tcp(s.try_clone()?)),
            #[cfg(unix)]
            HttpStream::Unix(s) => Ok(HttpStream::Unix(s.try_clone()?)),
        }
    }

    /// Restores blocking mode on a socket accepted from a non-blocking
    /// listener.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            HttpStream::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            HttpStream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Sets or clears the read timeout on the socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            HttpStream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            HttpStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    /// Shuts the socket down in both directions. Errors are meaningless at
    /// that point and are ignored by callers.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            HttpStream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            HttpStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn apply_socket_options(&self) {
        use std::os::unix::io::AsRawFd;
        let fd = match self {
            HttpStream::Tcp(s) => s.as_raw_fd(),
            HttpStream::Unix(s) => s.as_raw_fd(),
        };
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn apply_socket_options(&self) {}

    #[cfg(target_os = "linux")]
    fn send_nosignal(&self, buf: &[u8]) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;
        let fd = match self {
            HttpStream::Tcp(s) => s.as_raw_fd(),
            HttpStream::Unix(s) => s.as_raw_fd(),
        };
        let ret = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl Read for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            HttpStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            HttpStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for HttpStream {
    #[cfg(target_os = "linux")]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_nosignal(buf)
    }

    #[cfg(not(target_os = "linux"))]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            HttpStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            HttpStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            HttpStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            HttpStream::Unix(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Address;
    use super::AddressParseError;

    #[test]
    fn parse_tcp_v4() {
        let addr = Address::parse("127.0.0.1:8080").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn parse_tcp_v6_bracketed() {
        let addr = Address::parse("[::1]:9000").unwrap();
        assert_eq!(addr.to_string(), "[::1]:9000");
    }

    #[cfg(unix)]
    #[test]
    fn parse_unix() {
        let addr = Address::parse("unix:///tmp/app.sock").unwrap();
        assert_eq!(addr.to_string(), "unix:///tmp/app.sock");
    }

    #[test]
    fn parse_garbage() {
        assert_eq!(
            Address::parse("not-an-address"),
            Err(AddressParseError::InvalidSocketAddr("not-an-address".to_owned()))
        );
    }
}
