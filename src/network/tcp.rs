//! TCP connection and listener
//!
//! Both wrap blocking std sockets. The worker owning them does all the I/O;
//! other threads only get a closer (a cloned handle) that can shut the socket
//! down to wake up a blocked read, write or accept.

use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::TransportError;

/// How long a listener closer waits for its wake-up connection
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// One established TCP connection
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl Connection {
    pub(crate) fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("TCP_NODELAY not set for {}: {}", peer, e);
        }
        Self {
            stream,
            peer,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Handle another thread can use to shut this connection down
    pub fn closer(&self) -> io::Result<ConnectionCloser> {
        Ok(ConnectionCloser {
            socket: Socket::from(self.stream.try_clone()?),
        })
    }

    /// Read until `buf` is full or the peer closes the connection.
    ///
    /// Returns the number of bytes read; anything less than `buf.len()` means
    /// the peer is gone.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Shut the connection down. Safe to call more than once.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        shutdown_socket(SockRef::from(&self.stream))
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

fn shutdown_socket(socket: SockRef<'_>) -> io::Result<()> {
    match socket.shutdown(Shutdown::Both) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

/// Cross-thread handle that shuts a [`Connection`], or a socket still
/// connecting, down
#[derive(Debug)]
pub struct ConnectionCloser {
    socket: Socket,
}

impl ConnectionCloser {
    pub fn close(&self) -> io::Result<()> {
        shutdown_socket(SockRef::from(&self.socket))
    }
}

/// Open a client connection to `address` (`host:port`).
///
/// Every resolved address is tried once, each with the full `timeout`.
pub fn connect_sender(address: &str, timeout: Duration) -> Result<Connection, TransportError> {
    connect_sender_with(address, timeout, |_| true)
}

/// [`connect_sender`] that can be aborted from another thread.
///
/// Before each attempt the pending socket's closer goes to `register`; closing
/// it ends the attempt early. When `register` returns `false` no further
/// address is tried and the connect fails with [`TransportError::Cancelled`].
pub fn connect_sender_with<F>(
    address: &str,
    timeout: Duration,
    mut register: F,
) -> Result<Connection, TransportError>
where
    F: FnMut(ConnectionCloser) -> bool,
{
    let addrs: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            address: address.to_string(),
            source,
        })?
        .collect();

    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
    for addr in addrs {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .and_then(|socket| {
                let closer = ConnectionCloser {
                    socket: socket.try_clone()?,
                };
                Ok((socket, closer))
            });
        let (socket, closer) = match socket {
            Ok(pair) => pair,
            Err(source) => {
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
        };
        if !register(closer) {
            return Err(TransportError::Cancelled);
        }

        match socket.connect_timeout(&addr.into(), timeout) {
            Ok(()) => return Ok(Connection::from_stream(socket.into(), addr)),
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = e;
            }
        }
    }

    match last_error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Err(TransportError::ConnectTimeout {
            address: address.to_string(),
            timeout,
        }),
        io::ErrorKind::NotFound => Err(TransportError::Resolve {
            address: address.to_string(),
            source: last_error,
        }),
        _ => Err(TransportError::Connect {
            address: address.to_string(),
            source: last_error,
        }),
    }
}

/// A bound, listening socket with a backlog of one pending peer
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub(crate) fn new(inner: TcpListener) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until a peer connects or the listener is closed.
    pub fn accept(&self) -> Result<Connection, TransportError> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => return Ok(Connection::from_stream(stream, peer)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Accept(e)),
            }
        }
    }

    /// Accept and immediately close every peer already waiting in the backlog.
    pub fn reject_pending(&self) -> io::Result<Vec<SocketAddr>> {
        self.inner.set_nonblocking(true)?;
        let mut rejected = Vec::new();
        let result = loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = shutdown_socket(SockRef::from(&stream)) {
                        tracing::trace!("Rejected peer {} shutdown: {}", peer, e);
                    }
                    rejected.push(peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.inner.set_nonblocking(false)?;
        result.map(|()| rejected)
    }

    /// Handle another thread can use to unblock [`Listener::accept`]
    pub fn closer(&self) -> io::Result<ListenerCloser> {
        Ok(ListenerCloser {
            listener: self.inner.try_clone()?,
            wake_addr: wake_addr(self.local_addr),
        })
    }
}

/// Address a closer connects to so a blocked accept returns
fn wake_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

/// Cross-thread handle that wakes and disables a [`Listener`]
#[derive(Debug)]
pub struct ListenerCloser {
    listener: TcpListener,
    wake_addr: SocketAddr,
}

impl ListenerCloser {
    /// Shut the listening socket down, then poke it with a throwaway connection
    /// for platforms where shutdown alone leaves accept blocked.
    pub fn close(&self) {
        if let Err(e) = SockRef::from(&self.listener).shutdown(Shutdown::Both) {
            tracing::trace!("Listener shutdown: {}", e);
        }
        if let Ok(stream) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            if let Err(e) = shutdown_socket(SockRef::from(&stream)) {
                tracing::trace!("Wake-up connection shutdown: {}", e);
            }
        }
    }
}
