use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::WireStream;

/// TCP listening socket.
///
/// Accepted and connected streams have `TCP_NODELAY` enabled: the protocol
/// writes whole frames and wants them on the wire immediately.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on `addr`.
    ///
    /// Port `0` asks the OS for an ephemeral port; use [`TcpTransport::local_addr`]
    /// to find out which one was chosen.
    pub fn bind(addr: impl ToSocketAddrs + fmt::Debug) -> Result<Self> {
        let addr = resolve(addr)?;
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        info!(%local_addr, "listening on tcp socket");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<WireStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true).map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok(WireStream::from_tcp(stream))
    }

    /// Connect to a listening TCP socket (blocking).
    pub fn connect(addr: impl ToSocketAddrs + fmt::Debug) -> Result<WireStream> {
        let addr = resolve(addr)?;
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        finish_connect(addr, stream)
    }

    /// Connect with an upper bound on the TCP handshake time.
    pub fn connect_timeout(
        addr: impl ToSocketAddrs + fmt::Debug,
        timeout: Duration,
    ) -> Result<WireStream> {
        let addr = resolve(addr)?;
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;
        finish_connect(addr, stream)
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

fn finish_connect(addr: SocketAddr, stream: TcpStream) -> Result<WireStream> {
    stream.set_nodelay(true).map_err(|e| TransportError::Connect {
        addr: addr.to_string(),
        source: e,
    })?;
    debug!(%addr, "connected to tcp socket");
    Ok(WireStream::from_tcp(stream))
}

fn resolve(addr: impl ToSocketAddrs + fmt::Debug) -> Result<SocketAddr> {
    let mut addrs = addr.to_socket_addrs().map_err(|e| TransportError::Resolve {
        addr: format!("{addr:?}"),
        source: e,
    })?;
    addrs.next().ok_or_else(|| TransportError::Resolve {
        addr: format!("{addr:?}"),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address resolved to no socket addresses",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_bind_accept_connect() {
        let listener = TcpTransport::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        // Connect from another thread
        let handle = std::thread::spawn(move || {
            let mut client = TcpTransport::connect(addr).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(server.peer_addr().is_some());

        handle.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let addr = {
            let listener = TcpTransport::bind("127.0.0.1:0").unwrap();
            listener.local_addr()
        };
        let result = TcpTransport::connect(addr);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn test_bind_unresolvable_address() {
        let result = TcpTransport::bind("not a socket address");
        assert!(matches!(result, Err(TransportError::Resolve { .. })));
    }

    #[test]
    fn test_shutdown_unblocks_reader() {
        let listener = TcpTransport::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let client = TcpTransport::connect(addr).unwrap();
        let server = listener.accept().unwrap();

        let mut reader = server.try_clone().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).unwrap_or(0)
        });

        server.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), 0);
        drop(client);
    }

    #[test]
    fn test_connect_timeout_roundtrip() {
        let listener = TcpTransport::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let handle = std::thread::spawn(move || {
            let mut client = TcpTransport::connect_timeout(addr, Duration::from_secs(1)).unwrap();
            client.write_all(b"ok").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        handle.join().unwrap();
    }
}
