use std::io::{self, Read, Write};
use std::net::SocketAddr;

use log::{debug, info};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::backend::{self, retry_interrupted, Accepted, Backend, BackendKind};

/// Listen backlog used when the caller has no preference.
pub const DEFAULT_BACKLOG: i32 = 128;

/// TCP socket backend, either listening or connected.
///
/// Uses socket2 for configuration; `accept` goes through the platform
/// socket-length alias so the address-length width always matches libc.
#[derive(Debug)]
pub struct SocketBackend {
    socket: Option<Socket>,
    listening: bool,
    peer: Option<SocketAddr>,
}

impl SocketBackend {
    /// Binds and listens on `addr`.
    ///
    /// # Errors
    /// Returns `std::io::Error` if the socket cannot be created, configured, or bound.
    pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let local = socket.local_addr()?.as_socket();
        info!("Listening on {:?} (backlog: {})", local, backlog);
        Ok(Self {
            socket: Some(socket),
            listening: true,
            peer: None,
        })
    }

    /// Opens a connected stream to `addr`.
    ///
    /// # Errors
    /// Returns `std::io::Error` if the connection is refused or the socket cannot be configured.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect(&addr.into())?;
        socket.set_nodelay(true)?;
        debug!("Connected to {}", addr);
        Ok(Self::connected(socket, Some(addr)))
    }

    fn connected(socket: Socket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket: Some(socket),
            listening: false,
            peer,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket_ref("local_addr")?
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an inet address"))
    }

    fn socket_ref(&self, op: &str) -> io::Result<&Socket> {
        self.socket.as_ref().ok_or_else(|| backend::closed(op))
    }

    fn socket_mut(&mut self, op: &str) -> io::Result<&mut Socket> {
        self.socket.as_mut().ok_or_else(|| backend::closed(op))
    }

    #[cfg(unix)]
    fn accept_raw(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        use std::mem;
        use std::os::unix::io::{AsRawFd, FromRawFd};

        use crate::platform::socklen::{self, SockLen};

        let listener = self.socket_ref("accept")?.as_raw_fd();
        // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len: SockLen = socklen::length_of::<libc::sockaddr_storage>();

        let fd = retry_interrupted(|| {
            // SAFETY: storage and len live across the call and len holds the size of
            // storage at exactly the width libc expects.
            let fd = unsafe {
                libc::accept(
                    listener,
                    (&mut storage as *mut libc::sockaddr_storage).cast(),
                    &mut len,
                )
            };
            if fd < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        })?;

        // SAFETY: accept returned a fresh descriptor owned by nobody else.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        // SAFETY: the kernel initialised the first len bytes of storage.
        let peer = unsafe { SockAddr::new(storage, len) }.as_socket();
        Ok((socket, peer))
    }

    #[cfg(not(unix))]
    fn accept_raw(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        let listener = self.socket_ref("accept")?;
        let (socket, addr): (Socket, SockAddr) = retry_interrupted(|| listener.accept())?;
        Ok((socket, addr.as_socket()))
    }
}

impl Backend for SocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Socket
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.listening {
            return Err(backend::unsupported("read on a listening socket"));
        }
        let socket = self.socket_mut("read")?;
        retry_interrupted(|| socket.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.listening {
            return Err(backend::unsupported("write on a listening socket"));
        }
        let socket = self.socket_mut("write")?;
        retry_interrupted(|| socket.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket_mut("flush")?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let socket = self.socket.take().ok_or_else(|| backend::closed("close"))?;
        if !self.listening {
            match socket.shutdown(std::net::Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        debug!("Socket closed (peer: {:?})", self.peer);
        Ok(())
    }

    fn accept(&mut self) -> io::Result<Accepted> {
        if !self.listening {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept on a socket that is not listening",
            ));
        }
        let (socket, peer) = self.accept_raw()?;
        socket.set_nodelay(true)?;
        info!("Accepted connection from {:?}", peer);
        Ok(Accepted {
            backend: Box::new(Self::connected(socket, peer)),
            peer,
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        SocketBackend::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpStream};

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn accept_reports_peer_and_transfers_bytes() {
        let mut listener = SocketBackend::listen(loopback(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let client_addr = client.local_addr().unwrap();

        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.peer, Some(client_addr));

        let mut server = accepted.backend;
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += server.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        server.close().unwrap();
        assert!(server.close().is_err());
    }

    #[test]
    fn connected_socket_cannot_accept() {
        let mut listener = SocketBackend::listen(loopback(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = SocketBackend::connect(addr).unwrap();
        let _server = listener.accept().unwrap();

        assert_eq!(client.peer_addr(), Some(addr));
        assert_eq!(client.accept().unwrap_err().kind(), io::ErrorKind::InvalidInput);
        assert_eq!(
            listener.read(&mut [0u8; 1]).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }
}
