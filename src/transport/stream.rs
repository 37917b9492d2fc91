use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use rustls::{ClientConnection, StreamOwned};

/// Node socket, plain or TLS-wrapped
pub enum NodeStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl NodeStream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NodeStream::Plain(s) => s,
            NodeStream::Tls(s) => s.get_ref(),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, NodeStream::Tls(_))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    /// Independent write handle for out-of-band frames
    ///
    /// Only plain sockets can be written from another thread; TLS record
    /// state belongs to the owning stream.
    pub fn out_of_band_writer(&self) -> Option<TcpStream> {
        match self {
            NodeStream::Plain(s) => s.try_clone().ok(),
            NodeStream::Tls(_) => None,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for NodeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NodeStream::Plain(s) => s.read(buf),
            NodeStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for NodeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NodeStream::Plain(s) => s.write(buf),
            NodeStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NodeStream::Plain(s) => s.flush(),
            NodeStream::Tls(s) => s.flush(),
        }
    }
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
