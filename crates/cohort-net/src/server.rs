//! Listening socket.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};

use crate::error::{NetError, NetResult};

/// Non-blocking listener that hands out accepted sockets.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds to `addr`. Port 0 binds an ephemeral port; [`Server::local_addr`]
    /// reports the one chosen.
    pub fn bind(addr: SocketAddr) -> NetResult<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| NetError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accepts one pending socket, or `None` once the backlog is drained.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}
