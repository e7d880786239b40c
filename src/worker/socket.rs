//! Thin IPv4 wrapper around the tokio UDP socket.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};
use tokio::net::UdpSocket;

/// Largest datagram we expect; everything on the wire fits well within a
/// single ethernet MTU.
const MAX_DATAGRAM_LEN: usize = 1500;

pub(crate) struct Socket {
    inner: UdpSocket,
}

impl Socket {
    /// Bind to the given local UDP port; 0 lets the OS pick one.
    pub async fn bind(port: u16) -> io::Result<Socket> {
        let inner = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;

        Ok(Socket { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Best-effort send of a whole datagram.
    pub async fn send(&self, bytes: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        let sent = self.inner.send_to(bytes, SocketAddr::V4(addr)).await?;

        if sent == bytes.len() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "datagram sent partially",
            ))
        }
    }

    /// Receive one datagram. Cancel safe, so it can sit in a `select!` arm.
    pub async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddrV4)> {
        loop {
            let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
            let (len, addr) = self.inner.recv_from(&mut buffer).await?;
            buffer.truncate(len);

            match addr {
                SocketAddr::V4(addr) => return Ok((buffer, addr)),
                // Cannot happen on a v4-bound socket.
                SocketAddr::V6(_) => continue,
            }
        }
    }
}
