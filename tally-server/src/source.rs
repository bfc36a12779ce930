use std::future::Future;
use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// A source of datagrams.
///
/// Sources are shared by all readers, so `recv_from` is called concurrently and must be safe to
/// call through a shared reference. Every call must be cancellable at its await point.
pub trait PacketSource: Send + Sync + 'static {
    /// Receives a single datagram into `buf`.
    ///
    /// Returns the number of bytes written and the address of the sender.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

/// A UDP socket receiving metrics.
#[derive(Debug)]
pub struct UdpPacketSource {
    socket: UdpSocket,
}

impl UdpPacketSource {
    /// Binds a new socket to `addr`.
    ///
    /// The socket is created with `SO_REUSEADDR`. If `receive_buffer_size` is set, it is used as
    /// `SO_RCVBUF`. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, receive_buffer_size: Option<usize>) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Some(size) = receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self { socket })
    }

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl PacketSource for UdpPacketSource {
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        self.socket.recv_from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_receive() {
        let source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap(), Some(1 << 16)).unwrap();
        let addr = source.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hits:1|c", addr).await.unwrap();

        let mut buf = [0; 64];
        let (len, from) = source.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hits:1|c");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
