//! UDP socket exposed as a byte stream
//!
//! Each datagram crosses the stream as a 2-byte big-endian length followed by
//! the datagram bytes.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

/// Largest datagram a length prefix can describe
const MAX_DATAGRAM: usize = u16::MAX as usize;

/// Connected UDP socket implementing `AsyncRead + AsyncWrite`
#[derive(Debug)]
pub struct UdpBridge {
    socket: UdpSocket,
    remote: SocketAddr,
    /// Framed datagrams waiting to be read
    inbound: BytesMut,
    /// Stream bytes waiting to be cut into datagrams
    outbound: BytesMut,
    recv_buf: Vec<u8>,
}

impl UdpBridge {
    /// Bind an ephemeral socket and connect it to `remote`
    pub async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let local = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self::from_socket(socket, remote))
    }

    /// Wrap an already connected socket
    pub fn from_socket(socket: UdpSocket, remote: SocketAddr) -> Self {
        Self {
            socket,
            remote,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Address datagrams are sent to
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send every complete frame in `outbound`
    fn poll_send_frames(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.outbound.len() < 2 {
                return Poll::Ready(Ok(()));
            }
            let len = u16::from_be_bytes([self.outbound[0], self.outbound[1]]) as usize;
            if self.outbound.len() < 2 + len {
                return Poll::Ready(Ok(()));
            }

            ready!(self.socket.poll_send(cx, &self.outbound[2..2 + len]))?;
            self.outbound.advance(2 + len);
        }
    }
}

impl AsyncRead for UdpBridge {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.inbound.is_empty() {
            let mut buf = ReadBuf::new(&mut this.recv_buf);
            ready!(this.socket.poll_recv(cx, &mut buf))?;
            let datagram = buf.filled();
            this.inbound.put_u16(datagram.len() as u16);
            this.inbound.extend_from_slice(datagram);
        }

        let n = this.inbound.len().min(out.remaining());
        out.put_slice(&this.inbound[..n]);
        this.inbound.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpBridge {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        ready!(this.poll_send_frames(cx))?;
        this.outbound.extend_from_slice(buf);

        // Frames that cannot go out yet stay queued for the next write or flush
        match this.poll_send_frames(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_send_frames(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
