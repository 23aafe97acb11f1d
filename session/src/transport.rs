//! Datagram transports the engine runs over
//!
//! The engine is transport agnostic: anything that moves whole datagrams
//! between two endpoints works. A connected UDP socket is the production
//! transport; an in-memory pair backs tests and local wiring.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// A bidirectional, connectionless datagram link
///
/// Implementations must preserve datagram boundaries. Loss, duplication and
/// reordering are tolerated by the engine; corruption is caught by the frame
/// checksum.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to the peer
    async fn send(&self, datagram: Bytes) -> io::Result<usize>;

    /// Receive the next datagram from the peer
    async fn recv(&self) -> io::Result<Bytes>;

    /// Largest datagram this link can carry
    fn max_datagram_size(&self) -> usize;
}

/// Transport over a connected UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
    max_datagram: usize,
}

impl UdpTransport {
    /// Bind a local address and connect to the remote peer
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self {
            socket,
            max_datagram: lot_wire::MAX_DATAGRAM_SIZE,
        })
    }

    /// Cap the datagram size below the default, e.g. to stay under path MTU
    pub fn with_max_datagram(mut self, max: usize) -> Self {
        self.max_datagram = max.min(lot_wire::MAX_DATAGRAM_SIZE);
        self
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, datagram: Bytes) -> io::Result<usize> {
        self.socket.send(&datagram).await
    }

    async fn recv(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; self.max_datagram];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn max_datagram_size(&self) -> usize {
        self.max_datagram
    }
}

/// In-memory transport endpoint, one half of a [`memory_pair`]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    max_datagram: usize,
}

/// Build two connected in-memory endpoints
pub fn memory_pair(max_datagram: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a = MemoryTransport {
        tx: a_tx,
        rx: Mutex::new(a_rx),
        max_datagram,
    };
    let b = MemoryTransport {
        tx: b_tx,
        rx: Mutex::new(b_rx),
        max_datagram,
    };
    (a, b)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, datagram: Bytes) -> io::Result<usize> {
        let len = datagram.len();
        self.tx
            .send(datagram)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer endpoint dropped"))?;
        Ok(len)
    }

    async fn recv(&self) -> io::Result<Bytes> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer endpoint dropped"))
    }

    fn max_datagram_size(&self) -> usize {
        self.max_datagram
    }
}
