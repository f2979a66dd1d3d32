//! Datagram links: the raw send/receive surface under the transport.
//!
//! Production uses a bound [`UdpSocket`]. [`MemoryNetwork`] is an
//! in-process stand-in with switches for the failure modes the transport
//! has to survive: a dead link and duplicated datagrams.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

#[async_trait]
pub trait DatagramLink: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram into `buf`. A datagram longer than `buf` is
    /// truncated, as with a real socket.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramLink for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

// ---------------------------------------------------------------------------
// In-memory network
// ---------------------------------------------------------------------------

type Datagram = (Vec<u8>, SocketAddr);

/// Switchboard connecting [`MemoryLink`]s by address.
///
/// Datagrams to an unknown address vanish silently, like UDP. Delivery is
/// immediate and in order unless a switch says otherwise.
#[derive(Default)]
pub struct MemoryNetwork {
    links: DashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    /// Endpoints whose traffic (both directions) is dropped.
    down: RwLock<HashSet<SocketAddr>>,
    duplicate: AtomicBool,
    next_port: AtomicU16,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(40001),
            ..Default::default()
        })
    }

    /// Attaches a link on the next free loopback port.
    pub fn bind(self: &Arc<Self>) -> Arc<MemoryLink> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.bind_addr(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Attaches a link at `addr`, replacing any previous one there.
    pub fn bind_addr(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemoryLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.insert(addr, tx);
        Arc::new(MemoryLink {
            addr,
            network: Arc::clone(self),
            inbox: Mutex::new(rx),
        })
    }

    /// Drops every datagram to or from `addr` while `down` is set.
    pub fn set_link_down(&self, addr: SocketAddr, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    /// Delivers every datagram twice while set.
    pub fn set_duplicate(&self, on: bool) {
        self.duplicate.store(on, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        let blocked = {
            let down = self.down.read();
            down.contains(&from) || down.contains(&to)
        };
        let target = if blocked {
            None
        } else {
            self.links.get(&to).map(|tx| tx.clone())
        };
        let Some(tx) = target else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%from, %to, "memory network dropped datagram");
            return;
        };

        let copies = if self.duplicate.load(Ordering::Relaxed) { 2 } else { 1 };
        for _ in 0..copies {
            if tx.send((buf.to_vec(), from)).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryLink {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl DatagramLink for MemoryLink {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.network.route(self.addr, target, buf);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (data, from) = inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network dropped"))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_links_exchange_datagrams() {
        let net = MemoryNetwork::new();
        let a = net.bind();
        let b = net.bind();

        a.send_to(b"hello", b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn link_down_and_unknown_targets_drop() {
        let net = MemoryNetwork::new();
        let a = net.bind();
        let b = net.bind();
        let nowhere = SocketAddr::from(([127, 0, 0, 1], 9));

        net.set_link_down(b.local_addr().unwrap(), true);
        a.send_to(b"x", b.local_addr().unwrap()).await.unwrap();
        a.send_to(b"y", nowhere).await.unwrap();
        assert_eq!(net.dropped(), 2);
        assert_eq!(net.delivered(), 0);

        net.set_link_down(b.local_addr().unwrap(), false);
        net.set_duplicate(true);
        a.send_to(b"z", b.local_addr().unwrap()).await.unwrap();
        assert_eq!(net.delivered(), 2);
    }

    #[tokio::test]
    async fn long_datagrams_are_truncated() {
        let net = MemoryNetwork::new();
        let a = net.bind();
        let b = net.bind();
        a.send_to(&[1u8; 32], b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 8);
    }
}
