use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};
use crate::frame::Frame;
use crate::link::Link;

/// A link on top of UDP: every frame travels in a datagram of its own. Link addresses are
///  mapped to socket addresses through an address book.
///
/// The book is seeded at construction and learns the socket address of every datagram's sender
///  (the source link address is the frame's second byte), so a server only needs to know its
///  own address while clients reach it through their seeded entry.
pub struct UdpLink {
    link_address: u8,
    socket: UdpSocket,
    address_book: RwLock<FxHashMap<u8, SocketAddr>>,
}

impl UdpLink {
    pub async fn bind(link_address: u8, bind_addr: SocketAddr, address_book: FxHashMap<u8, SocketAddr>) -> anyhow::Result<UdpLink> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("link address {}: bound UDP socket to {:?}", link_address, socket.local_addr()?);

        Ok(UdpLink {
            link_address,
            socket,
            address_book: RwLock::new(address_book),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn add_peer(&self, link_address: u8, socket_addr: SocketAddr) {
        self.address_book.write().await
            .insert(link_address, socket_addr);
    }

    async fn learn_sender(&self, buf: &[u8], from: SocketAddr) {
        let Some(&src_addr) = buf.get(1) else {
            return;
        };

        if self.address_book.read().await.get(&src_addr) == Some(&from) {
            return;
        }
        debug!("link address {} is at {:?}", src_addr, from);
        self.add_peer(src_addr, from).await;
    }
}

#[async_trait]
impl Link for UdpLink {
    fn link_address(&self) -> u8 {
        self.link_address
    }

    async fn send(&self, frame: &[u8]) {
        let Some(&dst_addr) = frame.first() else {
            warn!("refusing to send an empty datagram");
            return;
        };

        let to = self.address_book.read().await
            .get(&dst_addr)
            .cloned();

        match to {
            Some(to) => {
                trace!("UDP link: sending {} bytes to {:?}", frame.len(), to);
                if let Err(e) = self.socket.send_to(frame, to).await {
                    error!("error sending UDP datagram to {:?}: {}", to, e);
                }
            }
            None => warn!("no socket address known for link address {} - dropping frame", dst_addr),
        }
    }

    async fn receive(&self) -> Bytes {
        // one byte more than any valid frame, so oversized datagrams stay detectable
        let mut buf = vec![0u8; Frame::MAX_FRAME_LEN + 1];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((num_read, from)) => {
                    trace!("UDP link: received {} bytes from {:?}", num_read, from);
                    buf.truncate(num_read);
                    self.learn_sender(&buf, from).await;
                    return Bytes::from(buf);
                }
                Err(e) => {
                    error!("socket error: {}", e);
                }
            }
        }
    }
}
