use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;
use crate::frame::Frame;
use crate::link::Link;

/// What the network does with a frame in transit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    Duplicate,
    /// deliver after the given time, letting later frames overtake this one
    Delay(Duration),
}

pub type FaultFilter = Box<dyn FnMut(&Frame) -> Fate + Send>;

struct SimulatedNetworkInner {
    links: FxHashMap<u8, mpsc::UnboundedSender<Bytes>>,
    filter: FaultFilter,
}

/// An in-process network connecting any number of [SimulatedLink]s. Frames are routed by their
///  destination address; frames to addresses nobody attached vanish. A replaceable filter decides
///  the fate of every frame that parses, so tests can inject loss, duplication and reordering.
#[derive(Clone)]
pub struct SimulatedNetwork {
    inner: Arc<Mutex<SimulatedNetworkInner>>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> SimulatedNetwork {
        SimulatedNetwork {
            inner: Arc::new(Mutex::new(SimulatedNetworkInner {
                links: FxHashMap::default(),
                filter: Box::new(|_| Fate::Deliver),
            })),
        }
    }

    /// Creates the link for a given address, replacing any link previously attached there
    pub async fn attach(&self, link_address: u8) -> Arc<SimulatedLink> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.lock().await
            .links.insert(link_address, sender.clone());

        Arc::new(SimulatedLink {
            link_address,
            network: self.clone(),
            inbound: sender.clone(),
            receiver: Mutex::new(receiver),
        })
    }

    pub async fn set_filter(&self, filter: impl FnMut(&Frame) -> Fate + Send + 'static) {
        self.inner.lock().await
            .filter = Box::new(filter);
    }

    async fn transmit(&self, raw: &[u8]) {
        let Some(&dst_addr) = raw.first() else {
            return;
        };
        let raw = Bytes::copy_from_slice(raw);

        let (fate, target) = {
            let mut inner = self.inner.lock().await;
            let fate = match Frame::deser(raw.clone()) {
                Ok(frame) => (inner.filter)(&frame),
                Err(_) => Fate::Deliver,
            };
            (fate, inner.links.get(&dst_addr).cloned())
        };

        let Some(target) = target else {
            trace!("simulated network: no link at address {} - frame vanishes", dst_addr);
            return;
        };

        trace!("simulated network: {:?} frame to {}", fate, dst_addr);
        match fate {
            Fate::Deliver => deliver(&target, dst_addr, raw),
            Fate::Drop => {}
            Fate::Duplicate => {
                deliver(&target, dst_addr, raw.clone());
                deliver(&target, dst_addr, raw);
            }
            Fate::Delay(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    deliver(&target, dst_addr, raw);
                });
            }
        }
    }
}

fn deliver(target: &mpsc::UnboundedSender<Bytes>, dst_addr: u8, raw: Bytes) {
    if target.send(raw).is_err() {
        trace!("simulated network: link at address {} was dropped - frame vanishes", dst_addr);
    }
}

pub struct SimulatedLink {
    link_address: u8,
    network: SimulatedNetwork,
    inbound: mpsc::UnboundedSender<Bytes>,
    receiver: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl SimulatedLink {
    /// Hands a raw datagram to this link as if it had arrived from the network, bypassing the
    ///  fault filter and the routing by destination address
    pub async fn inject(&self, raw: Bytes) {
        deliver(&self.inbound, self.link_address, raw);
    }
}

#[async_trait]
impl Link for SimulatedLink {
    fn link_address(&self) -> u8 {
        self.link_address
    }

    async fn send(&self, frame: &[u8]) {
        self.network.transmit(frame).await;
    }

    async fn receive(&self) -> Bytes {
        match self.receiver.lock().await.recv().await {
            Some(raw) => raw,
            None => std::future::pending().await,
        }
    }
}
