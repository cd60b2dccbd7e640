use tokio::sync::mpsc;
use tracing::{trace, warn};
use crate::frame::Frame;

/// The host-wide FIFO of frames waiting for the link. Connections enqueue while holding their
///  own lock, so enqueueing never blocks; the send loop is the only consumer.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    sender: mpsc::UnboundedSender<Frame>,
}

pub type OutboundReceiver = mpsc::UnboundedReceiver<Frame>;

impl OutboundQueue {
    pub fn new() -> (OutboundQueue, OutboundReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (OutboundQueue { sender }, receiver)
    }

    pub fn enqueue(&self, frame: Frame) {
        trace!("enqueueing frame for {}:{} with flags {:?} #{}", frame.dst_addr, frame.dst_port, frame.flags, frame.sequence);
        if self.sender.send(frame).is_err() {
            warn!("send loop is gone - dropping outbound frame");
        }
    }

    pub fn enqueue_all(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.enqueue(frame);
        }
    }
}
