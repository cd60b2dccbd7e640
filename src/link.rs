//! The unreliable datagram link underneath the transport. A link moves single frames between
//!  hosts identified by one-byte link addresses; it may lose, duplicate and reorder them.

pub mod simulated;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// this host's address on the link
    fn link_address(&self) -> u8;

    /// Transmits one serialized frame. Returns once the transmission is complete, so the caller
    ///  can hand over the next frame. Transmission failures are not reported: the frame is lost.
    async fn send(&self, frame: &[u8]);

    /// Waits for the next inbound datagram. Its content is not validated.
    async fn receive(&self) -> Bytes;
}
