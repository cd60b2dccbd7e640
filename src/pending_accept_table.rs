use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use crate::connection::Connection;

/// Inbound sessions that were opened by a peer but not yet claimed by `accept`, by local port.
///
/// Each port holds at most one such session. While it is occupied, further connection requests
///  to the port are not registered at all; their senders keep retrying until the slot is free.
#[derive(Default)]
pub struct PendingAcceptTable {
    pending: RwLock<FxHashMap<u8, Arc<Connection>>>,
}

impl PendingAcceptTable {
    pub fn new() -> PendingAcceptTable {
        Default::default()
    }

    pub async fn is_occupied(&self, local_port: u8) -> bool {
        self.pending.read().await
            .contains_key(&local_port)
    }

    /// Returns `false` if the port's slot is taken
    pub async fn offer(&self, connection: Arc<Connection>) -> bool {
        let local_port = connection.key().local_port;

        let mut pending = self.pending.write().await;
        if pending.contains_key(&local_port) {
            return false;
        }
        pending.insert(local_port, connection);
        true
    }

    pub async fn take(&self, local_port: u8) -> Option<Arc<Connection>> {
        self.pending.write().await
            .remove(&local_port)
    }

    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.pending.write().await
            .drain()
            .map(|(_, c)| c)
            .collect()
    }
}
