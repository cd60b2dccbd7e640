use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use crate::connection::Connection;
use crate::session_key::SessionKey;

/// All live sessions of this host, by session key. This is the single source of truth for
///  whether a session exists: frames for keys that are not here never reach a connection.
pub struct ConnectionTable {
    connections: RwLock<FxHashMap<SessionKey, Arc<Connection>>>,
    released: Notify,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable {
            connections: Default::default(),
            released: Notify::new(),
        }
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<Connection>> {
        self.connections.read().await
            .get(key)
            .cloned()
    }

    pub async fn contains(&self, key: &SessionKey) -> bool {
        self.connections.read().await
            .contains_key(key)
    }

    /// Registers a connection under its key. Returns `false` and leaves the table unchanged if
    ///  the key is taken.
    pub async fn insert(&self, connection: Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection.key()) {
            return false;
        }
        connections.insert(connection.key(), connection);
        true
    }

    /// Removes the given connection - but not some other connection that took over its key
    pub async fn remove(&self, connection: &Connection) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&connection.key()) {
            Some(existing) if std::ptr::eq(existing.as_ref(), connection) => {
                connections.remove(&connection.key());
                true
            }
            _ => false,
        }
    }

    /// A connection finished its lifecycle: remove it, and wake everybody waiting for the table
    ///  to drain
    pub async fn release(&self, connection: &Connection) {
        if self.remove(connection).await {
            debug!("{}: released", connection.key());
            self.released.notify_waiters();
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // register before checking, so a release between check and await is not missed
            notified.as_mut().enable();

            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use crate::outbound::OutboundQueue;
    use crate::session_key::Route;

    fn connection(table: &Arc<ConnectionTable>, local_port: u8) -> Arc<Connection> {
        let (outbound, _) = OutboundQueue::new();
        let route = Route::new(1, SessionKey::new(local_port, 2, 7));
        Arc::new(Connection::new(route, 4, outbound, Arc::downgrade(table)))
    }

    #[test]
    fn test_insert_get_remove() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let table = Arc::new(ConnectionTable::new());
            let a = connection(&table, 50);
            let a_again = connection(&table, 50);
            let b = connection(&table, 51);

            assert!(table.insert(a.clone()).await);
            assert!(!table.insert(a_again.clone()).await);
            assert!(table.insert(b.clone()).await);
            assert_eq!(table.len().await, 2);
            assert!(Arc::ptr_eq(&table.get(&a.key()).await.unwrap(), &a));

            assert!(!table.remove(&a_again).await);
            assert!(table.contains(&a.key()).await);

            assert!(table.remove(&a).await);
            assert!(!table.remove(&a).await);
            assert_eq!(table.snapshot().await.len(), 1);
        });
    }

    #[test]
    fn test_wait_until_empty() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let table = Arc::new(ConnectionTable::new());
            table.wait_until_empty().await;

            let a = connection(&table, 50);
            let b = connection(&table, 51);
            table.insert(a.clone()).await;
            table.insert(b.clone()).await;

            let waiter = tokio::spawn({
                let table = table.clone();
                async move { table.wait_until_empty().await }
            });

            tokio::time::sleep(Duration::from_millis(10)).await;
            table.release(&a).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!waiter.is_finished());

            table.release(&b).await;
            waiter.await.unwrap();
        });
    }
}
