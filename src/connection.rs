use std::sync::Weak;
use bytes::Bytes;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, trace};
use crate::connection_table::ConnectionTable;
use crate::frame::Frame;
use crate::outbound::OutboundQueue;
use crate::protocol::{ConnectionCore, Event, Outcome};
use crate::session_key::{Route, SessionKey};
use crate::state::ConnectionState;

/// One session, as seen by the application: a handle to read from, write to and close.
///
/// All protocol work happens in a [ConnectionCore] behind this connection's own lock. Frames it
///  produces are handed to the outbound queue while the lock is held (which never blocks), while
///  table updates happen only after the lock was released.
pub struct Connection {
    key: SessionKey,
    core: Mutex<ConnectionCore>,
    outbound: OutboundQueue,
    state: watch::Sender<ConnectionState>,
    table: Weak<ConnectionTable>,
}

impl Connection {
    pub(crate) fn new(route: Route, max_payload_len: usize, outbound: OutboundQueue, table: Weak<ConnectionTable>) -> Connection {
        Self::with_core(ConnectionCore::new(route, max_payload_len), outbound, table)
    }

    /// A connection that already sent its connection request, i.e. it is never seen in CLOSED.
    ///  The SYN is returned rather than enqueued: it must only go out once the connection is
    ///  registered, so the reply finds it.
    pub(crate) fn new_active(route: Route, max_payload_len: usize, outbound: OutboundQueue, table: Weak<ConnectionTable>) -> (Connection, Vec<Frame>) {
        let mut core = ConnectionCore::new(route, max_payload_len);
        let outcome = core.handle(Event::Connect);
        (Self::with_core(core, outbound, table), outcome.frames)
    }

    fn with_core(core: ConnectionCore, outbound: OutboundQueue, table: Weak<ConnectionTable>) -> Connection {
        let (state, _) = watch::channel(core.state());

        Connection {
            key: core.key(),
            core: Mutex::new(core),
            outbound,
            state,
            table,
        }
    }

    pub(crate) fn transmit(&self, frames: Vec<Frame>) {
        self.outbound.enqueue_all(frames);
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queues all bytes for sending and returns their number. Fails if the connection is closing.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<usize> {
        let mut core = self.core.lock().await;
        let (len, outcome) = core.send(data)?;
        self.apply(core, outcome).await;
        Ok(len)
    }

    /// Returns up to `max_len` bytes that are available right now - possibly none. `None` means
    ///  the end of the stream was reached: the connection is closed and no more data will arrive.
    pub async fn read(&self, max_len: usize) -> Option<Bytes> {
        let mut core = self.core.lock().await;
        let (data, outcome) = core.receive(max_len);
        self.apply(core, outcome).await;
        data
    }

    /// Starts the close handshake, discarding data that was received but not read. The
    ///  connection stays tracked until the handshake completes.
    pub async fn close(&self) {
        self.handle(Event::Close).await;
    }

    pub(crate) async fn handle(&self, event: Event) {
        let mut core = self.core.lock().await;
        let outcome = core.handle(event);
        self.apply(core, outcome).await;
    }

    /// Waits until the active open either succeeded or ran into a simultaneous open
    pub(crate) async fn wait_for_handshake(&self) -> ConnectionState {
        let mut receiver = self.state.subscribe();
        let resolved = receiver
            .wait_for(|s| matches!(s, ConnectionState::Established | ConnectionState::Deadlock))
            .await
            .map(|s| *s);

        // the sender lives as long as this connection, so this cannot fail while we are called
        resolved.unwrap_or(ConnectionState::Closed)
    }

    async fn apply(&self, core: MutexGuard<'_, ConnectionCore>, outcome: Outcome) {
        self.outbound.enqueue_all(outcome.frames);
        self.state.send_if_modified(|state| {
            if *state == core.state() {
                return false;
            }
            trace!("{}: publishing state {}", self.key, core.state());
            *state = core.state();
            true
        });
        drop(core);

        if outcome.release {
            debug!("{}: closed and exhausted - releasing", self.key);
            if let Some(table) = self.table.upgrade() {
                table.release(self).await;
            }
        }
    }
}
