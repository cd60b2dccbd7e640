use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::NtpConfig;
use crate::connection::Connection;
use crate::connection_table::ConnectionTable;
use crate::frame::{Frame, FrameFlags, FrameKind, PORT_LIMIT};
use crate::link::Link;
use crate::outbound::{OutboundQueue, OutboundReceiver};
use crate::pending_accept_table::PendingAcceptTable;
use crate::port_allocator::{probe_order, PortAllocator, RandomPortAllocator};
use crate::protocol::Event;
use crate::session_key::{Route, SessionKey};
use crate::state::ConnectionState;

struct DispatcherInner {
    config: NtpConfig,
    link: Arc<dyn Link>,
    connections: Arc<ConnectionTable>,
    pending: PendingAcceptTable,
    outbound: OutboundQueue,
    port_allocator: Mutex<Box<dyn PortAllocator>>,
}

impl DispatcherInner {
    fn local_addr(&self) -> u8 {
        self.link.link_address()
    }

    fn new_connection(&self, key: SessionKey) -> Arc<Connection> {
        Arc::new(Connection::new(
            Route::new(self.local_addr(), key),
            self.config.max_payload_len,
            self.outbound.clone(),
            Arc::downgrade(&self.connections),
        ))
    }

    fn new_active_connection(&self, key: SessionKey) -> (Arc<Connection>, Vec<Frame>) {
        let (connection, syn) = Connection::new_active(
            Route::new(self.local_addr(), key),
            self.config.max_payload_len,
            self.outbound.clone(),
            Arc::downgrade(&self.connections),
        );
        (Arc::new(connection), syn)
    }

    async fn on_datagram(&self, raw: Bytes) {
        let frame = match Frame::deser(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
                return;
            }
        };

        if frame.dst_addr != self.local_addr() {
            debug!("dropping frame addressed to link address {}", frame.dst_addr);
            return;
        }
        let Some(kind) = frame.kind() else {
            debug!("dropping frame with unroutable flags {:?}", frame.flags);
            return;
        };

        let key = frame.session_key();
        trace!("{}: received {:?} #{}", key, kind, frame.sequence);

        if let Some(connection) = self.connections.get(&key).await {
            connection.handle(Event::Frame(frame)).await;
            return;
        }

        match kind {
            FrameKind::Request => self.passive_open(key, frame).await,
            FrameKind::Finish => {
                // late duplicate for a session that is gone: let the peer complete its teardown
                trace!("{}: FIN for unknown session - replying FIN/ACK", key);
                self.outbound.enqueue(frame.reply(FrameFlags::FIN | FrameFlags::ACK, 0));
            }
            _ => trace!("{}: no session - dropping {:?}", key, kind),
        }
    }

    async fn passive_open(&self, key: SessionKey, frame: Frame) {
        if self.pending.is_occupied(key.local_port).await {
            debug!("{}: port {} already has a connection waiting to be accepted - dropping request", key, key.local_port);
            return;
        }

        debug!("{}: passive open", key);
        let connection = self.new_connection(key);
        connection.handle(Event::Frame(frame)).await;

        if !self.connections.insert(connection.clone()).await {
            debug!("{}: session was registered concurrently - dropping request", key);
            return;
        }
        if !self.pending.offer(connection.clone()).await {
            self.connections.remove(&connection).await;
        }
    }

    /// The first local port in probing order that is not in use for this remote end point
    async fn free_port(&self, remote_addr: u8, remote_port: u8) -> Option<u8> {
        let candidate = self.port_allocator.lock().await
            .candidate();

        for local_port in probe_order(candidate) {
            if !self.connections.contains(&SessionKey::new(local_port, remote_addr, remote_port)).await {
                return Some(local_port);
            }
        }
        None
    }
}

/// The host-wide part of the transport: it owns the link and the session tables, and runs the
///  delivery, send and retransmission loops as tokio tasks. Dropping the dispatcher stops them.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Dispatcher {
    pub async fn new(config: NtpConfig, link: Arc<dyn Link>) -> anyhow::Result<Dispatcher> {
        let port_allocator = Box::new(RandomPortAllocator::new(config.port_seed));
        Self::with_port_allocator(config, link, port_allocator).await
    }

    pub async fn with_port_allocator(config: NtpConfig, link: Arc<dyn Link>, port_allocator: Box<dyn PortAllocator>) -> anyhow::Result<Dispatcher> {
        config.validate()?;

        let (outbound, outbound_receiver) = OutboundQueue::new();
        let inner = Arc::new(DispatcherInner {
            config,
            link,
            connections: Arc::new(ConnectionTable::new()),
            pending: PendingAcceptTable::new(),
            outbound,
            port_allocator: Mutex::new(port_allocator),
        });

        info!("starting dispatcher on link address {} with {:?}", inner.local_addr(), inner.config);
        let handles = vec![
            tokio::spawn(Self::delivery_loop(inner.clone())),
            tokio::spawn(Self::send_loop(inner.link.clone(), outbound_receiver)),
            tokio::spawn(Self::retransmit_loop(inner.clone())),
        ];

        Ok(Dispatcher { inner, handles })
    }

    pub fn local_addr(&self) -> u8 {
        self.inner.local_addr()
    }

    pub async fn num_connections(&self) -> usize {
        self.inner.connections.len().await
    }

    /// Opens a session to a remote port, waiting until the peer accepted it.
    ///
    /// If both sides open to each other on the same port pair at the same time, the attempt is
    ///  abandoned and repeated from another local port. There is no limit to the number of
    ///  attempts.
    pub async fn connect(&self, remote_addr: u8, remote_port: u8) -> anyhow::Result<Arc<Connection>> {
        if remote_port >= PORT_LIMIT {
            bail!("remote port {} is out of range - must be below {}", remote_port, PORT_LIMIT);
        }

        let mut attempt = 0u64;
        loop {
            attempt += 1;

            let Some(local_port) = self.inner.free_port(remote_addr, remote_port).await else {
                warn!("all {} local ports are in use for {}:{} - waiting for one to become free", PORT_LIMIT, remote_addr, remote_port);
                sleep(self.inner.config.retransmit_interval).await;
                continue;
            };

            let key = SessionKey::new(local_port, remote_addr, remote_port);
            let (connection, syn) = self.inner.new_active_connection(key);
            if !self.inner.connections.insert(connection.clone()).await {
                continue;
            }

            debug!("{}: active open (attempt #{})", key, attempt);
            connection.transmit(syn);

            match connection.wait_for_handshake().await {
                ConnectionState::Established => {
                    debug!("{}: established", key);
                    return Ok(connection);
                }
                state => {
                    debug!("{}: simultaneous open ({}) - retrying from another port", key, state);
                    self.inner.connections.remove(&connection).await;
                }
            }
        }
    }

    /// Claims the session waiting on a local port, if there is one. Never waits.
    pub async fn accept(&self, local_port: u8) -> Option<Arc<Connection>> {
        let connection = self.inner.pending.take(local_port).await?;
        debug!("{}: accepted", connection.key());
        connection.handle(Event::Accept).await;
        Some(connection)
    }

    /// Stops tracking a connection and starts its close handshake. The connection receives no
    ///  further frames or timer ticks, so the handshake's first step is its last one; use
    ///  [Connection::close] for a handshake that runs to completion.
    pub async fn close(&self, connection: &Arc<Connection>) {
        if self.inner.connections.remove(connection).await {
            debug!("{}: removed from tracking", connection.key());
        }
        connection.handle(Event::Close).await;
    }

    /// Closes all connections and waits until every close handshake has completed. Sessions
    ///  that were opened by a peer but never accepted are discarded.
    pub async fn shutdown(&self) {
        for connection in self.inner.pending.drain().await {
            debug!("{}: discarding session that was never accepted", connection.key());
            self.inner.connections.remove(&connection).await;
        }

        let connections = self.inner.connections.snapshot().await;
        info!("shutting down - closing {} connections", connections.len());
        for connection in connections {
            connection.close().await;
        }

        self.inner.connections.wait_until_empty().await;
        info!("shutdown complete");
    }

    async fn delivery_loop(inner: Arc<DispatcherInner>) {
        info!("starting delivery loop");

        loop {
            let raw = inner.link.receive().await;

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "frame_received", ?correlation_id);
            inner.on_datagram(raw)
                .instrument(span)
                .await;
        }
    }

    /// One frame at a time: the next frame is dequeued only after the link completed sending
    ///  the previous one. Ends when all queue handles are gone.
    async fn send_loop(link: Arc<dyn Link>, mut outbound: OutboundReceiver) {
        info!("starting send loop");

        while let Some(frame) = outbound.recv().await {
            link.send(&frame.to_bytes()).await;
        }
        debug!("outbound queue closed - send loop ends");
    }

    async fn retransmit_loop(inner: Arc<DispatcherInner>) {
        info!("starting retransmit loop");

        let mut ticks = interval(inner.config.retransmit_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticks.tick().await;

        loop {
            ticks.tick().await;

            // ticking a connection may release it, which needs the table lock
            for connection in inner.connections.snapshot().await {
                connection.handle(Event::Timer).await;
            }
        }
    }
}
