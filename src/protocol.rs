//! The per-connection protocol state machine, free of locks, tasks and I/O.
//!
//! Every call takes one event, applies the transition for the current state and returns the
//!  frames to transmit as an [Outcome]. Combinations of state and event that are not listed in
//!  the transition table are ignored: an unexpected frame is never an error.

use std::cmp::min;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::frame::{Frame, FrameFlags, FrameKind};
use crate::session_key::{Route, SessionKey};
use crate::state::ConnectionState;
use crate::window::{ReceiveWindow, SendWindow};

#[derive(Debug)]
pub enum Event {
    Connect,
    Accept,
    Close,
    Timer,
    Frame(Frame),
}

/// What the owner of a [ConnectionCore] has to do after an event was handled
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub frames: Vec<Frame>,
    /// The connection is CLOSED and exhausted: it can be removed from the session tables. This
    ///  is reported exactly once per connection.
    pub release: bool,
}

#[derive(Debug)]
pub struct ConnectionCore {
    route: Route,
    max_payload_len: usize,
    state: ConnectionState,
    /// left CLOSED at least once: a CLOSED connection is then finished, never opened again
    opened: bool,
    close_requested: bool,
    released: bool,

    send_window: SendWindow,
    receive_window: ReceiveWindow,
    /// written by the application, not yet in the send window
    outbound_buffer: BytesMut,
    /// taken out of the receive window, not yet read by the application
    delivered_buffer: BytesMut,

    pending_frames: Vec<Frame>,
    pending_release: bool,
}

impl ConnectionCore {
    pub fn new(route: Route, max_payload_len: usize) -> ConnectionCore {
        assert!(max_payload_len > 0);

        ConnectionCore {
            route,
            max_payload_len,
            state: ConnectionState::Closed,
            opened: false,
            close_requested: false,
            released: false,
            send_window: SendWindow::new(route),
            receive_window: ReceiveWindow::new(),
            outbound_buffer: BytesMut::new(),
            delivered_buffer: BytesMut::new(),
            pending_frames: Vec::new(),
            pending_release: false,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.route.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// nothing buffered for the application, and nothing more in the receive window
    pub fn is_exhausted(&self) -> bool {
        self.delivered_buffer.is_empty() && self.receive_window.is_empty()
    }

    pub fn handle(&mut self, event: Event) -> Outcome {
        match event {
            Event::Connect => self.on_connect(),
            Event::Accept => self.on_accept(),
            Event::Close => self.on_close(),
            Event::Timer => self.on_timer(),
            Event::Frame(frame) => self.on_frame(frame),
        }
        self.take_outcome()
    }

    /// Queues all bytes for sending and pushes as much as the send window allows. There is no
    ///  backpressure: flow control only throttles how fast the buffer drains.
    pub fn send(&mut self, data: &[u8]) -> anyhow::Result<(usize, Outcome)> {
        if self.state.is_closing() {
            bail!("connection {} is closing ({}) - no more data can be sent", self.route.key, self.state);
        }
        if self.close_requested {
            bail!("connection {} was closed during the handshake - no more data can be sent", self.route.key);
        }

        self.outbound_buffer.extend_from_slice(data);
        self.transmit_data();
        Ok((data.len(), self.take_outcome()))
    }

    /// Returns up to `max_len` bytes in stream order, possibly none. `None` signals the end of
    ///  the stream: the connection is closed and everything was read.
    pub fn receive(&mut self, max_len: usize) -> (Option<Bytes>, Outcome) {
        while self.delivered_buffer.len() < max_len {
            match self.receive_window.remove() {
                Some(frame) => self.delivered_buffer.extend_from_slice(&frame.payload),
                None => break,
            }
        }

        let len = min(max_len, self.delivered_buffer.len());
        let data = self.delivered_buffer.split_to(len).freeze();

        let result = if self.state == ConnectionState::Closed {
            if self.is_exhausted() {
                self.finished();
            }
            if data.is_empty() && self.is_exhausted() {
                None
            }
            else {
                Some(data)
            }
        }
        else {
            Some(data)
        };

        (result, self.take_outcome())
    }

    fn take_outcome(&mut self) -> Outcome {
        Outcome {
            frames: std::mem::take(&mut self.pending_frames),
            release: std::mem::take(&mut self.pending_release),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("{}: {} -> {}", self.route.key, self.state, next);
        self.state = next;

        if next != ConnectionState::Closed {
            self.opened = true;
        }
        else {
            self.finished();
        }
    }

    /// called whenever the connection is (or stays) CLOSED and something changed
    fn finished(&mut self) {
        if self.released {
            return;
        }

        if self.close_requested {
            // the application gave up its handle: unread data has no reader any more
            if !self.is_exhausted() {
                debug!("{}: discarding {} unread bytes", self.route.key, self.delivered_buffer.len());
            }
            self.delivered_buffer.clear();
            self.receive_window.clear();
        }

        if self.is_exhausted() {
            self.send_window.clear();
            self.receive_window.clear();
            self.released = true;
            self.pending_release = true;
        }
    }

    fn transmit(&mut self, flags: FrameFlags) {
        trace!("{}: sending {:?}", self.route.key, flags);
        self.pending_frames.push(self.route.control(flags, 0));
    }

    fn transmit_ack(&mut self, sequence: u32) {
        trace!("{}: sending ACK for #{}", self.route.key, sequence);
        self.pending_frames.push(self.route.control(FrameFlags::ACK, sequence));
    }

    fn transmit_stop(&mut self) {
        let frame = self.send_window.stop_frame(self.outbound_buffer.len(), self.max_payload_len);
        trace!("{}: sending STP #{}", self.route.key, frame.sequence);
        self.pending_frames.push(frame);
    }

    /// move as much buffered data into the send window as fits
    fn transmit_data(&mut self) {
        while !self.outbound_buffer.is_empty() && !self.send_window.is_full() {
            let len = min(self.max_payload_len, self.outbound_buffer.len());
            let chunk = self.outbound_buffer.split_to(len).freeze();

            let frame = self.send_window.add(chunk)
                .expect("send window refused a frame although it had room - this is a bug");
            trace!("{}: sending DATA #{} with {} bytes", self.route.key, frame.sequence, frame.payload.len());
            self.pending_frames.push(frame);
        }
    }

    fn retransmit_window(&mut self) {
        let frames = self.send_window.frames();
        if !frames.is_empty() {
            trace!("{}: retransmitting {} unacknowledged frames", self.route.key, frames.len());
        }
        self.pending_frames.extend(frames);
    }

    fn is_drained(&self) -> bool {
        self.send_window.is_empty() && self.outbound_buffer.is_empty()
    }

    fn on_connect(&mut self) {
        match self.state {
            ConnectionState::Closed => {
                self.transmit(FrameFlags::SYN);
                self.transition(ConnectionState::SynSent);
            }
            state => trace!("{}: ignoring connect in state {}", self.route.key, state),
        }
    }

    fn on_accept(&mut self) {
        match self.state {
            ConnectionState::SynRcvd => {
                self.transmit(FrameFlags::SYN | FrameFlags::ACK);
                self.transition(ConnectionState::Established);
                if self.close_requested {
                    self.on_close();
                }
            }
            state => trace!("{}: ignoring accept in state {}", self.route.key, state),
        }
    }

    fn on_close(&mut self) {
        self.close_requested = true;

        match self.state {
            ConnectionState::Established => {
                if self.is_drained() {
                    self.transmit(FrameFlags::FIN);
                    self.transition(ConnectionState::Closing);
                }
                else {
                    self.transmit_stop();
                    self.transition(ConnectionState::StpSent);
                }
            }
            ConnectionState::StpRcvd => {
                self.transmit(FrameFlags::FIN);
                self.transition(ConnectionState::Closing);
            }
            ConnectionState::Closed => self.finished(),
            state => trace!("{}: close in state {} is deferred to the handshake", self.route.key, state),
        }
    }

    fn on_timer(&mut self) {
        match self.state {
            ConnectionState::SynSent => self.transmit(FrameFlags::SYN),
            ConnectionState::StpSent => {
                if self.is_drained() {
                    self.transmit(FrameFlags::FIN);
                    self.transition(ConnectionState::Closing);
                }
                else {
                    self.transmit_stop();
                    self.retransmit_window();
                }
            }
            ConnectionState::Closing => self.transmit(FrameFlags::FIN),
            _ => self.retransmit_window(),
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let Some(kind) = frame.kind() else {
            debug!("{}: dropping frame with unroutable flags {:?}", self.route.key, frame.flags);
            return;
        };
        trace!("{}: received {:?} #{} in state {}", self.route.key, kind, frame.sequence, self.state);

        if kind == FrameKind::Stop {
            self.receive_window.stop_at(frame.sequence);
        }

        use ConnectionState::*;
        use FrameKind::*;

        match (self.state, kind) {
            (Closed, Request) if !self.opened => self.transition(SynRcvd),
            (Closed, Finish) => self.transmit(FrameFlags::FIN | FrameFlags::ACK),

            (SynSent, Request) => self.transition(Deadlock),
            (SynSent, RequestAck) => {
                self.transition(Established);
                if self.close_requested {
                    debug!("{}: running close that was requested during the handshake", self.route.key);
                    self.on_close();
                }
            }
            (SynSent, Data | Stop | Finish) => self.transmit(FrameFlags::SYN),

            // the peer missed our SYN/ACK
            (Established | StpSent | Closing, Request) => self.transmit(FrameFlags::SYN | FrameFlags::ACK),

            (Established | StpRcvd, Data) => {
                let sequence = frame.sequence;
                if self.receive_window.add(frame) {
                    self.transmit_ack(sequence);
                }
                else {
                    debug!("{}: dropped DATA #{} outside of the receive window", self.route.key, sequence);
                }
            }

            (Established, Ack) => {
                self.send_window.acked(frame.sequence);
                self.transmit_data();
            }
            (Established, Stop) => {
                self.send_window.clear();
                self.transition(StpRcvd);
            }
            (Established, Finish) => {
                self.send_window.clear();
                self.transmit(FrameFlags::FIN | FrameFlags::ACK);
                self.transition(Closed);
            }

            (StpSent, Ack) => {
                self.send_window.acked(frame.sequence);
                self.transmit_data();

                if self.is_drained() {
                    self.transmit(FrameFlags::FIN);
                    self.transition(Closing);
                }
            }
            (StpSent, Data) => self.transmit_stop(),
            (StpSent, Stop) => {
                // both sides are closing: collapse into a single round
                self.send_window.clear();
                self.transmit(FrameFlags::FIN);
                self.transition(Closing);
            }

            (StpSent | StpRcvd | Closing, Finish) => {
                self.transmit(FrameFlags::FIN | FrameFlags::ACK);
                self.transition(Closed);
            }

            (Closing, Data | Stop) => self.transmit(FrameFlags::FIN),
            (Closing, FinishAck) => self.transition(Closed),

            (state, kind) => trace!("{}: ignoring {:?} in state {}", self.route.key, kind, state),
        }
    }
}
