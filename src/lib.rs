//! A reliable, ordered byte-stream transport on top of an unreliable datagram link - a
//!  simplified TCP for links that carry small frames between hosts with one-byte addresses.
//!
//! ## Design
//!
//! * Sessions are identified by (local port, remote address, remote port). Any number of them
//!    share one link per host.
//! * Every session goes through a three-way open (SYN, SYN/ACK) and a close handshake. An active
//!    open that collides with the peer opening the same port pair ('deadlock') is abandoned and
//!    repeated from a different local port.
//! * Data is cut into frames with consecutive sequence numbers. Both ends keep a window of 16
//!    frames: the sender retransmits unacknowledged frames periodically, the receiver releases
//!    frames to the application strictly in order and acknowledges each frame it holds.
//! * Closing with data still in flight first announces the final sequence number (STP) and flushes
//!    the window before finishing (FIN).
//! * All ports are listening: a connection request for a port without a session is parked until
//!    the application accepts it, one request per port at a time.
//!
//! ## Structure
//!
//! The protocol state machine ([protocol::ConnectionCore]) is a pure function of events: it has
//!  no locks, tasks or I/O and returns the frames to send. [connection::Connection] wraps it in a
//!  lock and exposes the application API. The [dispatcher::Dispatcher] owns the link and runs
//!  three tasks: delivery of inbound frames, sending of outbound frames one at a time, and the
//!  periodic retransmission tick.
//!
//! ## Frame
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//!  0: destination link address (u8)
//!  1: source link address (u8)
//!  2: destination port (u8, below 128)
//!  3: source port (u8, below 128)
//!  4: flags (u16) - SYN 0x1, ACK 0x2, STP 0x4, FIN 0x8; data frames have no flag set
//!  6: sequence number (u32)
//! 10: payload (up to 22 bytes)
//! ```

pub mod config;
pub mod connection;
pub mod connection_table;
pub mod dispatcher;
pub mod frame;
pub mod link;
mod outbound;
pub mod pending_accept_table;
pub mod port_allocator;
pub mod protocol;
pub mod session_key;
pub mod state;
pub mod window;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
