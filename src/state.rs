use std::fmt::{Display, Formatter};

/// All states of the per-connection protocol state machine.
///
/// ```ascii
///  CLOSED --connect--> SYN_SENT --SYN/ACK--> ESTABLISHED
///    |                    |
///    |                    +--SYN (simultaneous open)--> DEADLOCK
///    +--SYN--> SYN_RCVD --accept--> ESTABLISHED
///
///  ESTABLISHED --close, data pending--> STP_SENT --drained--> CLOSING
///  ESTABLISHED --close, nothing pending-----------------------> CLOSING
///  ESTABLISHED --STP--> STP_RCVD --close--> CLOSING
///  CLOSING --FIN or FIN/ACK--> CLOSED
///  ESTABLISHED, STP_SENT, STP_RCVD --FIN--> CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// initial and terminal state
    #[default]
    Closed,
    SynSent,
    SynRcvd,
    Established,
    /// local side announced its end of stream and is flushing outstanding data
    StpSent,
    /// peer announced its end of stream; no more data is sent to it
    StpRcvd,
    Closing,
    /// both sides opened to each other on the same port pair - terminal for this connection object
    Deadlock,
}

impl ConnectionState {
    /// no new data may be queued for sending in these states
    pub fn is_closing(&self) -> bool {
        matches!(self, ConnectionState::StpSent | ConnectionState::StpRcvd | ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynRcvd => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::StpSent => "STP_SENT",
            ConnectionState::StpRcvd => "STP_RCVD",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Deadlock => "DEADLOCK",
        };
        write!(f, "{}", name)
    }
}
