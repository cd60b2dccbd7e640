use std::fmt::{Display, Formatter};
use bytes::Bytes;
use crate::frame::{Frame, FrameFlags};

/// Identifies a session from the local host's point of view. No two live connections share a key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SessionKey {
    pub local_port: u8,
    pub remote_addr: u8,
    pub remote_port: u8,
}

impl SessionKey {
    pub fn new(local_port: u8, remote_addr: u8, remote_port: u8) -> SessionKey {
        SessionKey {
            local_port,
            remote_addr,
            remote_port,
        }
    }
}

/// Everything needed to address frames to the remote end of a session
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Route {
    pub local_addr: u8,
    pub key: SessionKey,
}

impl Route {
    pub fn new(local_addr: u8, key: SessionKey) -> Route {
        Route { local_addr, key }
    }

    pub fn frame(&self, flags: FrameFlags, sequence: u32, payload: Bytes) -> Frame {
        Frame {
            dst_addr: self.key.remote_addr,
            src_addr: self.local_addr,
            dst_port: self.key.remote_port,
            src_port: self.key.local_port,
            flags,
            sequence,
            payload,
        }
    }

    pub fn control(&self, flags: FrameFlags, sequence: u32) -> Frame {
        self.frame(flags, sequence, Bytes::new())
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}:{}", self.local_port, self.remote_addr, self.remote_port)
    }
}
