use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::session_key::SessionKey;

/// Ports are bounded by the size of the link address space
pub const PORT_LIMIT: u8 = 128;

bitflags! {
    /// Control bits of a frame. A data frame has none of them set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u16 {
        const SYN = 0b0001;
        const ACK = 0b0010;
        const STP = 0b0100;
        const FIN = 0b1000;
    }
}

/// The flag combinations that have a meaning in the protocol. Everything else is unroutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    RequestAck,
    Data,
    Ack,
    Stop,
    Finish,
    FinishAck,
}

/// A single frame as it travels over the link. All numbers in network byte order (BE):
///
/// ```ascii
///  0: destination link address (u8)
///  1: source link address (u8)
///  2: destination port (u8)
///  3: source port (u8)
///  4: flags (u16) - bit 0 SYN, bit 1 ACK, bit 2 STP, bit 3 FIN, all other bits must be zero
///  6: sequence number (u32)
/// 10: payload (rest of the frame)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst_addr: u8,
    pub src_addr: u8,
    pub dst_port: u8,
    pub src_port: u8,
    pub flags: FrameFlags,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_LEN: usize = 10;
    pub const MAX_FRAME_LEN: usize = 32;
    pub const MAX_PAYLOAD_LEN: usize = Self::MAX_FRAME_LEN - Self::HEADER_LEN;

    pub fn control(dst_addr: u8, dst_port: u8, src_addr: u8, src_port: u8, flags: FrameFlags, sequence: u32) -> Frame {
        Frame {
            dst_addr,
            src_addr,
            dst_port,
            src_port,
            flags,
            sequence,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> Option<FrameKind> {
        let syn_ack = FrameFlags::SYN | FrameFlags::ACK;
        let fin_ack = FrameFlags::FIN | FrameFlags::ACK;

        match self.flags {
            f if f.is_empty() => Some(FrameKind::Data),
            f if f == FrameFlags::SYN => Some(FrameKind::Request),
            f if f == syn_ack => Some(FrameKind::RequestAck),
            f if f == FrameFlags::ACK => Some(FrameKind::Ack),
            f if f == FrameFlags::STP => Some(FrameKind::Stop),
            f if f == FrameFlags::FIN => Some(FrameKind::Finish),
            f if f == fin_ack => Some(FrameKind::FinishAck),
            _ => None,
        }
    }

    /// The session this frame belongs to, seen from the receiving host
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.dst_port, self.src_addr, self.src_port)
    }

    /// A payload-less frame travelling back to this frame's sender
    pub fn reply(&self, flags: FrameFlags, sequence: u32) -> Frame {
        Frame::control(self.src_addr, self.src_port, self.dst_addr, self.dst_port, flags, sequence)
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        assert!(self.payload.len() <= Self::MAX_PAYLOAD_LEN, "payload exceeds the maximum frame size - this is a bug");

        buf.put_u8(self.dst_addr);
        buf.put_u8(self.src_addr);
        buf.put_u8(self.dst_port);
        buf.put_u8(self.src_port);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.sequence);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Frame> {
        if buf.len() < Self::HEADER_LEN {
            bail!("frame of length {} is shorter than the header", buf.len());
        }
        if buf.len() > Self::MAX_FRAME_LEN {
            bail!("frame of length {} exceeds the maximum frame length", buf.len());
        }

        let dst_addr = buf.get_u8();
        let src_addr = buf.get_u8();
        let dst_port = buf.get_u8();
        let src_port = buf.get_u8();
        if dst_port >= PORT_LIMIT || src_port >= PORT_LIMIT {
            bail!("port out of range: {} -> {}", src_port, dst_port);
        }

        let raw_flags = buf.get_u16();
        let Some(flags) = FrameFlags::from_bits(raw_flags) else {
            bail!("reserved flag bits set: {:#06x}", raw_flags);
        };
        let sequence = buf.get_u32();

        Ok(Frame {
            dst_addr,
            src_addr,
            dst_port,
            src_port,
            flags,
            sequence,
            payload: buf,
        })
    }
}
