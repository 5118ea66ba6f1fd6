//! Inter-processor packet codec.
//!
//! ## Wire Format
//!
//! ```text
//! offset  size  field
//! 0       4     opcode              (u32 LE)
//! 4       4     token               (u32 LE)
//! 8       4     src domain id       (u32 LE)
//! 12      4     src module instance (u32 LE)
//! 16      4     dst domain id       (u32 LE)
//! 20      4     dst module instance (u32 LE)
//! 24      4     payload length      (u32 LE)
//! ─── fixed-width above / variable-width below ───
//! 28      n     payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed packet header.
pub const PACKET_HEADER_LEN: usize = 28;

/// What the payload of a packet is.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Control message handled ahead of data on the receiver's command path
    Trigger = 0x0100_1001,
    /// Control message parked on the receiving port's queue until polled
    Polling = 0x0100_1002,
    /// The sender's side of a control link changed state
    PeerStateUpdate = 0x0100_1003,
}

impl Opcode {
    /// Parse a u32 into an Opcode
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        match value {
            0x0100_1001 => Ok(Opcode::Trigger),
            0x0100_1002 => Ok(Opcode::Polling),
            0x0100_1003 => Ok(Opcode::PeerStateUpdate),
            other => Err(WireError::InvalidOpcode(other)),
        }
    }

    /// Convert Opcode to u32
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// One end of a cross-processor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub domain_id: u32,
    pub module_instance_id: u32,
}

impl Address {
    pub fn new(domain_id: u32, module_instance_id: u32) -> Self {
        Self {
            domain_id,
            module_instance_id,
        }
    }
}

/// Errors during packet or envelope parsing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("Invalid opcode: {0:#010x}")]
    InvalidOpcode(u32),
    #[error("Invalid peer state: {0}")]
    InvalidPeerState(u32),
    #[error("Packet too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Payload length {declared} does not match {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },
}

/// A decoded inter-processor packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    pub token: u32,
    pub src: Address,
    pub dst: Address,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(opcode: Opcode, src: Address, dst: Address, payload: Bytes) -> Self {
        Self {
            opcode,
            token: 0,
            src,
            dst,
            payload,
        }
    }

    /// Set the sender's token, echoed back in acknowledgements.
    pub fn with_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.opcode.to_u32());
        buf.put_u32_le(self.token);
        buf.put_u32_le(self.src.domain_id);
        buf.put_u32_le(self.src.module_instance_id);
        buf.put_u32_le(self.dst.domain_id);
        buf.put_u32_le(self.dst.module_instance_id);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet. The payload is a zero-copy slice of `bytes`.
    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(WireError::TooShort {
                expected: PACKET_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let mut header = &bytes[..PACKET_HEADER_LEN];
        let opcode = Opcode::from_u32(header.get_u32_le())?;
        let token = header.get_u32_le();
        let src = Address::new(header.get_u32_le(), header.get_u32_le());
        let dst = Address::new(header.get_u32_le(), header.get_u32_le());
        let declared = header.get_u32_le() as usize;

        let actual = bytes.len() - PACKET_HEADER_LEN;
        if declared != actual {
            return Err(WireError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            opcode,
            token,
            src,
            dst,
            payload: bytes.slice(PACKET_HEADER_LEN..),
        })
    }
}
