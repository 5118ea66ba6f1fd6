//! Control payload envelope and peer state update body.

use crate::frame::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the `{port_id, reserved}` header.
pub const ENVELOPE_LEN: usize = 8;

/// Size of an encoded [`PeerStateUpdate`].
pub const PEER_STATE_UPDATE_LEN: usize = 8;

/// Header that precedes every control payload sent across processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEnvelope {
    /// Destination control port on the receiving module.
    pub port_id: u32,
    /// Always zero on send; ignored on receive.
    pub reserved: u32,
}

impl ControlEnvelope {
    pub fn new(port_id: u32) -> Self {
        Self {
            port_id,
            reserved: 0,
        }
    }

    /// Prepend the envelope to `payload`.
    pub fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + payload.len());
        buf.put_u32_le(self.port_id);
        buf.put_u32_le(self.reserved);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Split `bytes` into the envelope and the payload that follows it.
    pub fn split(bytes: &Bytes) -> Result<(Self, Bytes), WireError> {
        if bytes.len() < ENVELOPE_LEN {
            return Err(WireError::TooShort {
                expected: ENVELOPE_LEN,
                actual: bytes.len(),
            });
        }
        let mut header = &bytes[..ENVELOPE_LEN];
        let envelope = Self {
            port_id: header.get_u32_le(),
            reserved: header.get_u32_le(),
        };
        Ok((envelope, bytes.slice(ENVELOPE_LEN..)))
    }
}

/// Link state announced to a remote peer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Started = 1,
    Stopped = 2,
    Suspended = 3,
    Closed = 4,
}

impl PeerState {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        match value {
            1 => Ok(PeerState::Started),
            2 => Ok(PeerState::Stopped),
            3 => Ok(PeerState::Suspended),
            4 => Ok(PeerState::Closed),
            other => Err(WireError::InvalidPeerState(other)),
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Whether a receiver should treat its end of the link as connected.
    pub fn is_connected(self) -> bool {
        self == PeerState::Started
    }
}

/// Body of an [`Opcode::PeerStateUpdate`](crate::Opcode::PeerStateUpdate) packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStateUpdate {
    /// Port on the receiving module whose peer changed state.
    pub ctrl_port_id: u32,
    pub state: PeerState,
}

impl PeerStateUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PEER_STATE_UPDATE_LEN);
        buf.put_u32_le(self.ctrl_port_id);
        buf.put_u32_le(self.state.to_u32());
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PEER_STATE_UPDATE_LEN {
            return Err(WireError::TooShort {
                expected: PEER_STATE_UPDATE_LEN,
                actual: bytes.len(),
            });
        }
        let mut body = bytes;
        let ctrl_port_id = body.get_u32_le();
        let state = PeerState::from_u32(body.get_u32_le())?;
        Ok(Self {
            ctrl_port_id,
            state,
        })
    }
}
