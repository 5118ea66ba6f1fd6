//! Wire format for control-link traffic that crosses a processor boundary.
//!
//! Two layers:
//!
//! - [`frame`]: the transport packet, addressed by `{domain_id, module_instance_id}`
//!   on both ends, with an opcode saying whether the payload is a trigger, a polling
//!   message, or a peer state update.
//! - [`envelope`]: the `{port_id, reserved}` header prepended to every control
//!   payload so the receiver can find the destination port, and the body of a
//!   peer state update.
//!
//! Everything is little-endian.

pub mod envelope;
pub mod frame;

pub use envelope::{ControlEnvelope, PeerState, PeerStateUpdate, ENVELOPE_LEN, PEER_STATE_UPDATE_LEN};
pub use frame::{Address, Opcode, Packet, WireError, PACKET_HEADER_LEN};
