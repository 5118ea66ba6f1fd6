//! Packet and envelope framing as seen by a transport.

use bytes::Bytes;
use imclproto::{Address, ControlEnvelope, Opcode, Packet, PeerState, PeerStateUpdate, WireError};
use pretty_assertions::assert_eq;

#[test]
fn test_control_packet_survives_the_wire() {
    let body = ControlEnvelope::new(7).wrap(b"gain=-6dB");
    let mut packet = Packet::new(
        Opcode::Trigger,
        Address::new(1, 0x4000),
        Address::new(2, 0x5000),
        body,
    );
    packet.token = 0;

    let decoded = Packet::decode(packet.encode()).unwrap();
    assert_eq!(decoded, packet);

    let (envelope, payload) = ControlEnvelope::split(&decoded.payload).unwrap();
    assert_eq!(envelope, ControlEnvelope { port_id: 7, reserved: 0 });
    assert_eq!(payload, Bytes::from_static(b"gain=-6dB"));
}

#[test]
fn test_peer_state_update_packet() {
    let update = PeerStateUpdate {
        ctrl_port_id: 3,
        state: PeerState::Suspended,
    };
    let packet = Packet::new(
        Opcode::PeerStateUpdate,
        Address::new(1, 10),
        Address::new(3, 20),
        update.encode(),
    );

    let decoded = Packet::decode(packet.encode()).unwrap();
    assert_eq!(decoded.opcode, Opcode::PeerStateUpdate);
    assert_eq!(PeerStateUpdate::decode(&decoded.payload).unwrap(), update);
}

#[test]
fn test_unknown_opcode_is_reported() {
    let mut wire = Packet::new(
        Opcode::Polling,
        Address::new(0, 0),
        Address::new(0, 0),
        Bytes::new(),
    )
    .encode()
    .to_vec();
    wire[..4].copy_from_slice(&0x1234u32.to_le_bytes());

    assert_eq!(
        Packet::decode(Bytes::from(wire)).unwrap_err(),
        WireError::InvalidOpcode(0x1234)
    );
}
