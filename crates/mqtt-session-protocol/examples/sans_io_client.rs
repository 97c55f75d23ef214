use mqtt_session_protocol::packet::{
    ConnAckPacket, Packet, PubAckPacket, PubCompPacket, PubRecPacket,
};
use mqtt_session_protocol::{
    ClientOptions, ClientProtocol, ConnectOptions, MemoryPersistence, ProtocolAction,
    ProtocolVersion, QoS, ReasonCode, SessionPersistence,
};
use std::time::Instant;

fn main() {
    println!("Sans-io MQTT session example");
    println!("============================\n");

    let mut sink = MemoryPersistence::new();
    let mut protocol = ClientProtocol::new(ClientOptions::default());
    let options = ConnectOptions::new("embedded-device-001")
        .with_protocol_version(ProtocolVersion::V311)
        .with_clean_start(false);

    println!("1. Connecting with a persistent session...");
    let actions = protocol
        .connect(&options, Instant::now())
        .expect("connect");
    process_actions(&actions, "Connect", &mut sink);

    let connack =
        ConnAckPacket::new(false, ReasonCode::Success).with_protocol_version(ProtocolVersion::V311);
    let actions = protocol.handle_connack(&connack);
    process_actions(&actions, "CONNACK", &mut sink);

    println!("\n2. Publishing QoS 1 and QoS 2 messages...");
    let (qos1, actions) = protocol
        .publish("actuators/led", &b"ON"[..], QoS::AtLeastOnce, false)
        .expect("publish");
    process_actions(&actions, "Publish QoS1", &mut sink);
    let (qos2, actions) = protocol
        .publish("actuators/door", &b"OPEN"[..], QoS::ExactlyOnce, false)
        .expect("publish");
    process_actions(&actions, "Publish QoS2", &mut sink);
    println!("   In flight: {}, persisted: {}", protocol.pending_count(), sink.len());

    println!("\n3. Broker answers PUBREC, then the connection drops...");
    let qos2 = qos2.expect("QoS 2 has an identifier");
    let actions = protocol.handle_packet(&Packet::PubRec(PubRecPacket::new(qos2)));
    process_actions(&actions, "PUBREC", &mut sink);
    let actions = protocol.connection_lost(Instant::now());
    process_actions(&actions, "Connection lost", &mut sink);

    println!("\n4. Restoring into a fresh client from the persisted entries...");
    let mut restored = ClientProtocol::new(ClientOptions::default());
    for (key, data) in sink.iter() {
        restored
            .restore_serialized(key.packet_id, data)
            .expect("restore");
    }
    let actions = restored
        .connect(&options, Instant::now())
        .expect("connect");
    process_actions(&actions, "Reconnect", &mut sink);
    let resumed =
        ConnAckPacket::new(true, ReasonCode::Success).with_protocol_version(ProtocolVersion::V311);
    let actions = restored.handle_connack(&resumed);
    process_actions(&actions, "CONNACK (session present)", &mut sink);

    println!("\n5. Broker completes both exchanges...");
    let qos1 = qos1.expect("QoS 1 has an identifier");
    let actions = restored.handle_packet(&Packet::PubAck(PubAckPacket::new(qos1)));
    process_actions(&actions, "PUBACK", &mut sink);
    let actions = restored.handle_packet(&Packet::PubComp(PubCompPacket::new(qos2)));
    process_actions(&actions, "PUBCOMP", &mut sink);

    println!(
        "\n   In flight: {}, persisted: {}",
        restored.pending_count(),
        sink.len()
    );
}

fn process_actions(actions: &[ProtocolAction], context: &str, sink: &mut MemoryPersistence) {
    println!("   [{context}] {} action(s):", actions.len());
    for action in actions {
        match action {
            ProtocolAction::Send(frame) => {
                println!("     -> send {} bytes (first byte 0x{:02X})", frame.len(), frame[0]);
            }
            ProtocolAction::Emit(event) => println!("     -> event {event:?}"),
            ProtocolAction::Persist(change) => {
                println!("     -> persist {:?}", change.key());
                sink.apply(change);
            }
            ProtocolAction::ScheduleKeepalive { interval_secs } => {
                println!("     -> keep-alive every {interval_secs}s");
            }
            ProtocolAction::Close => println!("     -> close transport"),
        }
    }
}
