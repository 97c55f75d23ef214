#![allow(dead_code)]

use bytes::BytesMut;
use mqtt_session::{
    ClientEvent, ClientOptions, ConnectOptions, ConnectResult, MqttClient, ProtocolVersion,
    StreamTransport,
};
use mqtt_session_protocol::packet::{ConnAckPacket, ConnectPacket, MqttPacket, Packet};
use mqtt_session_protocol::ReasonCode;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

pub type TestClient = MqttClient<StreamTransport<DuplexStream>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server end of a duplex pipe that answers with whatever the test scripts.
pub struct ScriptedBroker {
    stream: DuplexStream,
    buf: BytesMut,
    version: ProtocolVersion,
}

impl ScriptedBroker {
    pub async fn recv(&mut self) -> Packet {
        loop {
            if let Some(packet) = Packet::decode_from(&mut self.buf, self.version, None).unwrap() {
                return packet;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    pub async fn send<P: MqttPacket>(&mut self, packet: &P) {
        let frame = packet.to_bytes().unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn send_packet(&mut self, packet: &Packet) {
        let frame = packet.to_bytes().unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Reads CONNECT and answers with a successful CONNACK.
    pub async fn accept(&mut self, session_present: bool) -> ConnectPacket {
        let connect = match self.recv().await {
            Packet::Connect(connect) => *connect,
            other => panic!("expected CONNECT, got {other:?}"),
        };
        let connack = ConnAckPacket::new(session_present, ReasonCode::Success)
            .with_protocol_version(self.version);
        self.send(&connack).await;
        connect
    }

    /// Waits until the client drops its end.
    pub async fn expect_closed(&mut self) {
        loop {
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return;
            }
        }
    }
}

pub fn broker(version: ProtocolVersion) -> (StreamTransport<DuplexStream>, ScriptedBroker) {
    let (client_end, broker_end) = duplex(64 * 1024);
    (
        StreamTransport::new(client_end),
        ScriptedBroker {
            stream: broker_end,
            buf: BytesMut::new(),
            version,
        },
    )
}

pub fn client(
    version: ProtocolVersion,
    options: ClientOptions,
) -> (TestClient, ScriptedBroker) {
    let (transport, broker) = broker(version);
    (MqttClient::new(transport, options), broker)
}

pub fn v311_options(client_id: &str) -> ConnectOptions {
    ConnectOptions::new(client_id)
        .with_protocol_version(ProtocolVersion::V311)
        .with_keep_alive(Duration::ZERO)
}

pub fn v5_options(client_id: &str) -> ConnectOptions {
    ConnectOptions::new(client_id).with_keep_alive(Duration::ZERO)
}

/// Runs the CONNECT/CONNACK exchange and consumes the Connack event.
pub async fn connect(
    client: &mut TestClient,
    broker: &mut ScriptedBroker,
    options: &ConnectOptions,
    session_present: bool,
) -> ConnectResult {
    let (result, _) = tokio::join!(client.connect(options), broker.accept(session_present));
    let result = result.unwrap();
    match client.poll().await.unwrap() {
        ClientEvent::Connack {
            session_present: present,
            ..
        } => assert_eq!(present, session_present),
        other => panic!("expected Connack, got {other:?}"),
    }
    result
}
