#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod client;
pub mod transport;

pub use client::MqttClient;
pub use transport::{StreamTransport, TcpConfig, TcpTransport};

pub use mqtt_session_protocol::{
    packet, persist, ClientEvent, ClientOptions, ConnectOptions, ConnectResult, Direction,
    EventHandler, KeepaliveConfig, MemoryPersistence, Message, MqttError, PersistAction,
    Properties, PropertyId, PropertyValue, ProtocolVersion, QoS, ReasonCode, Result,
    SessionExpiry, SessionPersistence, StoreKey, Transport, DEFAULT_MAX_INCOMING_PACKET_SIZE,
};
