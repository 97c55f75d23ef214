#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::unused_self)]
#![allow(clippy::needless_borrows_for_generic_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_lossless)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod packet_id;
pub mod persist;
pub mod protocol;
pub mod qos;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use client::{
    ClientEvent, ClientOptions, ClientProtocol, ClientState, EventHandler, ProtocolAction,
    DEFAULT_MAX_INCOMING_PACKET_SIZE,
};
pub use error::{MqttError, Result};
pub use keepalive::{KeepaliveConfig, KeepaliveState, KeepaliveStep};
pub use packet::{FixedHeader, MqttPacket, Packet, PacketType};
pub use packet_id::PacketIdAllocator;
pub use persist::{MemoryPersistence, PersistAction, SessionPersistence};
pub use protocol::v5::properties::{Properties, PropertyId, PropertyValue, PropertyValueType};
pub use protocol::v5::reason_codes::ReasonCode;
pub use session::{Session, SessionExpiry};
pub use store::{Direction, Store, StoreEntry, StoreKey};
pub use transport::Transport;
pub use types::{
    ConnectOptions, ConnectProperties, ConnectResult, Message, ProtocolVersion, QoS, WillMessage,
};
