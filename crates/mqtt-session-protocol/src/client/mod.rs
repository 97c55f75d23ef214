pub mod actions;
pub mod options;
pub mod protocol;
pub mod state;

pub use actions::{ClientEvent, EventHandler, ProtocolAction};
pub use options::{ClientOptions, DEFAULT_MAX_INCOMING_PACKET_SIZE};
pub use protocol::ClientProtocol;
pub use state::ClientState;
