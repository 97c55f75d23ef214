use crate::keepalive::KeepaliveConfig;

/// Incoming frame limit applied unless the caller picks another one.
pub const DEFAULT_MAX_INCOMING_PACKET_SIZE: usize = 1024 * 1024;

/// Client behaviour that is not negotiated with the server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Answer PUBLISH/PUBREC/PUBREL without application involvement.
    /// When off, QoS 2 duplicates are only suppressed after `send_pubrec`.
    pub auto_ack: bool,
    /// Frames whose total size exceeds this are rejected before decoding.
    /// `None` accepts anything up to the protocol maximum.
    pub max_incoming_packet_size: Option<usize>,
    pub keepalive: KeepaliveConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            max_incoming_packet_size: Some(DEFAULT_MAX_INCOMING_PACKET_SIZE),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn with_max_incoming_packet_size(mut self, size: usize) -> Self {
        self.max_incoming_packet_size = Some(size);
        self
    }

    #[must_use]
    pub fn without_max_incoming_packet_size(mut self) -> Self {
        self.max_incoming_packet_size = None;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }
}
