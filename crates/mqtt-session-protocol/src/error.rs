use crate::packet::PacketType;
use crate::protocol::v5::reason_codes::ReasonCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection refused: {0:?}")]
    ConnectionRefused(ReasonCode),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Client closed connection")]
    ClientClosed,

    #[error("Connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("Invalid packet identifier: 0")]
    InvalidPacketId,

    #[error("Packet identifier not found: {0}")]
    PacketIdNotFound(u16),

    #[error("Packet identifier already in use: {0}")]
    PacketIdInUse(u16),

    #[error("Packet ID exhausted")]
    PacketIdExhausted,

    #[error("Unsolicited {packet_type:?} for packet identifier {packet_id}")]
    UnsolicitedAcknowledgment {
        packet_id: u16,
        packet_type: PacketType,
    },

    #[error(
        "Out of order {received:?} for packet identifier {packet_id}: expected {expected:?}"
    )]
    OutOfOrderAcknowledgment {
        packet_id: u16,
        expected: PacketType,
        received: PacketType,
    },

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid reason code: {0}")]
    InvalidReasonCode(u8),

    #[error("Invalid property ID: {0}")]
    InvalidPropertyId(u8),

    #[error("Duplicate property ID: {0}")]
    DuplicatePropertyId(u8),

    #[error("Unsupported protocol version")]
    UnsupportedProtocolVersion,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("String too long: {0} bytes exceeds maximum of 65535")]
    StringTooLong(usize),

    #[error("Session state corrupted: {0}")]
    CorruptSessionState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MqttError {
    #[must_use]
    pub fn is_normal_disconnect(&self) -> bool {
        match self {
            Self::ClientClosed | Self::ConnectionClosedByPeer => true,
            Self::Io(msg)
                if msg.contains("stream has been shut down")
                    || msg.contains("Connection reset") =>
            {
                true
            }
            _ => false,
        }
    }

    /// Errors that end the connection but leave the session intact.
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionError(_)
                | Self::ConnectionClosedByPeer
                | Self::MalformedPacket(_)
                | Self::PacketTooLarge { .. }
                | Self::OutOfOrderAcknowledgment { .. }
                | Self::ProtocolError(_)
                | Self::KeepAliveTimeout
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

impl From<String> for MqttError {
    fn from(msg: String) -> Self {
        MqttError::MalformedPacket(msg)
    }
}

impl From<&str> for MqttError {
    fn from(msg: &str) -> Self {
        MqttError::MalformedPacket(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MqttError::PacketIdInUse(7);
        assert_eq!(err.to_string(), "Packet identifier already in use: 7");

        let err = MqttError::PacketTooLarge {
            size: 1000,
            max: 500,
        };
        assert_eq!(
            err.to_string(),
            "Packet too large: size 1000 exceeds maximum 500"
        );

        let err = MqttError::ConnectionRefused(ReasonCode::BadUsernameOrPassword);
        assert_eq!(err.to_string(), "Connection refused: BadUsernameOrPassword");

        let err = MqttError::OutOfOrderAcknowledgment {
            packet_id: 3,
            expected: PacketType::PubRec,
            received: PacketType::PubComp,
        };
        assert_eq!(
            err.to_string(),
            "Out of order PubComp for packet identifier 3: expected PubRec"
        );
    }

    #[test]
    fn test_error_from_io() {
        use std::io;
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "test");
        let mqtt_err: MqttError = io_err.into();
        match mqtt_err {
            MqttError::Io(e) => assert!(e.contains("test")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_connection_level_classification() {
        assert!(MqttError::Io("reset".to_string()).is_connection_level());
        assert!(MqttError::OutOfOrderAcknowledgment {
            packet_id: 1,
            expected: PacketType::PubAck,
            received: PacketType::PubComp,
        }
        .is_connection_level());
        assert!(!MqttError::PacketIdExhausted.is_connection_level());
        assert!(!MqttError::PacketIdInUse(1).is_connection_level());
        assert!(!MqttError::UnsolicitedAcknowledgment {
            packet_id: 1,
            packet_type: PacketType::PubAck,
        }
        .is_connection_level());
    }

    #[test]
    fn test_result_type() {
        #[allow(clippy::unnecessary_wraps)]
        fn returns_result() -> Result<String> {
            Ok("success".to_string())
        }

        fn returns_error() -> Result<String> {
            Err(MqttError::NotConnected)
        }

        assert!(returns_result().is_ok());
        assert!(returns_error().is_err());
    }
}
