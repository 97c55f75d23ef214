use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ProtocolVersion, ReasonCode};
use bytes::{Buf, BufMut};

/// MQTT CONNACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    /// v3.1.1 return codes are mapped onto their v5.0 equivalents
    pub reason_code: ReasonCode,
    pub properties: Properties,
    pub protocol_version: ProtocolVersion,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, reason_code: ReasonCode) -> Self {
        Self {
            session_present,
            reason_code,
            properties: Properties::default(),
            protocol_version: ProtocolVersion::V5,
        }
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, interval: u32) -> Self {
        self.properties.set_session_expiry_interval(interval);
        self
    }

    /// # Errors
    /// Returns an error if the body is malformed.
    pub fn decode_body_with_version<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK body truncated".to_string(),
            ));
        }
        let ack_flags = buf.get_u8();
        if ack_flags & 0xFE != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid CONNACK acknowledge flags: 0x{ack_flags:02X}"
            )));
        }
        let raw = buf.get_u8();

        let (reason_code, properties) = match protocol_version {
            ProtocolVersion::V311 => (
                ReasonCode::from_v311_connack(raw).ok_or(MqttError::InvalidReasonCode(raw))?,
                Properties::default(),
            ),
            ProtocolVersion::V5 => {
                let reason_code =
                    ReasonCode::from_u8(raw).ok_or(MqttError::InvalidReasonCode(raw))?;
                let properties = if buf.has_remaining() {
                    Properties::decode(buf)?
                } else {
                    Properties::default()
                };
                (reason_code, properties)
            }
        };

        let session_present = ack_flags & 0x01 != 0;
        if session_present && reason_code != ReasonCode::Success {
            return Err(MqttError::MalformedPacket(
                "CONNACK session present with non-zero reason code".to_string(),
            ));
        }

        Ok(Self {
            session_present,
            reason_code,
            properties,
            protocol_version,
        })
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(u8::from(self.session_present));
        match self.protocol_version {
            ProtocolVersion::V311 => buf.put_u8(self.reason_code.to_v311_connack()),
            ProtocolVersion::V5 => {
                buf.put_u8(self.reason_code.into());
                self.properties.encode(buf)?;
            }
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        Self::decode_body_with_version(buf, fixed_header, ProtocolVersion::V5)
    }
}
