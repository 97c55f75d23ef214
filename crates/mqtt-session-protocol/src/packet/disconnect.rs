use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ProtocolVersion, ReasonCode};
use bytes::{Buf, BufMut};

/// MQTT DISCONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    pub properties: Properties,
    pub protocol_version: ProtocolVersion,
}

impl DisconnectPacket {
    #[must_use]
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
            protocol_version,
        }
    }

    #[must_use]
    pub fn with_reason_code(mut self, reason_code: ReasonCode) -> Self {
        self.reason_code = reason_code;
        self
    }

    /// Overrides the session expiry interval negotiated at connect time.
    #[must_use]
    pub fn with_session_expiry_interval(mut self, interval: u32) -> Self {
        self.properties.set_session_expiry_interval(interval);
        self
    }

    /// # Errors
    /// Returns an error if decoding fails.
    pub fn decode_body_with_version<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        if protocol_version == ProtocolVersion::V311 || !buf.has_remaining() {
            return Ok(Self::new(protocol_version));
        }

        let raw = buf.get_u8();
        let reason_code = ReasonCode::from_u8(raw).ok_or(MqttError::InvalidReasonCode(raw))?;
        let properties = if buf.has_remaining() {
            Properties::decode(buf)?
        } else {
            Properties::default()
        };

        Ok(Self {
            reason_code,
            properties,
            protocol_version,
        })
    }
}

impl MqttPacket for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.protocol_version == ProtocolVersion::V311
            || (self.reason_code == ReasonCode::Success && self.properties.is_empty())
        {
            return Ok(());
        }
        buf.put_u8(self.reason_code.into());
        if !self.properties.is_empty() {
            self.properties.encode(buf)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        Self::decode_body_with_version(buf, fixed_header, ProtocolVersion::V5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn test_disconnect_minimal() {
        for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
            let bytes = DisconnectPacket::new(version).to_bytes().unwrap();
            assert_eq!(&bytes[..], &[0xE0, 0x00]);
        }
    }

    #[test]
    fn test_disconnect_v5_with_reason_round_trip() {
        let packet = DisconnectPacket::new(ProtocolVersion::V5)
            .with_reason_code(ReasonCode::SessionTakenOver);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0xE0, 0x01, 0x8E]);
        assert_eq!(
            Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap(),
            Packet::Disconnect(packet)
        );
    }

    #[test]
    fn test_disconnect_session_expiry_override() {
        let packet =
            DisconnectPacket::new(ProtocolVersion::V5).with_session_expiry_interval(0);
        let bytes = packet.to_bytes().unwrap();
        match Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap() {
            Packet::Disconnect(p) => assert_eq!(p.properties.session_expiry_interval(), Some(0)),
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
