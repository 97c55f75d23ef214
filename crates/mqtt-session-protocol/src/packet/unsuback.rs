use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ProtocolVersion, ReasonCode};
use bytes::{Buf, BufMut};

/// MQTT UNSUBACK packet. v3.1.1 carries the packet identifier only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
    pub protocol_version: ProtocolVersion,
}

impl UnsubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, protocol_version: ProtocolVersion) -> Self {
        Self {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::default(),
            protocol_version,
        }
    }

    #[must_use]
    pub fn add_reason_code(mut self, code: ReasonCode) -> Self {
        self.reason_codes.push(code);
        self
    }

    /// # Errors
    /// Returns an error if decoding fails.
    pub fn decode_body_with_version<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "UNSUBACK missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let (properties, reason_codes) = match protocol_version {
            ProtocolVersion::V311 => (Properties::default(), Vec::new()),
            ProtocolVersion::V5 => {
                let properties = Properties::decode(buf)?;
                let mut codes = Vec::with_capacity(buf.remaining());
                while buf.has_remaining() {
                    let raw = buf.get_u8();
                    codes.push(ReasonCode::from_u8(raw).ok_or(MqttError::InvalidReasonCode(raw))?);
                }
                (properties, codes)
            }
        };

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
            protocol_version,
        })
    }
}

impl MqttPacket for UnsubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::UnsubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        if self.protocol_version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
            for code in &self.reason_codes {
                buf.put_u8((*code).into());
            }
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
    fn test_unsuback_v311() {
        let packet = UnsubAckPacket::new(3, ProtocolVersion::V311);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0xB0, 0x02, 0x00, 0x03]);
        assert_eq!(
            Packet::decode_frame(&bytes, ProtocolVersion::V311).unwrap(),
            Packet::UnsubAck(packet)
        );
    }

    #[test]
    fn test_unsuback_v5_round_trip() {
        let packet = UnsubAckPacket::new(3, ProtocolVersion::V5)
            .add_reason_code(ReasonCode::Success)
            .add_reason_code(ReasonCode::NoSubscriptionExisted);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(
            Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap(),
            Packet::UnsubAck(packet)
        );
    }
}
