use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ProtocolVersion, ReasonCode};
use bytes::{Buf, BufMut};

/// MQTT SUBACK packet
///
/// v3.1.1 return codes (0, 1, 2 and 0x80) share their numeric values with
/// the v5.0 reason codes, so both versions decode into [`ReasonCode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
    pub protocol_version: ProtocolVersion,
}

impl SubAckPacket {
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
                "SUBACK missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let properties = if protocol_version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::default()
        };

        let mut reason_codes = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            let raw = buf.get_u8();
            let code = match (protocol_version, raw) {
                (ProtocolVersion::V311, 0x00..=0x02 | 0x80) | (ProtocolVersion::V5, _) => {
                    ReasonCode::from_u8(raw)
                }
                (ProtocolVersion::V311, _) => None,
            };
            reason_codes.push(code.ok_or(MqttError::InvalidReasonCode(raw))?);
        }

        if reason_codes.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBACK must contain at least one reason code".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
            protocol_version,
        })
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        if self.protocol_version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }
        for code in &self.reason_codes {
            buf.put_u8((*code).into());
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
    fn test_suback_v311_failure_code() {
        let frame = [0x90, 0x04, 0x00, 0x05, 0x01, 0x80];
        match Packet::decode_frame(&frame, ProtocolVersion::V311).unwrap() {
            Packet::SubAck(p) => {
                assert_eq!(p.packet_id, 5);
                assert_eq!(
                    p.reason_codes,
                    vec![ReasonCode::GrantedQoS1, ReasonCode::UnspecifiedError]
                );
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_suback_v311_rejects_v5_code() {
        let frame = [0x90, 0x03, 0x00, 0x05, 0x87];
        assert!(Packet::decode_frame(&frame, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_suback_v5_round_trip() {
        let packet = SubAckPacket::new(9, ProtocolVersion::V5)
            .add_reason_code(ReasonCode::GrantedQoS2)
            .add_reason_code(ReasonCode::NotAuthorized);
        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::SubAck(packet));
    }
}
