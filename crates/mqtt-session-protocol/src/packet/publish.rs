use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const DUP_FLAG: u8 = 0x08;

/// MQTT PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Present exactly when `qos` is above `AtMostOnce`
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub properties: Properties,
    pub protocol_version: ProtocolVersion,
}

impl PublishPacket {
    /// Creates a v5.0 PUBLISH. The payload is copied into an owned buffer.
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            properties: Properties::default(),
            protocol_version: ProtocolVersion::V5,
        }
    }

    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        self.packet_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// # Errors
    /// Returns an error if the body is malformed.
    pub fn decode_body_with_version<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        let qos = QoS::try_from((fixed_header.flags >> 1) & 0x03).map_err(|_| {
            MqttError::MalformedPacket(format!(
                "Invalid PUBLISH QoS bits in flags 0x{:02X}",
                fixed_header.flags
            ))
        })?;
        let dup = fixed_header.flags & DUP_FLAG != 0;
        let retain = fixed_header.flags & 0x01 != 0;

        if qos == QoS::AtMostOnce && dup {
            return Err(MqttError::MalformedPacket(
                "DUP flag set on QoS 0 PUBLISH".to_string(),
            ));
        }

        let topic_name = decode_string(buf)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(MqttError::MalformedPacket(
                    "PUBLISH missing packet identifier".to_string(),
                ));
            }
            let id = buf.get_u16();
            if id == 0 {
                return Err(MqttError::MalformedPacket(
                    "PUBLISH packet identifier must be non-zero for QoS > 0".to_string(),
                ));
            }
            Some(id)
        };

        let properties = match protocol_version {
            ProtocolVersion::V5 => Properties::decode(buf)?,
            ProtocolVersion::V311 => Properties::default(),
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain,
            dup,
            properties,
            protocol_version,
        })
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = u8::from(self.qos) << 1;
        if self.dup {
            flags |= DUP_FLAG;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, &self.topic_name)?;

        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, _) => {}
            (_, Some(id)) if id != 0 => buf.put_u16(id),
            _ => {
                return Err(MqttError::MalformedPacket(
                    "PUBLISH with QoS > 0 requires a non-zero packet identifier".to_string(),
                ))
            }
        }

        if self.protocol_version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }

        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        Self::decode_body_with_version(buf, fixed_header, ProtocolVersion::V5)
    }
}

/// Returns a copy of an encoded PUBLISH frame with the DUP bit set.
///
/// The input buffer is left untouched.
///
/// # Errors
/// Returns `MalformedPacket` if `frame` is not a PUBLISH.
pub fn set_dup_flag(frame: &[u8]) -> Result<Bytes> {
    match frame.first() {
        Some(first) if first >> 4 == PacketType::Publish as u8 => {
            let mut out = BytesMut::from(frame);
            out[0] |= DUP_FLAG;
            Ok(out.freeze())
        }
        _ => Err(MqttError::MalformedPacket(
            "DUP flag applies to PUBLISH frames only".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn test_publish_qos0_v311_bytes() {
        let packet = PublishPacket::new("a/b", &b"hi"[..], QoS::AtMostOnce)
            .with_protocol_version(ProtocolVersion::V311);

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
        );
    }

    #[test]
    fn test_publish_qos1_round_trip_v5() {
        let mut properties = Properties::default();
        properties.set_message_expiry_interval(30);
        let packet = PublishPacket::new("sensors/temp", &b"21.5"[..], QoS::AtLeastOnce)
            .with_packet_id(10)
            .with_retain(true)
            .with_properties(properties);

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x33);

        let decoded = Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::Publish(packet));
    }

    #[test]
    fn test_publish_qos2_round_trip_v311() {
        let packet = PublishPacket::new("x", vec![1, 2, 3], QoS::ExactlyOnce)
            .with_packet_id(65_535)
            .with_protocol_version(ProtocolVersion::V311);

        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::decode_frame(&bytes, ProtocolVersion::V311).unwrap();
        assert_eq!(decoded, Packet::Publish(packet));
    }

    #[test]
    fn test_publish_requires_packet_id_for_qos1() {
        let packet = PublishPacket::new("t", &b""[..], QoS::AtLeastOnce);
        assert!(packet.to_bytes().is_err());
    }

    #[test]
    fn test_decode_rejects_zero_packet_id() {
        // QoS 1, topic "t", packet id 0
        let frame = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
        assert!(matches!(
            Packet::decode_frame(&frame, ProtocolVersion::V311),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_qos3() {
        let frame = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert!(Packet::decode_frame(&frame, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_set_dup_flag_copies() {
        let packet = PublishPacket::new("t", &b"p"[..], QoS::AtLeastOnce)
            .with_packet_id(1)
            .with_protocol_version(ProtocolVersion::V311);
        let original = packet.to_bytes().unwrap();

        let dup = set_dup_flag(&original).unwrap();
        assert_eq!(dup[0], original[0] | 0x08);
        assert_eq!(original[0] & 0x08, 0);
        assert_eq!(&dup[1..], &original[1..]);

        match Packet::decode_frame(&dup, ProtocolVersion::V311).unwrap() {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(1));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_set_dup_flag_rejects_other_packets() {
        let pubrel = [0x62, 0x02, 0x00, 0x01];
        assert!(set_dup_flag(&pubrel).is_err());
    }
}
