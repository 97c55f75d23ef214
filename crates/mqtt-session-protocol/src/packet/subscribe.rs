use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut};

/// Per-filter subscription options. Only `qos` reaches a v3.1.1 broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    /// 0 send at subscribe, 1 send if new, 2 never
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> u8 {
        u8::from(self.qos)
            | (u8::from(self.no_local) << 2)
            | (u8::from(self.retain_as_published) << 3)
            | ((self.retain_handling & 0x03) << 4)
    }

    /// # Errors
    /// Returns `MalformedPacket` for reserved bits or invalid values.
    pub fn decode(byte: u8) -> Result<Self> {
        if byte & 0xC0 != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved bits in subscription options must be 0".to_string(),
            ));
        }
        let retain_handling = (byte >> 4) & 0x03;
        if retain_handling == 3 {
            return Err(MqttError::MalformedPacket(
                "Invalid retain handling value 3".to_string(),
            ));
        }
        Ok(Self {
            qos: QoS::try_from(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            options: SubscriptionOptions::new(qos),
        }
    }
}

/// MQTT SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
    pub properties: Properties,
    pub protocol_version: ProtocolVersion,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, protocol_version: ProtocolVersion) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            properties: Properties::default(),
            protocol_version,
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push(TopicFilter::new(filter, qos));
        self
    }

    #[must_use]
    pub fn add_topic_filter(mut self, filter: TopicFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// # Errors
    /// Returns an error if decoding fails.
    pub fn decode_body_with_version<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        if fixed_header.flags != 0x02 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid SUBSCRIBE flags: expected 0x02, got 0x{:02X}",
                fixed_header.flags
            )));
        }

        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();
        if packet_id == 0 {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE packet identifier must be non-zero".to_string(),
            ));
        }

        let properties = if protocol_version == ProtocolVersion::V5 {
            Properties::decode(buf)?
        } else {
            Properties::default()
        };

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE packet must contain at least one topic filter".to_string(),
            ));
        }

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(
                    "Missing subscription options for topic filter".to_string(),
                ));
            }
            let options_byte = buf.get_u8();
            let options = match protocol_version {
                ProtocolVersion::V5 => SubscriptionOptions::decode(options_byte)?,
                ProtocolVersion::V311 => SubscriptionOptions::new(QoS::try_from(options_byte)?),
            };
            filters.push(TopicFilter { filter, options });
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
            protocol_version,
        })
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE packet must contain at least one topic filter".to_string(),
            ));
        }

        buf.put_u16(self.packet_id);
        if self.protocol_version == ProtocolVersion::V5 {
            self.properties.encode(buf)?;
        }

        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            match self.protocol_version {
                ProtocolVersion::V5 => buf.put_u8(filter.options.encode()),
                ProtocolVersion::V311 => buf.put_u8(filter.options.qos.into()),
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
    use bytes::BytesMut;

    #[test]
    fn test_subscribe_v311_bytes() {
        let packet =
            SubscribePacket::new(1, ProtocolVersion::V311).add_filter("a", QoS::ExactlyOnce);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x02]);
    }

    #[test]
    fn test_subscribe_v5_round_trip() {
        let options = SubscriptionOptions {
            qos: QoS::AtLeastOnce,
            no_local: true,
            retain_as_published: true,
            retain_handling: 2,
        };
        let packet = SubscribePacket::new(789, ProtocolVersion::V5)
            .add_filter("sensor/temp", QoS::AtMostOnce)
            .add_topic_filter(TopicFilter {
                filter: "sensor/+".to_string(),
                options,
            });

        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::Subscribe(packet));
    }

    #[test]
    fn test_subscribe_invalid_flags() {
        let mut buf = BytesMut::new();
        buf.put_u16(123);

        let fixed_header = FixedHeader::new(PacketType::Subscribe, 0x00, 2);
        let result =
            SubscribePacket::decode_body_with_version(&mut buf, &fixed_header, ProtocolVersion::V5);
        assert!(result.is_err());
    }

    #[test]
    fn test_subscribe_empty_filters() {
        let packet = SubscribePacket::new(123, ProtocolVersion::V5);
        assert!(packet.to_bytes().is_err());
    }

    #[test]
    fn test_subscription_options_reserved_bits() {
        assert!(SubscriptionOptions::decode(0x40).is_err());
        assert!(SubscriptionOptions::decode(0x30).is_err());
        assert_eq!(
            SubscriptionOptions::decode(0x2D).unwrap(),
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                no_local: true,
                retain_as_published: true,
                retain_handling: 2,
            }
        );
    }
}
