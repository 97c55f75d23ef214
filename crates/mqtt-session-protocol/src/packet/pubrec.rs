use super::ack_common::{define_ack_packet, is_valid_publish_ack_reason_code};
use crate::packet::PacketType;

define_ack_packet! {
    /// MQTT PUBREC packet (`QoS` 2 publish received, part 1)
    pub struct PubRecPacket;
    packet_type = PacketType::PubRec;
    validator = is_valid_publish_ack_reason_code;
    error_prefix = "PUBREC";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FixedHeader, MqttPacket};
    use crate::types::ReasonCode;
    use bytes::BytesMut;

    #[test]
    fn test_pubrec_error_reason_round_trip() {
        let packet = PubRecPacket::new_with_reason(42, ReasonCode::NotAuthorized);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x50, 0x03, 0x00, 0x2A, 0x87]);

        let fixed_header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = PubRecPacket::decode_body(&mut buf, &fixed_header).unwrap();
        assert_eq!(decoded.reason_code, ReasonCode::NotAuthorized);
        assert!(decoded.reason_code.is_error());
    }

    #[test]
    fn test_pubrec_rejects_pubrel_only_reason() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x92][..]);
        let fixed_header = FixedHeader::new(PacketType::PubRec, 0, 3);
        assert!(PubRecPacket::decode_body(&mut buf, &fixed_header).is_err());
    }
}
