use crate::error::{MqttError, Result};
use crate::packet::FixedHeader;
use crate::protocol::v5::properties::Properties;
use crate::types::ReasonCode;
use bytes::{Buf, BufMut};

pub fn is_valid_publish_ack_reason_code(code: ReasonCode) -> bool {
    matches!(
        code,
        ReasonCode::Success
            | ReasonCode::NoMatchingSubscribers
            | ReasonCode::UnspecifiedError
            | ReasonCode::ImplementationSpecificError
            | ReasonCode::NotAuthorized
            | ReasonCode::TopicNameInvalid
            | ReasonCode::PacketIdentifierInUse
            | ReasonCode::QuotaExceeded
            | ReasonCode::PayloadFormatInvalid
    )
}

pub fn is_valid_pubrel_reason_code(code: ReasonCode) -> bool {
    matches!(
        code,
        ReasonCode::Success | ReasonCode::PacketIdentifierNotFound
    )
}

/// Writes the shared PUBACK/PUBREC/PUBREL/PUBCOMP body.
///
/// The two byte form is used whenever it carries the same meaning, which
/// also makes it the only form a v3.1.1 peer ever sees.
pub(crate) fn encode_ack_body<B: BufMut>(
    buf: &mut B,
    packet_id: u16,
    reason_code: ReasonCode,
    properties: &Properties,
) -> Result<()> {
    buf.put_u16(packet_id);
    if reason_code == ReasonCode::Success && properties.is_empty() {
        return Ok(());
    }
    buf.put_u8(reason_code.into());
    if !properties.is_empty() {
        properties.encode(buf)?;
    }
    Ok(())
}

pub(crate) fn decode_ack_body<B: Buf>(
    buf: &mut B,
    fixed_header: &FixedHeader,
    error_prefix: &str,
    validator: fn(ReasonCode) -> bool,
) -> Result<(u16, ReasonCode, Properties)> {
    if buf.remaining() < 2 || fixed_header.remaining_length < 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{error_prefix} missing packet identifier"
        )));
    }
    let packet_id = buf.get_u16();
    if packet_id == 0 {
        return Err(MqttError::MalformedPacket(format!(
            "{error_prefix} packet identifier must be non-zero"
        )));
    }

    if fixed_header.remaining_length == 2 {
        return Ok((packet_id, ReasonCode::Success, Properties::default()));
    }

    if !buf.has_remaining() {
        return Err(MqttError::MalformedPacket(format!(
            "{error_prefix} missing reason code"
        )));
    }
    let raw = buf.get_u8();
    let reason_code = ReasonCode::from_u8(raw).ok_or_else(|| {
        MqttError::MalformedPacket(format!("Invalid {error_prefix} reason code: 0x{raw:02X}"))
    })?;
    if !validator(reason_code) {
        return Err(MqttError::MalformedPacket(format!(
            "Invalid {error_prefix} reason code: {reason_code:?}"
        )));
    }

    let properties = if fixed_header.remaining_length > 3 {
        Properties::decode(buf)?
    } else {
        Properties::default()
    };

    Ok((packet_id, reason_code, properties))
}

macro_rules! define_ack_packet {
    (@flags) => { 0x00 };
    (@flags $flags:literal) => { $flags };
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
        packet_type = $packet_type:expr;
        validator = $validator:path;
        error_prefix = $prefix:literal;
        $(flags = $flags:literal;)?
        $(validate_flags = $validate:literal;)?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            pub reason_code: $crate::types::ReasonCode,
            pub properties: $crate::protocol::v5::properties::Properties,
        }

        impl $name {
            const FLAGS: u8 = define_ack_packet!(@flags $($flags)?);

            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self::new_with_reason(packet_id, $crate::types::ReasonCode::Success)
            }

            #[must_use]
            pub fn new_with_reason(packet_id: u16, reason_code: $crate::types::ReasonCode) -> Self {
                Self {
                    packet_id,
                    reason_code,
                    properties: $crate::protocol::v5::properties::Properties::default(),
                }
            }

            #[must_use]
            pub fn with_reason_string(mut self, reason: String) -> Self {
                self.properties.set_reason_string(reason);
                self
            }

            #[must_use]
            pub fn with_user_property(mut self, key: String, value: String) -> Self {
                self.properties.add_user_property(key, value);
                self
            }

            /// Drops everything a v3.1.1 peer cannot receive.
            #[must_use]
            pub fn into_v311(self) -> Self {
                Self::new(self.packet_id)
            }
        }

        impl $crate::packet::MqttPacket for $name {
            fn packet_type(&self) -> $crate::packet::PacketType {
                $packet_type
            }

            fn flags(&self) -> u8 {
                Self::FLAGS
            }

            fn encode_body<B: bytes::BufMut>(&self, buf: &mut B) -> $crate::error::Result<()> {
                $crate::packet::ack_common::encode_ack_body(
                    buf,
                    self.packet_id,
                    self.reason_code,
                    &self.properties,
                )
            }

            fn decode_body<B: bytes::Buf>(
                buf: &mut B,
                fixed_header: &$crate::packet::FixedHeader,
            ) -> $crate::error::Result<Self> {
                $(
                    if $validate && fixed_header.flags != Self::FLAGS {
                        return Err($crate::error::MqttError::MalformedPacket(format!(
                            "Invalid {} flags: 0x{:02X}",
                            $prefix, fixed_header.flags
                        )));
                    }
                )?
                let (packet_id, reason_code, properties) =
                    $crate::packet::ack_common::decode_ack_body(
                        buf,
                        fixed_header,
                        $prefix,
                        $validator,
                    )?;
                Ok(Self {
                    packet_id,
                    reason_code,
                    properties,
                })
            }
        }
    };
}

pub(crate) use define_ack_packet;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use bytes::BytesMut;

    #[test]
    fn test_minimal_form_for_success() {
        let mut buf = BytesMut::new();
        encode_ack_body(&mut buf, 10, ReasonCode::Success, &Properties::default()).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x0A]);
    }

    #[test]
    fn test_reason_without_properties() {
        let mut buf = BytesMut::new();
        encode_ack_body(
            &mut buf,
            10,
            ReasonCode::QuotaExceeded,
            &Properties::default(),
        )
        .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x0A, 0x97]);

        let header = FixedHeader::new(PacketType::PubAck, 0, 3);
        let (id, reason, props) =
            decode_ack_body(&mut buf, &header, "PUBACK", is_valid_publish_ack_reason_code)
                .unwrap();
        assert_eq!(id, 10);
        assert_eq!(reason, ReasonCode::QuotaExceeded);
        assert!(props.is_empty());
    }

    #[test]
    fn test_zero_packet_id_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        let header = FixedHeader::new(PacketType::PubAck, 0, 2);
        assert!(matches!(
            decode_ack_body(&mut buf, &header, "PUBACK", is_valid_publish_ack_reason_code),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_reason_code_tables() {
        assert!(is_valid_publish_ack_reason_code(
            ReasonCode::NoMatchingSubscribers
        ));
        assert!(!is_valid_publish_ack_reason_code(
            ReasonCode::PacketIdentifierNotFound
        ));
        assert!(is_valid_pubrel_reason_code(
            ReasonCode::PacketIdentifierNotFound
        ));
        assert!(!is_valid_pubrel_reason_code(ReasonCode::QuotaExceeded));
    }
}
