use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{Properties, PropertyId, PropertyValue};
use crate::types::{ConnectOptions, ProtocolVersion, QoS, WillMessage};
use bytes::{Buf, BufMut};

const PROTOCOL_NAME: &str = "MQTT";

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_START: u8 = 0x02;

/// MQTT CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    /// `Clean Session` in v3.1.1, `Clean Start` in v5.0
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillMessage>,
    pub properties: Properties,
}

impl ConnectPacket {
    #[must_use]
    pub fn from_options(options: &ConnectOptions) -> Self {
        let mut properties = Properties::default();
        if options.protocol_version == ProtocolVersion::V5 {
            let props = &options.properties;
            if let Some(interval) = props.session_expiry_interval {
                properties.set_session_expiry_interval(interval);
            }
            if let Some(receive_maximum) = props.receive_maximum {
                properties.set_receive_maximum(receive_maximum);
            }
            if let Some(size) = props.maximum_packet_size {
                properties.set_maximum_packet_size(size);
            }
            for (key, value) in &props.user_properties {
                properties.add_user_property(key.clone(), value.clone());
            }
        }

        Self {
            protocol_version: options.protocol_version,
            client_id: options.client_id.clone(),
            keep_alive: options.keep_alive_secs(),
            clean_start: options.clean_start,
            username: options.username.clone(),
            password: options.password.clone(),
            will: options.will.clone(),
            properties,
        }
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_start {
            flags |= FLAG_CLEAN_START;
        }
        if let Some(will) = &self.will {
            flags |= FLAG_WILL | (u8::from(will.qos) << 3);
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        flags
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(self.protocol_version.as_u8());
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);

        let v5 = self.protocol_version == ProtocolVersion::V5;
        if v5 {
            self.properties.encode(buf)?;
        }

        encode_string(buf, &self.client_id)?;

        if let Some(will) = &self.will {
            if v5 {
                let mut will_props = Properties::default();
                if let Some(delay) = will.delay_interval {
                    will_props.add(
                        PropertyId::WillDelayInterval,
                        PropertyValue::FourByteInteger(delay),
                    )?;
                }
                will_props.encode(buf)?;
            }
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }

        if let Some(username) = &self.username {
            encode_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let name = decode_string(buf)?;
        if name != PROTOCOL_NAME {
            return Err(MqttError::MalformedPacket(format!(
                "Unexpected protocol name: {name}"
            )));
        }
        if buf.remaining() < 4 {
            return Err(MqttError::MalformedPacket(
                "CONNECT variable header truncated".to_string(),
            ));
        }
        let protocol_version = ProtocolVersion::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        if flags & 0x01 != 0 {
            return Err(MqttError::MalformedPacket(
                "CONNECT reserved flag must be 0".to_string(),
            ));
        }
        let keep_alive = buf.get_u16();

        let v5 = protocol_version == ProtocolVersion::V5;
        let properties = if v5 {
            Properties::decode(buf)?
        } else {
            Properties::default()
        };

        let client_id = decode_string(buf)?;

        let will = if flags & FLAG_WILL != 0 {
            let will_props = if v5 {
                Properties::decode(buf)?
            } else {
                Properties::default()
            };
            let topic = decode_string(buf)?;
            let payload = decode_binary(buf)?.to_vec();
            let delay_interval = match will_props.get(PropertyId::WillDelayInterval) {
                Some(PropertyValue::FourByteInteger(v)) => Some(*v),
                _ => None,
            };
            Some(WillMessage {
                topic,
                payload,
                qos: QoS::try_from((flags >> 3) & 0x03)?,
                retain: flags & FLAG_WILL_RETAIN != 0,
                delay_interval,
            })
        } else {
            None
        };

        let username = if flags & FLAG_USERNAME != 0 {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if flags & FLAG_PASSWORD != 0 {
            Some(decode_binary(buf)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            client_id,
            keep_alive,
            clean_start: flags & FLAG_CLEAN_START != 0,
            username,
            password,
            will,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::time::Duration;

    #[test]
    fn test_connect_v311_minimal_bytes() {
        let options = ConnectOptions::new("c1")
            .with_protocol_version(ProtocolVersion::V311)
            .with_keep_alive(Duration::from_secs(10));
        let bytes = ConnectPacket::from_options(&options).to_bytes().unwrap();

        assert_eq!(
            &bytes[..],
            &[
                0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x0A, 0x00,
                0x02, b'c', b'1'
            ]
        );
    }

    #[test]
    fn test_connect_v5_round_trip_with_everything() {
        let options = ConnectOptions::new("client")
            .with_clean_start(false)
            .with_session_expiry_interval(300)
            .with_receive_maximum(20)
            .with_credentials("user", b"pw")
            .with_will(
                WillMessage::new("last/will", b"gone".to_vec())
                    .with_qos(QoS::AtLeastOnce)
                    .with_retain(true)
                    .with_delay_interval(5),
            );
        let packet = ConnectPacket::from_options(&options);
        assert_eq!(packet.properties.session_expiry_interval(), Some(300));

        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::decode_frame(&bytes, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, Packet::Connect(Box::new(packet)));
    }

    #[test]
    fn test_connect_v311_ignores_v5_properties() {
        let options = ConnectOptions::new("c")
            .with_protocol_version(ProtocolVersion::V311)
            .with_session_expiry_interval(300);
        let packet = ConnectPacket::from_options(&options);
        assert!(packet.properties.is_empty());
    }
}
