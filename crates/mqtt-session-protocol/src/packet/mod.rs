pub mod ack_common;
pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

pub use connack::ConnAckPacket;
pub use connect::ConnectPacket;
pub use disconnect::DisconnectPacket;
pub use puback::PubAckPacket;
pub use pubcomp::PubCompPacket;
pub use publish::{set_dup_flag, PublishPacket};
pub use pubrec::PubRecPacket;
pub use pubrel::PubRelPacket;
pub use suback::SubAckPacket;
pub use subscribe::{SubscribePacket, SubscriptionOptions, TopicFilter};
pub use unsuback::UnsubAckPacket;
pub use unsubscribe::UnsubscribePacket;

use crate::encoding::{encode_variable_int, try_decode_variable_int, variable_int_len};
use crate::error::{MqttError, Result};
use crate::types::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            5 => Some(Self::PubRec),
            6 => Some(Self::PubRel),
            7 => Some(Self::PubComp),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            15 => Some(Self::Auth),
            _ => None,
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// # Errors
    /// Returns an error if the remaining length cannot be represented.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8((u8::from(self.packet_type) << 4) | (self.flags & 0x0F));
        encode_variable_int(buf, self.remaining_length)
    }

    /// # Errors
    /// Returns an error if the header is truncated or names an unknown type.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing fixed header".to_string(),
            ));
        }
        let first = buf.get_u8();
        let packet_type =
            PacketType::from_u8(first >> 4).ok_or(MqttError::InvalidPacketType(first >> 4))?;
        let remaining_length = crate::encoding::decode_variable_int(buf)?;
        Ok(Self::new(packet_type, first & 0x0F, remaining_length))
    }

    /// Peeks a fixed header at the start of `bytes`.
    ///
    /// Returns the header and its encoded length, or `None` while the
    /// remaining length field is still incomplete.
    ///
    /// # Errors
    /// Returns an error for an unknown packet type or an overlong length.
    pub fn try_decode(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&first) = bytes.first() else {
            return Ok(None);
        };
        let packet_type =
            PacketType::from_u8(first >> 4).ok_or(MqttError::InvalidPacketType(first >> 4))?;
        Ok(try_decode_variable_int(&bytes[1..])?.map(|(remaining_length, consumed)| {
            (
                Self::new(packet_type, first & 0x0F, remaining_length),
                1 + consumed,
            )
        }))
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + variable_int_len(self.remaining_length)
    }
}

pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    fn flags(&self) -> u8 {
        0
    }

    /// # Errors
    /// Returns an error if a field cannot be represented on the wire.
    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// # Errors
    /// Returns an error if the body is malformed.
    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self>;

    /// # Errors
    /// Returns an error if the packet cannot be encoded.
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;

        let remaining_length =
            u32::try_from(body.len()).map_err(|_| MqttError::PacketTooLarge {
                size: body.len(),
                max: crate::encoding::VARIABLE_INT_MAX as usize,
            })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the packet cannot be encoded.
    fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Packet identifier carried by the packet, if any.
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.packet_id,
            Self::PubAck(p) => Some(p.packet_id),
            Self::PubRec(p) => Some(p.packet_id),
            Self::PubRel(p) => Some(p.packet_id),
            Self::PubComp(p) => Some(p.packet_id),
            Self::Subscribe(p) => Some(p.packet_id),
            Self::SubAck(p) => Some(p.packet_id),
            Self::Unsubscribe(p) => Some(p.packet_id),
            Self::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// # Errors
    /// Returns an error if the packet cannot be encoded.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PubAck(p) => p.encode(buf),
            Self::PubRec(p) => p.encode(buf),
            Self::PubRel(p) => p.encode(buf),
            Self::PubComp(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubAck(p) => p.encode(buf),
            Self::PingReq => FixedHeader::new(PacketType::PingReq, 0, 0).encode(buf),
            Self::PingResp => FixedHeader::new(PacketType::PingResp, 0, 0).encode(buf),
            Self::Disconnect(p) => p.encode(buf),
        }
    }

    /// # Errors
    /// Returns an error if the packet cannot be encoded.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes a packet body whose fixed header has already been consumed.
    ///
    /// # Errors
    /// Returns an error if the body is malformed for `protocol_version`.
    pub fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        match fixed_header.packet_type {
            PacketType::Connect => Ok(Self::Connect(Box::new(ConnectPacket::decode_body(
                buf,
                fixed_header,
            )?))),
            PacketType::ConnAck => Ok(Self::ConnAck(ConnAckPacket::decode_body_with_version(
                buf,
                fixed_header,
                protocol_version,
            )?)),
            PacketType::Publish => Ok(Self::Publish(PublishPacket::decode_body_with_version(
                buf,
                fixed_header,
                protocol_version,
            )?)),
            PacketType::PubAck => Ok(Self::PubAck(PubAckPacket::decode_body(buf, fixed_header)?)),
            PacketType::PubRec => Ok(Self::PubRec(PubRecPacket::decode_body(buf, fixed_header)?)),
            PacketType::PubRel => Ok(Self::PubRel(PubRelPacket::decode_body(buf, fixed_header)?)),
            PacketType::PubComp => Ok(Self::PubComp(PubCompPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::Subscribe => Ok(Self::Subscribe(
                SubscribePacket::decode_body_with_version(buf, fixed_header, protocol_version)?,
            )),
            PacketType::SubAck => Ok(Self::SubAck(SubAckPacket::decode_body_with_version(
                buf,
                fixed_header,
                protocol_version,
            )?)),
            PacketType::Unsubscribe => Ok(Self::Unsubscribe(
                UnsubscribePacket::decode_body_with_version(buf, fixed_header, protocol_version)?,
            )),
            PacketType::UnsubAck => Ok(Self::UnsubAck(UnsubAckPacket::decode_body_with_version(
                buf,
                fixed_header,
                protocol_version,
            )?)),
            PacketType::PingReq => Ok(Self::PingReq),
            PacketType::PingResp => Ok(Self::PingResp),
            PacketType::Disconnect => Ok(Self::Disconnect(
                DisconnectPacket::decode_body_with_version(buf, fixed_header, protocol_version)?,
            )),
            PacketType::Auth => Err(MqttError::ProtocolError(
                "AUTH packets are not supported".to_string(),
            )),
        }
    }

    /// Decodes one complete frame.
    ///
    /// # Errors
    /// Returns `MalformedPacket` if the frame is truncated, has trailing
    /// bytes, or its body is malformed.
    pub fn decode_frame(frame: &[u8], protocol_version: ProtocolVersion) -> Result<Self> {
        let Some((fixed_header, header_len)) = FixedHeader::try_decode(frame)? else {
            return Err(MqttError::MalformedPacket(
                "Truncated fixed header".to_string(),
            ));
        };
        let body = &frame[header_len..];
        if body.len() != fixed_header.remaining_length as usize {
            return Err(MqttError::MalformedPacket(format!(
                "Remaining length {} does not match frame body of {} bytes",
                fixed_header.remaining_length,
                body.len()
            )));
        }
        let mut body = body;
        Self::decode_body(&mut body, &fixed_header, protocol_version)
    }

    /// Decodes the next packet from a streaming receive buffer.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. A frame larger
    /// than `max_packet_size` is rejected as soon as its header is read.
    ///
    /// # Errors
    /// Returns `PacketTooLarge` or a decode error.
    pub fn decode_from(
        buf: &mut BytesMut,
        protocol_version: ProtocolVersion,
        max_packet_size: Option<usize>,
    ) -> Result<Option<Self>> {
        let Some((fixed_header, header_len)) = FixedHeader::try_decode(&buf[..])? else {
            return Ok(None);
        };

        let total = header_len + fixed_header.remaining_length as usize;
        if let Some(max) = max_packet_size {
            if total > max {
                return Err(MqttError::PacketTooLarge { size: total, max });
            }
        }

        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        frame.advance(header_len);
        Self::decode_body(&mut frame, &fixed_header, protocol_version).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    #[test]
    fn test_packet_type_round_trip() {
        for value in 1u8..=15 {
            let packet_type = PacketType::from_u8(value).unwrap();
            assert_eq!(u8::from(packet_type), value);
        }
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(16), None);
    }

    #[test]
    fn test_fixed_header_try_decode_incomplete() {
        assert_eq!(FixedHeader::try_decode(&[]).unwrap(), None);
        assert_eq!(FixedHeader::try_decode(&[0x30]).unwrap(), None);
        assert_eq!(FixedHeader::try_decode(&[0x30, 0x80]).unwrap(), None);

        let (header, len) = FixedHeader::try_decode(&[0x32, 0x80, 0x01]).unwrap().unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.flags, 0x02);
        assert_eq!(header.remaining_length, 128);
        assert_eq!(len, 3);
    }

    #[test]
    fn test_fixed_header_invalid_type() {
        assert_eq!(
            FixedHeader::try_decode(&[0x00, 0x00]),
            Err(MqttError::InvalidPacketType(0))
        );
    }

    #[test]
    fn test_streaming_decode_waits_for_full_frame() {
        let publish = PublishPacket::new("t", &b"hello"[..], QoS::AtLeastOnce).with_packet_id(7);
        let bytes = publish.to_bytes().unwrap();

        let mut buf = BytesMut::new();
        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = Packet::decode_from(&mut buf, ProtocolVersion::V5, None).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(Packet::Publish(publish.clone())));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decode_two_frames() {
        let mut buf = BytesMut::new();
        Packet::PingResp.encode(&mut buf).unwrap();
        PubAckPacket::new(3).encode(&mut buf).unwrap();

        assert_eq!(
            Packet::decode_from(&mut buf, ProtocolVersion::V311, None).unwrap(),
            Some(Packet::PingResp)
        );
        assert_eq!(
            Packet::decode_from(&mut buf, ProtocolVersion::V311, None).unwrap(),
            Some(Packet::PubAck(PubAckPacket::new(3)))
        );
        assert_eq!(
            Packet::decode_from(&mut buf, ProtocolVersion::V311, None).unwrap(),
            None
        );
    }

    #[test]
    fn test_streaming_decode_rejects_oversized_frame() {
        let publish = PublishPacket::new("topic", vec![0u8; 64], QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        publish.encode(&mut buf).unwrap();
        let total = buf.len();

        // Only the header is needed to reject.
        buf.truncate(2);
        assert_eq!(
            Packet::decode_from(&mut buf, ProtocolVersion::V5, Some(32)),
            Err(MqttError::PacketTooLarge {
                size: total,
                max: 32
            })
        );
    }

    #[test]
    fn test_decode_frame_rejects_length_mismatch() {
        let mut bytes = PubAckPacket::new(1).to_bytes().unwrap().to_vec();
        bytes.push(0);
        assert!(Packet::decode_frame(&bytes, ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_packet_id_accessor() {
        assert_eq!(Packet::PubRel(PubRelPacket::new(9)).packet_id(), Some(9));
        assert_eq!(Packet::PingReq.packet_id(), None);
    }
}
