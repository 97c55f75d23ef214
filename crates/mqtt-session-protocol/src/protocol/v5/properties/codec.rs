use super::{Properties, PropertyId, PropertyValue, PropertyValueType};
use crate::encoding::{
    binary_len, decode_binary, decode_string, decode_variable_int, encode_binary, encode_string,
    encode_variable_int, string_len, variable_int_len,
};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

impl Properties {
    /// Writes the property length followed by every property.
    ///
    /// # Errors
    /// Returns error if a string or the property block is too long.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let props_len = self.properties_encoded_len();
        let len = u32::try_from(props_len).map_err(|_| MqttError::PacketTooLarge {
            size: props_len,
            max: u32::MAX as usize,
        })?;
        encode_variable_int(buf, len)?;

        for (id, value) in &self.items {
            encode_variable_int(buf, u32::from(*id as u8))?;
            match value {
                PropertyValue::Byte(v) => buf.put_u8(*v),
                PropertyValue::TwoByteInteger(v) => buf.put_u16(*v),
                PropertyValue::FourByteInteger(v) => buf.put_u32(*v),
                PropertyValue::VariableByteInteger(v) => encode_variable_int(buf, *v)?,
                PropertyValue::BinaryData(v) => encode_binary(buf, v)?,
                PropertyValue::Utf8String(v) => encode_string(buf, v)?,
                PropertyValue::Utf8StringPair(k, v) => {
                    encode_string(buf, k)?;
                    encode_string(buf, v)?;
                }
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns error if decoding fails, invalid property ID, type mismatch,
    /// or duplicate property that doesn't allow multiples.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let props_len = decode_variable_int(buf)? as usize;

        if buf.remaining() < props_len {
            return Err(MqttError::MalformedPacket(format!(
                "Insufficient data for properties: expected {props_len}, got {}",
                buf.remaining()
            )));
        }

        let mut props_buf = buf.copy_to_bytes(props_len);
        let mut properties = Self::new();

        while props_buf.has_remaining() {
            let id_val = decode_variable_int(&mut props_buf)?;
            let id_byte = u8::try_from(id_val).map_err(|_| MqttError::InvalidPropertyId(255))?;
            let id = PropertyId::from_u8(id_byte).ok_or(MqttError::InvalidPropertyId(id_byte))?;

            let fixed_width = match id.value_type() {
                PropertyValueType::Byte => 1,
                PropertyValueType::TwoByteInteger => 2,
                PropertyValueType::FourByteInteger => 4,
                _ => 0,
            };
            if props_buf.remaining() < fixed_width {
                return Err(MqttError::MalformedPacket(format!(
                    "Insufficient data for property {id:?}"
                )));
            }

            let value = match id.value_type() {
                PropertyValueType::Byte => PropertyValue::Byte(props_buf.get_u8()),
                PropertyValueType::TwoByteInteger => {
                    PropertyValue::TwoByteInteger(props_buf.get_u16())
                }
                PropertyValueType::FourByteInteger => {
                    PropertyValue::FourByteInteger(props_buf.get_u32())
                }
                PropertyValueType::VariableByteInteger => {
                    PropertyValue::VariableByteInteger(decode_variable_int(&mut props_buf)?)
                }
                PropertyValueType::BinaryData => {
                    PropertyValue::BinaryData(decode_binary(&mut props_buf)?)
                }
                PropertyValueType::Utf8String => {
                    PropertyValue::Utf8String(decode_string(&mut props_buf)?)
                }
                PropertyValueType::Utf8StringPair => {
                    let key = decode_string(&mut props_buf)?;
                    let value = decode_string(&mut props_buf)?;
                    PropertyValue::Utf8StringPair(key, value)
                }
            };

            properties.add(id, value)?;
        }

        Ok(properties)
    }

    /// Size of the encoded block including its length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let props_len = self.properties_encoded_len();
        variable_int_len(u32::try_from(props_len).unwrap_or(u32::MAX)) + props_len
    }

    fn properties_encoded_len(&self) -> usize {
        self.items
            .iter()
            .map(|(id, value)| {
                variable_int_len(u32::from(*id as u8))
                    + match value {
                        PropertyValue::Byte(_) => 1,
                        PropertyValue::TwoByteInteger(_) => 2,
                        PropertyValue::FourByteInteger(_) => 4,
                        PropertyValue::VariableByteInteger(v) => variable_int_len(*v),
                        PropertyValue::BinaryData(v) => binary_len(v),
                        PropertyValue::Utf8String(v) => string_len(v),
                        PropertyValue::Utf8StringPair(k, v) => string_len(k) + string_len(v),
                    }
            })
            .sum()
    }
}
