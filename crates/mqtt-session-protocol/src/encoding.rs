//! Primitive MQTT data representations: variable byte integers, length
//! prefixed UTF-8 strings and binary data.

use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Largest value a four byte variable integer can carry.
pub const VARIABLE_INT_MAX: u32 = 268_435_455;

/// # Errors
/// Returns `MalformedPacket` if `value` exceeds [`VARIABLE_INT_MAX`].
pub fn encode_variable_int<B: BufMut>(buf: &mut B, mut value: u32) -> Result<()> {
    if value > VARIABLE_INT_MAX {
        return Err(MqttError::MalformedPacket(format!(
            "Variable byte integer {value} exceeds maximum {VARIABLE_INT_MAX}"
        )));
    }

    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// # Errors
/// Returns `MalformedPacket` on truncated input or more than four bytes.
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    match try_decode_variable_int(buf.chunk())? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(value)
        }
        None if buf.chunk().len() < buf.remaining() => {
            // Non-contiguous buffer: fall back to byte at a time.
            let mut value = 0u32;
            for shift in [0, 7, 14, 21] {
                if !buf.has_remaining() {
                    break;
                }
                let byte = buf.get_u8();
                value |= u32::from(byte & 0x7F) << shift;
                if byte & 0x80 == 0 {
                    return Ok(value);
                }
            }
            Err(MqttError::MalformedPacket(
                "Invalid variable byte integer".to_string(),
            ))
        }
        None => Err(MqttError::MalformedPacket(
            "Truncated variable byte integer".to_string(),
        )),
    }
}

/// Peeks a variable byte integer without consuming input.
///
/// Returns `Ok(None)` when more bytes are needed and `(value, consumed)`
/// otherwise.
///
/// # Errors
/// Returns `MalformedPacket` when a fifth continuation byte is present.
pub fn try_decode_variable_int(bytes: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    for (index, byte) in bytes.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if bytes.len() >= 4 {
        return Err(MqttError::MalformedPacket(
            "Variable byte integer longer than 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// # Errors
/// Returns `StringTooLong` if the string exceeds 65535 bytes.
pub fn encode_string<B: BufMut>(buf: &mut B, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| MqttError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// # Errors
/// Returns `MalformedPacket` on truncated input or invalid UTF-8.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let raw = decode_binary(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid UTF-8 string: {e}")))
}

#[must_use]
pub fn string_len(value: &str) -> usize {
    2 + value.len()
}

/// # Errors
/// Returns `MalformedPacket` if the data exceeds 65535 bytes.
pub fn encode_binary<B: BufMut>(buf: &mut B, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        MqttError::MalformedPacket(format!("Binary data too long: {} bytes", value.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

/// # Errors
/// Returns `MalformedPacket` on truncated input.
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Missing length prefix".to_string(),
        ));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Length prefix {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

#[must_use]
pub fn binary_len(value: &[u8]) -> usize {
    2 + value.len()
}
