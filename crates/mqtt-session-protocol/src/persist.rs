//! Serialization of store entries for persistence outside the process.
//!
//! Layout of a serialized entry:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 1    | format version (1)             |
//! | 1      | 1    | direction                      |
//! | 2      | 1    | awaited packet type            |
//! | 3      | 1    | QoS                            |
//! | 4      | 1    | protocol version (4 or 5)      |
//! | 5      | 2    | packet identifier, big endian  |
//! | 7      | ..   | retained wire frame            |

use crate::error::{MqttError, Result};
use crate::packet::PacketType;
use crate::store::{Direction, StoreEntry, StoreKey};
use crate::types::{ProtocolVersion, QoS};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistAction {
    Store { key: StoreKey, data: Bytes },
    Update { key: StoreKey, data: Bytes },
    Erase { key: StoreKey },
}

impl PersistAction {
    #[must_use]
    pub fn key(&self) -> StoreKey {
        match self {
            Self::Store { key, .. } | Self::Update { key, .. } | Self::Erase { key } => *key,
        }
    }

    pub(crate) fn store(entry: &StoreEntry) -> Self {
        Self::Store {
            key: entry.key(),
            data: serialize(entry).1,
        }
    }

    pub(crate) fn update(entry: &StoreEntry) -> Self {
        Self::Update {
            key: entry.key(),
            data: serialize(entry).1,
        }
    }
}

#[must_use]
pub fn serialize(entry: &StoreEntry) -> (u16, Bytes) {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + entry.packet.len());
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(entry.direction.as_u8());
    buf.put_u8(entry.expected.into());
    buf.put_u8(entry.qos.into());
    buf.put_u8(entry.protocol_version.as_u8());
    buf.put_u16(entry.packet_id);
    buf.put_slice(&entry.packet);
    (entry.packet_id, buf.freeze())
}

/// Rebuilds an entry from [`serialize`] output.
///
/// # Errors
/// Returns `CorruptSessionState` if the data is truncated, carries unknown
/// field values, names a different identifier than `packet_id`, or breaks
/// an entry invariant.
pub fn restore(packet_id: u16, data: &[u8]) -> Result<StoreEntry> {
    if data.len() <= HEADER_LEN {
        return Err(corrupt(format!(
            "Serialized entry of {} bytes is truncated",
            data.len()
        )));
    }

    let mut buf = data;
    let format = buf.get_u8();
    if format != FORMAT_VERSION {
        return Err(corrupt(format!("Unknown entry format version {format}")));
    }
    let direction_raw = buf.get_u8();
    let direction = Direction::from_u8(direction_raw)
        .ok_or_else(|| corrupt(format!("Unknown direction {direction_raw}")))?;
    let expected_raw = buf.get_u8();
    let expected = PacketType::from_u8(expected_raw)
        .ok_or_else(|| corrupt(format!("Unknown packet type {expected_raw}")))?;
    let qos_raw = buf.get_u8();
    let qos = QoS::try_from(qos_raw).map_err(|_| corrupt(format!("Unknown QoS {qos_raw}")))?;
    let version_raw = buf.get_u8();
    let protocol_version = ProtocolVersion::try_from(version_raw)
        .map_err(|_| corrupt(format!("Unknown protocol version {version_raw}")))?;
    let stored_id = buf.get_u16();
    if stored_id != packet_id {
        return Err(corrupt(format!(
            "Serialized entry is for packet {stored_id}, not {packet_id}"
        )));
    }

    let entry = StoreEntry::new(
        packet_id,
        direction,
        expected,
        qos,
        Bytes::copy_from_slice(buf),
        protocol_version,
    )
    .map_err(|e| match e {
        MqttError::CorruptSessionState(_) => e,
        other => corrupt(other.to_string()),
    })?;
    trace!(packet_id, ?direction, ?expected, "Restored store entry");
    Ok(entry)
}

fn corrupt(msg: String) -> MqttError {
    MqttError::CorruptSessionState(msg)
}

/// Receives the serialized form of every store change.
pub trait SessionPersistence: Send {
    fn store(&mut self, key: StoreKey, data: Bytes);

    fn update(&mut self, key: StoreKey, data: Bytes);

    /// Must be a no-op for keys that are not present.
    fn erase(&mut self, key: StoreKey);

    fn apply(&mut self, action: &PersistAction) {
        match action {
            PersistAction::Store { key, data } => self.store(*key, data.clone()),
            PersistAction::Update { key, data } => self.update(*key, data.clone()),
            PersistAction::Erase { key } => self.erase(*key),
        }
    }
}

/// Keeps serialized entries in memory, in the order they were stored.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    entries: Vec<(StoreKey, Bytes)>,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StoreKey, &Bytes)> {
        self.entries.iter().map(|(key, data)| (*key, data))
    }

    #[must_use]
    pub fn get(&self, key: StoreKey) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, data)| data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionPersistence for MemoryPersistence {
    fn store(&mut self, key: StoreKey, data: Bytes) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = data;
        } else {
            self.entries.push((key, data));
        }
    }

    fn update(&mut self, key: StoreKey, data: Bytes) {
        self.store(key, data);
    }

    fn erase(&mut self, key: StoreKey) {
        self.entries.retain(|(k, _)| *k != key);
    }
}
