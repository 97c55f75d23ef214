//! In-flight acknowledgment store.
//!
//! Entries are kept in insertion order and addressed by
//! `(packet_id, direction)`. Updating an entry in place keeps its original
//! position, which is what makes retransmission after a reconnect replay
//! messages in the order they were first published.

use crate::error::{MqttError, Result};
use crate::packet::PacketType;
use crate::types::{ProtocolVersion, QoS};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Published by this client
    Outbound,
    /// Published by the peer at QoS 2, waiting for PUBREL
    Inbound,
}

impl Direction {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Outbound => 0,
            Self::Inbound => 1,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Outbound),
            1 => Some(Self::Inbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub packet_id: u16,
    pub direction: Direction,
}

impl StoreKey {
    #[must_use]
    pub fn outbound(packet_id: u16) -> Self {
        Self {
            packet_id,
            direction: Direction::Outbound,
        }
    }

    #[must_use]
    pub fn inbound(packet_id: u16) -> Self {
        Self {
            packet_id,
            direction: Direction::Inbound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub packet_id: u16,
    pub direction: Direction,
    /// The packet type that advances this exchange
    pub expected: PacketType,
    pub qos: QoS,
    /// Encoded frame retained for retransmission
    pub packet: Bytes,
    pub protocol_version: ProtocolVersion,
}

impl StoreEntry {
    /// # Errors
    /// Returns `InvalidPacketId` for id 0 and `CorruptSessionState` when
    /// `expected` cannot follow from `qos` and `direction`.
    pub fn new(
        packet_id: u16,
        direction: Direction,
        expected: PacketType,
        qos: QoS,
        packet: Bytes,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        let entry = Self {
            packet_id,
            direction,
            expected,
            qos,
            packet,
            protocol_version,
        };
        entry.validate()?;
        Ok(entry)
    }

    #[must_use]
    pub fn key(&self) -> StoreKey {
        StoreKey {
            packet_id: self.packet_id,
            direction: self.direction,
        }
    }

    /// The packet type of the retained frame.
    #[must_use]
    pub fn stored_packet_type(&self) -> PacketType {
        match (self.direction, self.expected) {
            (Direction::Outbound, PacketType::PubComp) => PacketType::PubRel,
            (Direction::Outbound, _) => PacketType::Publish,
            (Direction::Inbound, _) => PacketType::PubRec,
        }
    }

    /// # Errors
    /// Returns an error describing the first broken invariant.
    pub fn validate(&self) -> Result<()> {
        if self.packet_id == 0 {
            return Err(MqttError::InvalidPacketId);
        }

        let reachable = match (self.direction, self.qos) {
            (_, QoS::AtMostOnce) => false,
            (Direction::Outbound, QoS::AtLeastOnce) => self.expected == PacketType::PubAck,
            (Direction::Outbound, QoS::ExactlyOnce) => {
                matches!(self.expected, PacketType::PubRec | PacketType::PubComp)
            }
            (Direction::Inbound, QoS::ExactlyOnce) => self.expected == PacketType::PubRel,
            (Direction::Inbound, QoS::AtLeastOnce) => false,
        };
        if !reachable {
            return Err(MqttError::CorruptSessionState(format!(
                "{:?} {:?} entry cannot expect {:?}",
                self.direction, self.qos, self.expected
            )));
        }

        let first = self.packet.first().copied().unwrap_or_default();
        if first >> 4 != u8::from(self.stored_packet_type()) {
            return Err(MqttError::CorruptSessionState(format!(
                "Entry for packet {} retains a frame of type {}, expected {:?}",
                self.packet_id,
                first >> 4,
                self.stored_packet_type()
            )));
        }
        Ok(())
    }
}

/// Insertion-ordered collection of pending exchanges.
#[derive(Debug, Clone, Default)]
pub struct Store {
    entries: BTreeMap<u64, StoreEntry>,
    index: HashMap<StoreKey, u64>,
    next_seq: u64,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new entry at the end of the iteration order.
    ///
    /// # Errors
    /// Returns `PacketIdInUse` if an entry with the same key exists.
    pub fn insert(&mut self, entry: StoreEntry) -> Result<()> {
        let key = entry.key();
        if self.index.contains_key(&key) {
            return Err(MqttError::PacketIdInUse(key.packet_id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key, seq);
        self.entries.insert(seq, entry);
        Ok(())
    }

    /// Replaces the awaited type and retained frame of an existing entry.
    ///
    /// # Errors
    /// Returns `PacketIdNotFound` if no entry matches, or the validation
    /// error of the updated entry, in which case the old entry is kept.
    pub fn update(&mut self, key: StoreKey, expected: PacketType, packet: Bytes) -> Result<()> {
        let entry = self
            .index
            .get(&key)
            .and_then(|seq| self.entries.get_mut(seq))
            .ok_or(MqttError::PacketIdNotFound(key.packet_id))?;

        let mut updated = entry.clone();
        updated.expected = expected;
        updated.packet = packet;
        updated.validate()?;
        *entry = updated;
        Ok(())
    }

    /// Replaces an entry's frame and protocol version, keeping its state.
    ///
    /// # Errors
    /// Returns `PacketIdNotFound` if no entry matches.
    pub fn replace_packet(
        &mut self,
        key: StoreKey,
        packet: Bytes,
        protocol_version: ProtocolVersion,
    ) -> Result<()> {
        let entry = self
            .index
            .get(&key)
            .and_then(|seq| self.entries.get_mut(seq))
            .ok_or(MqttError::PacketIdNotFound(key.packet_id))?;
        entry.packet = packet;
        entry.protocol_version = protocol_version;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: StoreKey) -> Option<&StoreEntry> {
        self.index.get(&key).and_then(|seq| self.entries.get(seq))
    }

    /// The awaited packet type for `key`, if an entry exists.
    #[must_use]
    pub fn expected(&self, key: StoreKey) -> Option<PacketType> {
        self.get(key).map(|entry| entry.expected)
    }

    #[must_use]
    pub fn contains(&self, key: StoreKey) -> bool {
        self.index.contains_key(&key)
    }

    pub fn remove(&mut self, key: StoreKey) -> Option<StoreEntry> {
        let seq = self.index.remove(&key)?;
        self.entries.remove(&seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoreEntry> {
        self.entries.values()
    }

    /// Keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<StoreKey> {
        self.entries.values().map(StoreEntry::key).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry, returning them in insertion order.
    pub fn drain(&mut self) -> Vec<StoreEntry> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MqttPacket, PubRecPacket, PubRelPacket, PublishPacket};

    fn publish_frame(id: u16, qos: QoS) -> Bytes {
        PublishPacket::new("t", &b"payload"[..], qos)
            .with_packet_id(id)
            .to_bytes()
            .unwrap()
    }

    fn outbound(id: u16, qos: QoS) -> StoreEntry {
        let expected = if qos == QoS::ExactlyOnce {
            PacketType::PubRec
        } else {
            PacketType::PubAck
        };
        StoreEntry::new(
            id,
            Direction::Outbound,
            expected,
            qos,
            publish_frame(id, qos),
            ProtocolVersion::V5,
        )
        .unwrap()
    }

    #[test]
    fn test_entry_invariants() {
        let frame = publish_frame(1, QoS::AtLeastOnce);
        assert!(StoreEntry::new(
            1,
            Direction::Outbound,
            PacketType::PubRec,
            QoS::AtLeastOnce,
            frame.clone(),
            ProtocolVersion::V5
        )
        .is_err());
        assert!(StoreEntry::new(
            0,
            Direction::Outbound,
            PacketType::PubAck,
            QoS::AtLeastOnce,
            frame.clone(),
            ProtocolVersion::V5
        )
        .is_err());
        assert!(StoreEntry::new(
            1,
            Direction::Inbound,
            PacketType::PubRel,
            QoS::ExactlyOnce,
            frame,
            ProtocolVersion::V5
        )
        .is_err());

        let pubrec = PubRecPacket::new(1).to_bytes().unwrap();
        assert!(StoreEntry::new(
            1,
            Direction::Inbound,
            PacketType::PubRel,
            QoS::ExactlyOnce,
            pubrec,
            ProtocolVersion::V5
        )
        .is_ok());
    }

    #[test]
    fn test_insertion_order() {
        let mut store = Store::new();
        store.insert(outbound(5, QoS::AtLeastOnce)).unwrap();
        store.insert(outbound(2, QoS::ExactlyOnce)).unwrap();
        store.insert(outbound(9, QoS::AtLeastOnce)).unwrap();

        let ids: Vec<u16> = store.iter().map(|e| e.packet_id).collect();
        assert_eq!(ids, vec![5, 2, 9]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut store = Store::new();
        store.insert(outbound(1, QoS::AtLeastOnce)).unwrap();
        assert_eq!(
            store.insert(outbound(1, QoS::ExactlyOnce)),
            Err(MqttError::PacketIdInUse(1))
        );

        let pubrec = PubRecPacket::new(1).to_bytes().unwrap();
        let inbound = StoreEntry::new(
            1,
            Direction::Inbound,
            PacketType::PubRel,
            QoS::ExactlyOnce,
            pubrec,
            ProtocolVersion::V5,
        )
        .unwrap();
        store.insert(inbound).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_update_keeps_position() {
        let mut store = Store::new();
        store.insert(outbound(1, QoS::ExactlyOnce)).unwrap();
        store.insert(outbound(2, QoS::AtLeastOnce)).unwrap();

        let pubrel = PubRelPacket::new(1).to_bytes().unwrap();
        store
            .update(StoreKey::outbound(1), PacketType::PubComp, pubrel.clone())
            .unwrap();

        let first = store.iter().next().unwrap();
        assert_eq!(first.packet_id, 1);
        assert_eq!(first.expected, PacketType::PubComp);
        assert_eq!(first.packet, pubrel);
    }

    #[test]
    fn test_invalid_update_leaves_entry() {
        let mut store = Store::new();
        store.insert(outbound(1, QoS::AtLeastOnce)).unwrap();
        let pubrel = PubRelPacket::new(1).to_bytes().unwrap();

        assert!(store
            .update(StoreKey::outbound(1), PacketType::PubComp, pubrel)
            .is_err());
        assert_eq!(
            store.expected(StoreKey::outbound(1)),
            Some(PacketType::PubAck)
        );
        assert_eq!(
            store.update(StoreKey::outbound(7), PacketType::PubAck, Bytes::new()),
            Err(MqttError::PacketIdNotFound(7))
        );
    }

    #[test]
    fn test_remove_and_drain() {
        let mut store = Store::new();
        store.insert(outbound(1, QoS::AtLeastOnce)).unwrap();
        store.insert(outbound(2, QoS::AtLeastOnce)).unwrap();
        store.insert(outbound(3, QoS::AtLeastOnce)).unwrap();

        assert!(store.remove(StoreKey::outbound(2)).is_some());
        assert!(store.remove(StoreKey::outbound(2)).is_none());
        assert!(!store.contains(StoreKey::outbound(2)));

        let drained: Vec<u16> = store.drain().into_iter().map(|e| e.packet_id).collect();
        assert_eq!(drained, vec![1, 3]);
        assert!(store.is_empty());

        store.insert(outbound(2, QoS::AtLeastOnce)).unwrap();
        assert_eq!(store.keys(), vec![StoreKey::outbound(2)]);
    }
}
