//! Client session state that outlives a single network connection.

pub mod expiry;

pub use expiry::SessionExpiry;

use crate::error::{MqttError, Result};
use crate::packet::PacketType;
use crate::packet_id::PacketIdAllocator;
use crate::persist::PersistAction;
use crate::store::{Direction, Store, StoreEntry, StoreKey};
use crate::types::{ProtocolVersion, QoS};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscribe {
    pub topic_filters: Vec<String>,
    pub qos_levels: Vec<QoS>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUnsubscribe {
    pub topic_filters: Vec<String>,
}

/// In-flight exchanges, identifier bookkeeping and the retention policy of
/// one client session.
#[derive(Debug, Default)]
pub struct Session {
    store: Store,
    packet_ids: PacketIdAllocator,
    pending_subacks: HashMap<u16, PendingSubscribe>,
    pending_unsubacks: HashMap<u16, PendingUnsubscribe>,
    expiry: SessionExpiry,
    disconnected_at: Option<Instant>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn packet_ids(&self) -> &PacketIdAllocator {
        &self.packet_ids
    }

    pub fn packet_ids_mut(&mut self) -> &mut PacketIdAllocator {
        &mut self.packet_ids
    }

    #[must_use]
    pub fn expiry(&self) -> SessionExpiry {
        self.expiry
    }

    pub fn set_expiry(&mut self, expiry: SessionExpiry) {
        self.expiry = expiry;
    }

    #[must_use]
    pub fn disconnected_at(&self) -> Option<Instant> {
        self.disconnected_at
    }

    pub fn mark_disconnected(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
    }

    pub fn mark_connected(&mut self) {
        self.disconnected_at = None;
    }

    /// Whether the retained session ran out while no connection was up.
    #[must_use]
    pub fn has_expired(&self, now: Instant) -> bool {
        self.disconnected_at
            .is_some_and(|at| self.expiry.is_expired(at, now))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty() && self.packet_ids.in_use_count() == 0
    }

    /// Records a new exchange. The identifier of an outbound entry must
    /// already be held.
    ///
    /// # Errors
    /// Returns `PacketIdInUse` if the key is already tracked.
    pub fn track(&mut self, entry: StoreEntry) -> Result<PersistAction> {
        let action = PersistAction::store(&entry);
        self.store.insert(entry)?;
        Ok(action)
    }

    /// Moves an exchange to its next awaited packet in place.
    ///
    /// # Errors
    /// Returns `PacketIdNotFound` if the key is not tracked.
    pub fn advance(
        &mut self,
        key: StoreKey,
        expected: PacketType,
        packet: Bytes,
    ) -> Result<PersistAction> {
        self.store.update(key, expected, packet)?;
        let entry = self
            .store
            .get(key)
            .ok_or(MqttError::PacketIdNotFound(key.packet_id))?;
        Ok(PersistAction::update(entry))
    }

    /// Swaps the retained frame for one encoded for another protocol
    /// version.
    ///
    /// # Errors
    /// Returns `PacketIdNotFound` if the key is not tracked.
    pub fn reencode(
        &mut self,
        key: StoreKey,
        packet: Bytes,
        protocol_version: ProtocolVersion,
    ) -> Result<PersistAction> {
        self.store.replace_packet(key, packet, protocol_version)?;
        let entry = self
            .store
            .get(key)
            .ok_or(MqttError::PacketIdNotFound(key.packet_id))?;
        Ok(PersistAction::update(entry))
    }

    /// Ends an exchange. Returns the erase notification only when an entry
    /// was actually removed, so completing twice never frees an identifier
    /// twice.
    pub fn complete(&mut self, key: StoreKey) -> Option<PersistAction> {
        self.store.remove(key)?;
        if key.direction == Direction::Outbound {
            // logged by the allocator when not held
            let _ = self.packet_ids.release(key.packet_id);
        }
        Some(PersistAction::Erase { key })
    }

    /// Drops every exchange and identifier, returning one erase per entry.
    pub fn purge(&mut self) -> Vec<PersistAction> {
        let erased: Vec<PersistAction> = self
            .store
            .drain()
            .into_iter()
            .map(|entry| PersistAction::Erase { key: entry.key() })
            .collect();
        if !erased.is_empty() {
            debug!(entries = erased.len(), "Purged session");
        }
        self.packet_ids.clear();
        self.pending_subacks.clear();
        self.pending_unsubacks.clear();
        self.disconnected_at = None;
        erased
    }

    /// Inserts an entry rebuilt from persistent storage.
    ///
    /// # Errors
    /// Returns `PacketIdInUse` if the key or outbound identifier is taken.
    pub fn restore(&mut self, entry: StoreEntry) -> Result<()> {
        let key = entry.key();
        if self.store.contains(key) {
            return Err(MqttError::PacketIdInUse(key.packet_id));
        }
        if key.direction == Direction::Outbound {
            self.packet_ids.acquire_specific(key.packet_id)?;
        }
        self.store.insert(entry)
    }

    pub fn track_pending_suback(&mut self, packet_id: u16, pending: PendingSubscribe) {
        self.pending_subacks.insert(packet_id, pending);
    }

    /// Removes a pending SUBSCRIBE and releases its identifier.
    pub fn complete_pending_suback(&mut self, packet_id: u16) -> Option<PendingSubscribe> {
        let pending = self.pending_subacks.remove(&packet_id)?;
        let _ = self.packet_ids.release(packet_id);
        Some(pending)
    }

    pub fn track_pending_unsuback(&mut self, packet_id: u16, pending: PendingUnsubscribe) {
        self.pending_unsubacks.insert(packet_id, pending);
    }

    /// Removes a pending UNSUBSCRIBE and releases its identifier.
    pub fn complete_pending_unsuback(&mut self, packet_id: u16) -> Option<PendingUnsubscribe> {
        let pending = self.pending_unsubacks.remove(&packet_id)?;
        let _ = self.packet_ids.release(packet_id);
        Some(pending)
    }

    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.pending_subacks.len() + self.pending_unsubacks.len()
    }

    /// SUBSCRIBE and UNSUBSCRIBE are never retransmitted, so their
    /// identifiers are returned once the connection is gone.
    pub fn release_pending_requests(&mut self) {
        let ids: Vec<u16> = self
            .pending_subacks
            .drain()
            .map(|(id, _)| id)
            .chain(self.pending_unsubacks.drain().map(|(id, _)| id))
            .collect();
        for id in ids {
            if self.packet_ids.release(id).is_err() {
                warn!(packet_id = id, "Pending request held no identifier");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MqttPacket, PubRelPacket, PublishPacket};
    use std::time::Duration;

    fn tracked_publish(session: &mut Session, qos: QoS) -> u16 {
        let id = session.packet_ids_mut().acquire().unwrap();
        let frame = PublishPacket::new("t", &b"x"[..], qos)
            .with_packet_id(id)
            .to_bytes()
            .unwrap();
        let expected = if qos == QoS::ExactlyOnce {
            PacketType::PubRec
        } else {
            PacketType::PubAck
        };
        let entry = StoreEntry::new(
            id,
            Direction::Outbound,
            expected,
            qos,
            frame,
            ProtocolVersion::V5,
        )
        .unwrap();
        session.track(entry).unwrap();
        id
    }

    #[test]
    fn test_complete_releases_once() {
        let mut session = Session::new();
        let id = tracked_publish(&mut session, QoS::AtLeastOnce);

        let erase = session.complete(StoreKey::outbound(id));
        assert_eq!(
            erase,
            Some(PersistAction::Erase {
                key: StoreKey::outbound(id)
            })
        );
        assert!(session.complete(StoreKey::outbound(id)).is_none());
        assert!(!session.packet_ids().is_allocated(id));
        assert_eq!(session.packet_ids_mut().acquire().unwrap(), id);
    }

    #[test]
    fn test_advance_emits_update() {
        let mut session = Session::new();
        let id = tracked_publish(&mut session, QoS::ExactlyOnce);
        let pubrel = PubRelPacket::new(id).to_bytes().unwrap();

        let action = session
            .advance(StoreKey::outbound(id), PacketType::PubComp, pubrel)
            .unwrap();
        assert!(matches!(action, PersistAction::Update { .. }));
        assert_eq!(
            session.store().expected(StoreKey::outbound(id)),
            Some(PacketType::PubComp)
        );
    }

    #[test]
    fn test_purge_erases_in_order() {
        let mut session = Session::new();
        tracked_publish(&mut session, QoS::AtLeastOnce);
        tracked_publish(&mut session, QoS::ExactlyOnce);

        let erased = session.purge();
        assert_eq!(
            erased,
            vec![
                PersistAction::Erase {
                    key: StoreKey::outbound(1)
                },
                PersistAction::Erase {
                    key: StoreKey::outbound(2)
                },
            ]
        );
        assert!(session.is_empty());
    }

    #[test]
    fn test_pending_requests_released() {
        let mut session = Session::new();
        let sub = session.packet_ids_mut().acquire().unwrap();
        session.track_pending_suback(
            sub,
            PendingSubscribe {
                topic_filters: vec!["a/#".to_string()],
                qos_levels: vec![QoS::AtLeastOnce],
            },
        );
        let unsub = session.packet_ids_mut().acquire().unwrap();
        session.track_pending_unsuback(
            unsub,
            PendingUnsubscribe {
                topic_filters: vec!["b".to_string()],
            },
        );
        assert_eq!(session.pending_request_count(), 2);

        session.release_pending_requests();
        assert_eq!(session.pending_request_count(), 0);
        assert_eq!(session.packet_ids().in_use_count(), 0);
        assert!(session.complete_pending_suback(sub).is_none());
    }

    #[test]
    fn test_restore_marks_outbound_ids() {
        let mut source = Session::new();
        let id = tracked_publish(&mut source, QoS::AtLeastOnce);
        let entry = source.store().get(StoreKey::outbound(id)).unwrap().clone();

        let mut session = Session::new();
        session.restore(entry.clone()).unwrap();
        assert!(session.packet_ids().is_allocated(id));
        assert!(session.restore(entry).is_err());
        assert_eq!(session.packet_ids_mut().acquire().unwrap(), id + 1);
    }

    #[test]
    fn test_expiry_tracking() {
        let mut session = Session::new();
        let now = Instant::now();
        assert!(!session.has_expired(now));

        session.set_expiry(SessionExpiry::After(Duration::from_secs(5)));
        session.mark_disconnected(now);
        assert!(!session.has_expired(now + Duration::from_secs(4)));
        assert!(session.has_expired(now + Duration::from_secs(5)));

        session.mark_connected();
        assert!(!session.has_expired(now + Duration::from_secs(60)));
    }
}
