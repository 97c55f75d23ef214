//! Packet identifier allocation.
//!
//! Identifiers are non-zero 16-bit values. [`PacketIdAllocator::acquire`]
//! always returns the lowest identifier not currently held, so a fresh
//! allocator yields 1, 2, 3, ... and a released identifier is the next one
//! handed out when it is the lowest free value.

use crate::error::{MqttError, Result};
use std::collections::BTreeSet;
use tracing::warn;

const MAX_PACKET_ID: u32 = u16::MAX as u32;

#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    /// Every id at or above this value is free
    next_fresh: u32,
    /// Released ids below `next_fresh`
    free: BTreeSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_fresh: 1,
            free: BTreeSet::new(),
        }
    }

    /// # Errors
    /// Returns `PacketIdExhausted` when all 65535 identifiers are held.
    pub fn acquire(&mut self) -> Result<u16> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        if self.next_fresh > MAX_PACKET_ID {
            return Err(MqttError::PacketIdExhausted);
        }
        #[allow(clippy::cast_possible_truncation)]
        let id = self.next_fresh as u16;
        self.next_fresh += 1;
        Ok(id)
    }

    /// Marks a caller-chosen identifier as held.
    ///
    /// # Errors
    /// Returns `InvalidPacketId` for 0 and `PacketIdInUse` if `id` is held.
    pub fn acquire_specific(&mut self, id: u16) -> Result<()> {
        if id == 0 {
            return Err(MqttError::InvalidPacketId);
        }
        let wide = u32::from(id);
        if wide >= self.next_fresh {
            self.free.extend(
                (self.next_fresh..wide).filter_map(|skipped| u16::try_from(skipped).ok()),
            );
            self.next_fresh = wide + 1;
            return Ok(());
        }
        if self.free.remove(&id) {
            Ok(())
        } else {
            Err(MqttError::PacketIdInUse(id))
        }
    }

    /// # Errors
    /// Returns `PacketIdNotFound` if `id` is not held. State is unchanged.
    pub fn release(&mut self, id: u16) -> Result<()> {
        if !self.is_allocated(id) {
            warn!(packet_id = id, "Release of packet identifier that is not held");
            return Err(MqttError::PacketIdNotFound(id));
        }

        self.free.insert(id);
        // Fold trailing free ids back into the fresh range.
        while self.next_fresh > 1 {
            #[allow(clippy::cast_possible_truncation)]
            let last = (self.next_fresh - 1) as u16;
            if !self.free.remove(&last) {
                break;
            }
            self.next_fresh -= 1;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, id: u16) -> bool {
        id != 0 && u32::from(id) < self.next_fresh && !self.free.contains(&id)
    }

    #[must_use]
    pub fn in_use_count(&self) -> usize {
        (self.next_fresh - 1) as usize - self.free.len()
    }

    pub fn clear(&mut self) {
        self.next_fresh = 1;
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_from_one() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.acquire().unwrap(), 1);
        assert_eq!(ids.acquire().unwrap(), 2);
        assert_eq!(ids.acquire().unwrap(), 3);
        assert_eq!(ids.in_use_count(), 3);
    }

    #[test]
    fn test_released_id_is_reused() {
        let mut ids = PacketIdAllocator::new();
        let first = ids.acquire().unwrap();
        let _second = ids.acquire().unwrap();
        ids.release(first).unwrap();
        assert_eq!(ids.acquire().unwrap(), first);
    }

    #[test]
    fn test_release_last_then_acquire() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.acquire().unwrap(), 1);
        ids.release(1).unwrap();
        assert_eq!(ids.acquire().unwrap(), 1);
    }

    #[test]
    fn test_release_unheld_is_error_without_side_effects() {
        let mut ids = PacketIdAllocator::new();
        ids.acquire().unwrap();
        assert_eq!(ids.release(5), Err(MqttError::PacketIdNotFound(5)));
        assert_eq!(ids.release(0), Err(MqttError::PacketIdNotFound(0)));
        ids.release(1).unwrap();
        assert_eq!(ids.release(1), Err(MqttError::PacketIdNotFound(1)));
        assert_eq!(ids.in_use_count(), 0);
    }

    #[test]
    fn test_acquire_specific() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.acquire_specific(0), Err(MqttError::InvalidPacketId));
        ids.acquire_specific(1).unwrap();
        assert_eq!(ids.acquire_specific(1), Err(MqttError::PacketIdInUse(1)));

        ids.acquire_specific(5).unwrap();
        assert!(ids.is_allocated(5));
        assert!(!ids.is_allocated(3));
        assert_eq!(ids.acquire().unwrap(), 2);
        assert_eq!(ids.acquire().unwrap(), 3);
        assert_eq!(ids.acquire().unwrap(), 4);
        assert_eq!(ids.acquire().unwrap(), 6);
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = PacketIdAllocator::new();
        for expected in 1..=u16::MAX {
            assert_eq!(ids.acquire().unwrap(), expected);
        }
        assert_eq!(ids.acquire(), Err(MqttError::PacketIdExhausted));
        assert_eq!(ids.in_use_count(), 65_535);

        ids.release(40_000).unwrap();
        assert_eq!(ids.acquire().unwrap(), 40_000);
        assert_eq!(ids.acquire(), Err(MqttError::PacketIdExhausted));
    }

    #[test]
    fn test_clear() {
        let mut ids = PacketIdAllocator::new();
        ids.acquire().unwrap();
        ids.acquire_specific(100).unwrap();
        ids.clear();
        assert_eq!(ids.in_use_count(), 0);
        assert_eq!(ids.acquire().unwrap(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        AcquireSpecific(u16),
        Release(u16),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Acquire),
            1 => (0u16..64).prop_map(Op::AcquireSpecific),
            2 => (0u16..64).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_lowest_free_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut ids = PacketIdAllocator::new();
            let mut held: HashSet<u16> = HashSet::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        let id = ids.acquire().unwrap();
                        let expected = (1..=u16::MAX).find(|c| !held.contains(c)).unwrap();
                        prop_assert_eq!(id, expected);
                        prop_assert!(held.insert(id));
                    }
                    Op::AcquireSpecific(id) => {
                        let result = ids.acquire_specific(id);
                        if id == 0 || held.contains(&id) {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            held.insert(id);
                        }
                    }
                    Op::Release(id) => {
                        let result = ids.release(id);
                        prop_assert_eq!(result.is_ok(), held.remove(&id));
                    }
                }
                prop_assert_eq!(ids.in_use_count(), held.len());
                for id in 1u16..70 {
                    prop_assert_eq!(ids.is_allocated(id), held.contains(&id));
                }
            }
        }
    }
}
