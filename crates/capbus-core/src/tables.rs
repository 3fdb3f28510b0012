//! Receiver-side handle and descriptor tables.
//!
//! The handle table maps receiver-local handle ids to the capability values
//! a sender transferred; it is zeroed on peer reset. The descriptor table
//! plays the role of a process file table: recv reserves local numbers
//! before taking the peer lock (so a slow reservation never blocks the
//! queue) and installs values only after the message's tail write succeeded.

use std::collections::HashMap;

use capbus_error::{BusError, Result};
use capbus_types::{HandleId, PeerId};

/// One imported capability handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    /// Peer that transferred the handle.
    pub owner: PeerId,
    /// The transferred capability value.
    pub value: u64,
}

/// Receiver-local handle table.
#[derive(Debug, Default)]
pub struct HandleTable {
    map: HashMap<u64, HandleEntry>,
    next_id: u64,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Import a transferred capability, returning the receiver-local id.
    pub fn import(&mut self, owner: PeerId, value: u64) -> HandleId {
        self.next_id += 1;
        let id = HandleId::new(self.next_id);
        self.map.insert(id.get(), HandleEntry { owner, value });
        id
    }

    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<&HandleEntry> {
        self.map.get(&id.get())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop every entry and restart id allocation (peer reset).
    pub fn clear(&mut self) {
        self.map.clear();
        self.next_id = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorSlot {
    Reserved,
    Installed(u32),
}

/// Receiver-local descriptor table with reserve-then-install discipline.
#[derive(Debug)]
pub struct DescriptorTable {
    slots: HashMap<u32, DescriptorSlot>,
    next: u32,
    capacity: u32,
}

impl DescriptorTable {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: HashMap::new(),
            next: 0,
            capacity,
        }
    }

    /// Reserve `count` fresh local numbers.
    ///
    /// Fails with out-of-memory when the table is full; nothing is reserved
    /// in that case.
    pub fn reserve(&mut self, count: usize) -> Result<Vec<u32>> {
        let live = self.slots.len();
        if live + count > self.capacity as usize {
            tracing::debug!(live, count, capacity = self.capacity, "descriptor table full");
            return Err(BusError::OutOfMemory);
        }
        let mut numbers = Vec::with_capacity(count);
        for _ in 0..count {
            self.next += 1;
            self.slots.insert(self.next, DescriptorSlot::Reserved);
            numbers.push(self.next);
        }
        Ok(numbers)
    }

    /// Return reserved numbers that will not be installed.
    pub fn unreserve(&mut self, numbers: &[u32]) {
        for number in numbers {
            match self.slots.get(number) {
                Some(DescriptorSlot::Reserved) => {
                    self.slots.remove(number);
                }
                _ => tracing::warn!(number, "unreserve of non-reserved descriptor"),
            }
        }
    }

    /// Install a value into a previously reserved number.
    pub fn install(&mut self, number: u32, value: u32) -> Result<()> {
        match self.slots.get_mut(&number) {
            Some(slot @ DescriptorSlot::Reserved) => {
                *slot = DescriptorSlot::Installed(value);
                Ok(())
            }
            _ => Err(BusError::Internal("descriptor install without reservation")),
        }
    }

    /// Look up an installed descriptor value.
    #[must_use]
    pub fn get(&self, number: u32) -> Option<u32> {
        match self.slots.get(&number) {
            Some(DescriptorSlot::Installed(value)) => Some(*value),
            _ => None,
        }
    }

    /// Number of installed descriptors.
    #[must_use]
    pub fn n_installed(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, DescriptorSlot::Installed(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: u64) -> PeerId {
        PeerId::new(raw).unwrap()
    }

    #[test]
    fn handle_import_allocates_fresh_ids() {
        let mut table = HandleTable::new();
        let a = table.import(peer(1), 0xAA);
        let b = table.import(peer(2), 0xBB);
        assert_ne!(a, b);
        assert_eq!(table.get(a).unwrap().value, 0xAA);
        assert_eq!(table.get(b).unwrap().owner, peer(2));

        table.clear();
        assert!(table.is_empty());
        assert!(table.get(a).is_none());
    }

    #[test]
    fn reserve_install_lookup() {
        let mut table = DescriptorTable::new(8);
        let numbers = table.reserve(3).unwrap();
        assert_eq!(numbers.len(), 3);

        table.install(numbers[0], 100).unwrap();
        table.install(numbers[1], 200).unwrap();
        table.unreserve(&numbers[2..]);

        assert_eq!(table.get(numbers[0]), Some(100));
        assert_eq!(table.get(numbers[1]), Some(200));
        assert_eq!(table.get(numbers[2]), None);
        assert_eq!(table.n_installed(), 2);
    }

    #[test]
    fn reserve_beyond_capacity_is_out_of_memory() {
        let mut table = DescriptorTable::new(2);
        table.reserve(2).unwrap();
        assert_eq!(table.reserve(1), Err(BusError::OutOfMemory));
    }

    #[test]
    fn install_without_reservation_is_rejected() {
        let mut table = DescriptorTable::new(2);
        assert!(table.install(5, 1).is_err());
    }
}
