/// Hash-slot mapping and the slot table
///
/// The table is two dense arrays of length 16384: the writable primary per
/// slot and the list of read candidates per slot. It is read concurrently by
/// every session and written only by the dispatcher, behind an `RwLock`.
use fnv::FnvHashSet;
use rand::Rng;

use crate::cluster::Endpoint;
use crate::utils::{crc16, extract_hash_tag};

pub const SLOT_COUNT: usize = 16384;

/// Map a key to its hash slot, honoring `{tag}` extraction
///
/// Bit-identical to Redis Cluster's own algorithm; redirected traffic
/// depends on agreeing with the backends about slot numbers.
pub fn key_to_slot(key: &str) -> u16 {
    crc16(extract_hash_tag(key).as_bytes()) % SLOT_COUNT as u16
}

/// A contiguous slot range with one primary and zero or more replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub start: u16,
    pub end: u16,
    pub write: Endpoint,
    pub read: Vec<Endpoint>,
}

/// slot -> (write endpoint, read endpoints)
#[derive(Debug)]
pub struct SlotTable {
    writers: Vec<Endpoint>,
    readers: Vec<Vec<Endpoint>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            writers: vec![String::new(); SLOT_COUNT],
            readers: vec![Vec::new(); SLOT_COUNT],
        }
    }

    /// Fill `writers` and `readers` for every slot in the info's range
    pub fn set_slot_info(&mut self, info: &SlotInfo) {
        for slot in info.start..=info.end {
            let slot = slot as usize;
            if slot >= SLOT_COUNT {
                break;
            }
            self.writers[slot] = info.write.clone();
            if info.read.is_empty() {
                // no eligible replica: the primary serves reads too
                self.readers[slot] = vec![info.write.clone()];
            } else {
                self.readers[slot] = info.read.clone();
            }
        }
    }

    /// The primary serving this slot, or `None` before initialization
    pub fn write_server(&self, slot: u16) -> Option<Endpoint> {
        let endpoint = &self.writers[slot as usize];
        if endpoint.is_empty() {
            None
        } else {
            Some(endpoint.clone())
        }
    }

    /// One read candidate for this slot, chosen uniformly at random per call
    pub fn read_server(&self, slot: u16) -> Option<Endpoint> {
        let candidates = &self.readers[slot as usize];
        if candidates.is_empty() {
            return self.write_server(slot);
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[index].clone())
    }

    /// One representative slot per distinct primary, in ascending slot order
    ///
    /// Fan-out commands (`KEYS`, `SCAN`, ...) dispatch one sub-request per
    /// entry returned here.
    pub fn server_slots(&self) -> Vec<u16> {
        let mut seen: FnvHashSet<&str> = FnvHashSet::default();
        let mut slots = Vec::new();
        for (slot, writer) in self.writers.iter().enumerate() {
            if writer.is_empty() {
                continue;
            }
            if seen.insert(writer.as_str()) {
                slots.push(slot as u16);
            }
        }
        slots
    }

    /// The union of all write and read endpoints currently in the table
    pub fn live_endpoints(&self) -> FnvHashSet<Endpoint> {
        let mut endpoints = FnvHashSet::default();
        for writer in &self.writers {
            if !writer.is_empty() {
                endpoints.insert(writer.clone());
            }
        }
        for readers in &self.readers {
            for reader in readers {
                endpoints.insert(reader.clone());
            }
        }
        endpoints
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}
