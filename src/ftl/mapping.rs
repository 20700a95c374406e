//! FTL address-translation state: the two maps, zone states, and the
//! log-zone ring pointers.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::device::Geometry;
use crate::error::{Error, Result};

/// High-bit sentinel for an invalid log-mapping entry, kept for
/// FFI/debug formatting; this implementation represents "invalid" by
/// removing the `log_mapping` entry outright rather than tagging a
/// live `u64`.
pub const ENTRY_INVALID: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    Empty,
    Full,
}

pub(super) struct Maps {
    /// LBA -> physical LBA inside the log-zone region. Presence implies
    /// validity (most recent write wins by overwriting the entry).
    pub log_mapping: HashMap<u64, u64>,
    /// Virtual zone number -> physical start LBA of the data zone
    /// currently backing it.
    pub data_mapping: HashMap<u32, u64>,
    /// One entry per data-area zone, indexed by data-zone index
    /// (0-based, not counting log zones).
    pub zone_states: Vec<ZoneState>,
    /// Monotonically increasing head of the circular log-zone write
    /// pointer, in LBAs from the start of the log region.
    pub log_zone_start: u64,
    pub log_zone_end: u64,
    /// Data zones not currently backing any virtual zone; reused by GC.
    pub free_data_zones: Vec<u32>,
}

pub struct FtlState {
    maps: RwLock<Maps>,
}

impl FtlState {
    pub fn new(geometry: &Geometry, log_zones: u32) -> Self {
        let data_zones = geometry.zones - log_zones;
        let maps = Maps {
            log_mapping: HashMap::new(),
            data_mapping: HashMap::new(),
            zone_states: vec![ZoneState::Empty; data_zones as usize],
            log_zone_start: 0,
            log_zone_end: 0,
            free_data_zones: (0..data_zones).collect(),
        };
        Self {
            maps: RwLock::new(maps),
        }
    }

    /// Resolves LBA `lba` to a physical LBA: log mapping first, falling
    /// back to the data zone currently backing its virtual zone.
    pub fn resolve_read(&self, lba: u64, log_zones: u32, geometry: &Geometry) -> Result<u64> {
        let maps = self.maps.read().unwrap();
        if let Some(&phys) = maps.log_mapping.get(&lba) {
            return Ok(phys);
        }
        let vz = lba / geometry.blocks_per_zone as u64 + log_zones as u64;
        if let Some(&zone_start) = maps.data_mapping.get(&(vz as u32)) {
            let offset = lba % geometry.blocks_per_zone as u64;
            return Ok(zone_start + offset);
        }
        Err(Error::NotFound)
    }

    /// Returns the current log zone's start LBA and the number of LBAs
    /// still free in it, used by the writer to size its next append.
    pub fn current_log_zone(&self, geometry: &Geometry, log_zones: u32) -> (u64, u32) {
        let maps = self.maps.read().unwrap();
        let ring_len = log_zones as u64 * geometry.blocks_per_zone as u64;
        let pos = maps.log_zone_end % ring_len;
        let zone_no = (pos / geometry.blocks_per_zone as u64) as u32;
        let offset_in_zone = (pos % geometry.blocks_per_zone as u64) as u32;
        let zone_slba = geometry.zone_start_lba(zone_no);
        let room = geometry.blocks_per_zone - offset_in_zone;
        (zone_slba, room)
    }

    /// Records that `take` contiguous LBAs starting at logical address
    /// `a` now live at physical LBAs `[phys_start, phys_start+take)`,
    /// and advances the log write pointer. Performed under one write
    /// lock so the mapping update and the pointer advance are atomic
    /// with respect to concurrent readers and the GC.
    pub fn commit_write(&self, a: u64, phys_start: u64, take: u32, _geometry: &Geometry, _log_zones: u32) {
        let mut maps = self.maps.write().unwrap();
        for i in 0..take as u64 {
            maps.log_mapping.insert(a + i, phys_start + i);
        }
        maps.log_zone_end += take as u64;
    }

    /// Free LBAs remaining in the log-zone ring.
    pub fn free_log_blocks(&self, geometry: &Geometry, log_zones: u32) -> u64 {
        let maps = self.maps.read().unwrap();
        let total = log_zones as u64 * geometry.blocks_per_zone as u64;
        total - (maps.log_zone_end - maps.log_zone_start)
    }

    pub(super) fn with_maps_mut<T>(&self, f: impl FnOnce(&mut Maps) -> T) -> T {
        let mut maps = self.maps.write().unwrap();
        f(&mut maps)
    }

    pub(super) fn with_maps<T>(&self, f: impl FnOnce(&Maps) -> T) -> T {
        let maps = self.maps.read().unwrap();
        f(&maps)
    }
}
