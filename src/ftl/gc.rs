//! The FTL garbage collector: one dedicated worker thread that merges
//! log-zone contents into data zones when log occupancy crosses the
//! configured watermark.
//!
//! The signalling protocol is an explicit `{idle -> requested ->
//! running -> idle}` state machine rather than a bare condvar wait, so
//! there's no need to reason about spurious wakeups or lost wakeups
//! racing a writer's request against the worker's own transition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use super::{Ftl, ZoneState};
use crate::device::chunked_io;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Requested,
    Running,
}

pub struct GcController {
    state: Mutex<State>,
    cv: Condvar,
    watermark_blocks: u64,
    stop: AtomicBool,
    cycles_completed: AtomicU64,
}

impl GcController {
    pub fn new(watermark_blocks: u64) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            cv: Condvar::new(),
            watermark_blocks,
            stop: AtomicBool::new(false),
            cycles_completed: AtomicU64::new(0),
        }
    }

    pub fn watermark_blocks(&self) -> u64 {
        self.watermark_blocks
    }

    /// Number of GC cycles that actually merged at least one virtual
    /// zone's log contents into a data zone (cycles that ran and found
    /// nothing to do don't count).
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Acquire)
    }

    fn record_cycle(&self) {
        self.cycles_completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by a writer: if GC isn't already requested or running,
    /// request it and wake the worker.
    pub fn request(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Idle {
            *state = State::Requested;
            self.cv.notify_all();
        }
    }

    /// Called by a writer after `request`: blocks until the GC has
    /// returned to `Idle` (i.e. a full cycle has completed).
    pub fn wait_until_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while *state != State::Idle {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Called by the GC worker: blocks until a request arrives (or stop
    /// is signalled), then transitions to `Running`. Returns `false` if
    /// the worker should exit instead of running a cycle.
    fn wait_for_request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            if *state == State::Requested {
                *state = State::Running;
                return true;
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Called by the GC worker once a cycle completes: returns to
    /// `Idle` and wakes any writers waiting on `wait_until_idle`.
    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        *state = State::Idle;
        self.cv.notify_all();
    }

    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.cv.notify_all();
    }
}

/// Blocks the caller until at least `needed` LBAs of log space are
/// free, requesting (and waiting out) GC cycles as needed.
pub(super) fn wait_for_space(ftl: &Ftl, needed: u32) {
    loop {
        let free = ftl.state().free_log_blocks(&ftl.geometry(), ftl.log_zones());
        if free > ftl.gc().watermark_blocks() && free >= needed as u64 {
            return;
        }
        ftl.gc().request();
        ftl.gc().wait_until_idle();
    }
}

/// Entry point for the dedicated GC thread spawned by [`Ftl::init`].
pub(super) fn run_gc_loop(ftl: Ftl) {
    while ftl.gc().wait_for_request() {
        match run_gc_cycle(&ftl) {
            Ok(merged) => {
                if merged {
                    ftl.gc().record_cycle();
                }
            }
            // Errors inside a GC cycle are logged and do not interrupt
            // the worker loop; the next request gets a fresh attempt.
            Err(err) => log::error!("GC cycle failed: {err}"),
        }
        ftl.gc().finish();
    }
}

/// Runs one merge cycle, returning whether it actually merged anything
/// (an empty log ring is a no-op cycle, not a failure).
fn run_gc_cycle(ftl: &Ftl) -> Result<bool> {
    let geometry = ftl.geometry();
    let log_zones = ftl.log_zones();
    let zone_bytes = geometry.zone_bytes() as usize;
    let mdts = geometry.mdts as usize;

    // 1 & 2: snapshot log_mapping into per-virtual-zone buckets, then
    // clear it and remember the old ring bounds.
    let (buckets, old_start, old_end) = ftl.state().with_maps_mut(|maps| {
        let mut buckets: std::collections::HashMap<u32, Vec<(u32, u64)>> =
            std::collections::HashMap::new();
        for (&lba, &phys) in maps.log_mapping.iter() {
            let vz = (lba / geometry.blocks_per_zone as u64) as u32 + log_zones;
            let offset = (lba % geometry.blocks_per_zone as u64) as u32;
            buckets.entry(vz).or_default().push((offset, phys));
        }
        let old_start = maps.log_zone_start;
        let old_end = maps.log_zone_end;
        maps.log_mapping.clear();
        (buckets, old_start, old_end)
    });

    if buckets.is_empty() {
        return Ok(false);
    }

    // 3: merge each virtual zone's log contents into a data zone.
    for (vz, entries) in &buckets {
        let data_idx = vz - log_zones;
        let mut buffer = vec![0u8; zone_bytes];

        let prior_zone_slba = ftl.state().with_maps(|maps| maps.data_mapping.get(vz).copied());
        if let Some(prior) = prior_zone_slba {
            chunked_io(zone_bytes, mdts, |off, len| {
                let lba_off = off as u64 / geometry.lba_size as u64;
                ftl.device()
                    .read(prior + lba_off, &mut buffer[off..off + len], len)
            })?;
        }

        for &(offset, log_lba) in entries {
            let start = offset as usize * geometry.lba_size as usize;
            let end = start + geometry.lba_size as usize;
            ftl.device()
                .read(log_lba, &mut buffer[start..end], geometry.lba_size as usize)?;
        }

        let (target_slba, reused_prior) = ftl.state().with_maps_mut(|maps| {
            if let Some(zone_no) = maps.free_data_zones.pop() {
                (geometry.zone_start_lba(zone_no), false)
            } else {
                // No empty data zone available: fall back to reusing
                // this virtual zone's own current backing zone.
                (prior_zone_slba.expect("virtual zone must already have a backing zone"), true)
            }
        });

        if reused_prior {
            ftl.device().reset(target_slba)?;
        }
        ftl.device().append(target_slba, &buffer, zone_bytes)?;

        ftl.state().with_maps_mut(|maps| {
            if !reused_prior {
                if let Some(prior) = prior_zone_slba {
                    let prior_idx = (prior / geometry.blocks_per_zone as u64) as u32 - log_zones;
                    maps.zone_states[prior_idx as usize] = ZoneState::Empty;
                    maps.free_data_zones.push(prior_idx);
                }
            }
            maps.data_mapping.insert(*vz, target_slba);
            maps.zone_states[data_idx as usize] = ZoneState::Full;
        });
    }

    // 4: reset every log zone spanned by the drained portion of the ring.
    use itertools::Itertools;
    let ring_len = log_zones as u64 * geometry.blocks_per_zone as u64;
    let reset_zones = (old_start..old_end)
        .map(|pos| ((pos % ring_len) / geometry.blocks_per_zone as u64) as u32)
        .unique();
    for zone_no in reset_zones {
        ftl.device().reset(geometry.zone_start_lba(zone_no))?;
    }
    ftl.state().with_maps_mut(|maps| {
        maps.log_zone_start = old_end;
    });

    Ok(true)
}
