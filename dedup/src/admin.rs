//! The flat key-value control surface.
//!
//! A typed struct of atomics rather than a generic config-file parser: this
//! is a live runtime control tree an administrator pokes at, not something
//! loaded once from disk.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::error::DedupError;

/// Value of the `run` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Stopped = 0,
    Merging = 1,
    Unmerge = 2,
}

impl RunMode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RunMode::Stopped),
            1 => Some(RunMode::Merging),
            2 => Some(RunMode::Unmerge),
            _ => None,
        }
    }
}

/// Monotonic counters the scanner and merge protocol update as they work.
/// `pages_shared`, `pages_unshared`, `stable_nodes` and `pages_sharing` are
/// not stored here — they are derived on read by
/// [`crate::engine::Engine::read_counter`] from the tree contents (a stable
/// entry with `k` mapping anchors contributes `k - 1` to `pages_sharing`,
/// per the worked examples in the testable-properties scenarios: two pages
/// merged into one entry read back as `pages_sharing = 1`, not 2). Zero-page
/// merges retire their descriptor entirely rather than keeping a tree
/// entry, so `pages_zero_sharing` has nowhere to be derived from and is
/// tracked here directly.
#[derive(Default)]
pub struct Counters {
    pages_zero_sharing: AtomicU64,
    rmap_items: AtomicU64,
    full_scans: AtomicU64,
}

impl Counters {
    pub fn pages_zero_sharing(&self) -> u64 {
        self.pages_zero_sharing.load(Ordering::Relaxed)
    }

    pub fn rmap_items(&self) -> u64 {
        self.rmap_items.load(Ordering::Relaxed)
    }

    pub fn full_scans(&self) -> u64 {
        self.full_scans.load(Ordering::Relaxed)
    }

    pub fn add_zero_sharing(&self, n: u64) {
        self.pages_zero_sharing.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_rmap_items(&self) {
        self.rmap_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_rmap_items(&self) {
        self.rmap_items.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_full_scans(&self) {
        self.full_scans.fetch_add(1, Ordering::Relaxed);
    }
}

/// Typed atomics backing the §6 control surface, plus the derived counters.
pub struct AdminSurface {
    run: AtomicU8,
    pages_to_scan: AtomicU32,
    sleep_ms: AtomicU32,
    refresh_period_s: AtomicU32,
    deferred_timer: AtomicU8,
    pub counters: Counters,
}

impl Default for AdminSurface {
    fn default() -> Self {
        AdminSurface {
            run: AtomicU8::new(RunMode::Stopped as u8),
            pages_to_scan: AtomicU32::new(100),
            sleep_ms: AtomicU32::new(20),
            refresh_period_s: AtomicU32::new(60),
            deferred_timer: AtomicU8::new(0),
            counters: Counters::default(),
        }
    }
}

impl AdminSurface {
    pub fn run_mode(&self) -> RunMode {
        RunMode::from_u8(self.run.load(Ordering::Acquire)).unwrap_or(RunMode::Stopped)
    }

    pub fn set_run_mode(&self, mode: RunMode) {
        self.run.store(mode as u8, Ordering::Release);
    }

    pub fn pages_to_scan(&self) -> u32 {
        self.pages_to_scan.load(Ordering::Relaxed)
    }

    pub fn set_pages_to_scan(&self, v: u32) {
        self.pages_to_scan.store(v, Ordering::Relaxed);
    }

    pub fn sleep_ms(&self) -> u32 {
        self.sleep_ms.load(Ordering::Relaxed)
    }

    pub fn set_sleep_ms(&self, v: u32) {
        self.sleep_ms.store(v, Ordering::Relaxed);
    }

    pub fn refresh_period_s(&self) -> u32 {
        self.refresh_period_s.load(Ordering::Relaxed)
    }

    pub fn set_refresh_period_s(&self, v: u32) {
        self.refresh_period_s.store(v, Ordering::Relaxed);
    }

    pub fn deferred_timer(&self) -> bool {
        self.deferred_timer.load(Ordering::Relaxed) != 0
    }

    pub fn set_deferred_timer(&self, v: bool) {
        self.deferred_timer.store(v as u8, Ordering::Relaxed);
    }

    /// Writes one of the RW scalar keys that don't require engine-wide
    /// coordination (`run` and the hotplug/unmerge transitions it can
    /// trigger are handled by the engine itself, which has tree access).
    pub fn write_scalar(&self, key: &str, value: u32) -> Result<(), DedupError> {
        match key {
            "pages_to_scan" => self.set_pages_to_scan(value),
            "sleep_ms" => self.set_sleep_ms(value),
            "refresh_period_s" => self.set_refresh_period_s(value),
            "deferred_timer" => self.set_deferred_timer(value != 0),
            _ => return Err(DedupError::InvalidAdminKey),
        }
        Ok(())
    }
}
