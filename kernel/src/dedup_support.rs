//! Wires the anonymous-page deduplication engine into the kernel and gives
//! it a small, self-contained page-table adapter to drive against.
//!
//! The adapter here is deliberately a software model, not a driver for the
//! real recursive page table: `dedup::PageOps` is exactly the boundary the
//! engine treats as an external collaborator ("the host operating-system
//! page-fault and page-table primitives ... specified only by the
//! capability contract the core needs"), and this kernel's process/paging
//! subsystem (`user.rs`, `scheduler.rs`) is not yet wired into `main`. A
//! real adapter would call through `RecursivePageTable`/`PhysicalMemoryManager`
//! the way `user.rs::allocate_user_page` does; this one stands in so the
//! engine's notification API has something concrete to exercise at boot.

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use dedup::{AnchorId, Engine, EngineConfig, LockError, PageContent, PageId, PageOps, PteError, PAGE_U32S};

use crate::debug_println;

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Routes the engine's `log` records to the debug port console, since that
/// sink (unlike the framebuffer `Console`) is reachable from a `&self`
/// logger without holding a mutable reference anywhere.
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            debug_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

struct Slot {
    content: Box<[u32; PAGE_U32S]>,
    redirect: Option<PageId>,
}

/// An in-memory stand-in for a physical page store. `PageId` indexes
/// directly into `slots`; `redirect` models a page whose mappings have all
/// been pointed at another slot (the merge protocol's `redirect` call),
/// without needing a real MMU to do it against.
struct DemoPageOps {
    slots: Mutex<Vec<Slot>>,
}

impl DemoPageOps {
    fn new() -> Self {
        DemoPageOps { slots: Mutex::new(Vec::new()) }
    }

    fn push(&self, words: [u32; PAGE_U32S]) -> PageId {
        let mut slots = self.slots.lock();
        let id = PageId(slots.len() as u64);
        slots.push(Slot { content: Box::new(words), redirect: None });
        id
    }

    fn resolve(&self, page: PageId) -> PageId {
        let mut current = page;
        let slots = self.slots.lock();
        loop {
            match slots.get(current.0 as usize).and_then(|s| s.redirect) {
                Some(next) => current = next,
                None => return current,
            }
        }
    }
}

impl PageOps for DemoPageOps {
    fn content(&self, page: PageId) -> PageContent {
        let resolved = self.resolve(page);
        let slots = self.slots.lock();
        PageContent::from_words(slots[resolved.0 as usize].content.as_ref())
    }

    fn try_lock(&self, _page: PageId) -> Result<(), LockError> {
        // Single cooperative worker, no preemption mid-batch; see module docs.
        Ok(())
    }

    fn unlock(&self, _page: PageId) {}

    fn write_protect(&self, _page: PageId) -> Result<(), PteError> {
        Ok(())
    }

    fn redirect(&self, _anchor: AnchorId, old: PageId, new: PageId) -> Result<(), PteError> {
        let resolved_new = self.resolve(new);
        if old == resolved_new {
            return Ok(());
        }
        let mut slots = self.slots.lock();
        slots[old.0 as usize].redirect = Some(resolved_new);
        Ok(())
    }

    fn mapping_count(&self, _anchor: AnchorId, _page: PageId) -> usize {
        1
    }
}

/// Installs the console logger. Call once, early in boot.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(LevelFilter::Trace);
}

/// Builds a fresh engine over a handful of synthetic pages (two identical,
/// one distinct, one all-zero), runs it for a couple of batches, and prints
/// the resulting control-surface counters: `pages_shared`/`pages_sharing`
/// should reflect the merge of the two identical pages, `pages_zero_sharing`
/// the zero page, and `pages_unshared` the one distinct survivor.
pub fn demo(console: &mut crate::console::Console) {
    let adapter = DemoPageOps::new();

    let shared_words = [7u32; PAGE_U32S];
    let mut distinct_words = [7u32; PAGE_U32S];
    distinct_words[0] = 42;
    let zero_words = [0u32; PAGE_U32S];

    let p1 = adapter.push(shared_words);
    let p2 = adapter.push(shared_words);
    let p3 = adapter.push(distinct_words);
    let p4 = adapter.push(zero_words);

    let engine = Engine::new(Box::new(adapter), EngineConfig::default());

    let _ = engine.on_birth(p1, AnchorId(1));
    let _ = engine.on_birth(p2, AnchorId(2));
    let _ = engine.on_birth(p3, AnchorId(3));
    let _ = engine.on_birth(p4, AnchorId(4));

    engine.scan_batch();
    engine.scan_batch();

    boot_println!(
        console,
        "dedup: shared={} sharing={} unshared={} zero_sharing={} rmap_items={}",
        engine.read_counter("pages_shared").unwrap_or(0),
        engine.read_counter("pages_sharing").unwrap_or(0),
        engine.read_counter("pages_unshared").unwrap_or(0),
        engine.read_counter("pages_zero_sharing").unwrap_or(0),
        engine.read_counter("rmap_items").unwrap_or(0),
    );
}
