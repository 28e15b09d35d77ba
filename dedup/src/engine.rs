//! The engine: owns the trees, queues, admin surface and registry, and
//! exposes the notification API named in the control-surface and
//! notification tables.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use log::{debug, error, warn};
use spin::Mutex;

use crate::admin::{AdminSurface, RunMode};
use crate::descriptor::{Descriptor, DescriptorHandle};
use crate::error::{BirthError, DedupError, MergeOutcome};
use crate::flags::StateFlags;
use crate::hash::Permutation;
use crate::merge::cmp_and_merge;
use crate::page_ops::{AnchorId, PageId, PageOps};
use crate::queue::Queues;
use crate::tree::{KeyMode, Tree, TreeKind};

/// How a tree is keyed. Runtime-selectable (§10.6) rather than fixed at
/// compile time, so both modes run under the same test binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub key_mode: KeyMode,
    /// Seed for the sampling permutation; fixed at construction so checksums
    /// stay comparable across the engine's lifetime.
    pub permutation_seed: u64,
    /// Descriptors drained from the new/rescan FIFOs per batch.
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { key_mode: KeyMode::Hash, permutation_seed: 0x5eed, batch_size: 32 }
    }
}

/// A guard returned by [`Engine::on_going_offline`]; dropping it (or calling
/// [`Engine::on_cancel_offline`]) releases the engine-wide lock it holds.
pub struct OfflineGuard<'a> {
    engine: &'a Engine,
}

/// Owns every piece of engine state: the two trees, the four queues, the
/// reverse-mapping anchors (held inside each stable descriptor), the admin
/// surface, and the page-table adapter.
pub struct Engine {
    pub(crate) stable: Mutex<Tree>,
    pub(crate) unstable: Mutex<Tree>,
    pub(crate) queues: Queues,
    pub admin: AdminSurface,
    pub(crate) permutation: Permutation,
    pub(crate) zero_checksum: u32,
    pub(crate) adapter: Box<dyn PageOps>,
    hotplug_lock: Mutex<()>,
    /// Every `PageId` currently backing a live descriptor, so `on_birth` can
    /// reject a page that's already tracked (§4.7's "not already tracked"
    /// precondition) instead of silently allocating a second descriptor for
    /// it. Kept in lockstep with `retire` (remove) and `on_migrate`
    /// (remove old, insert new).
    tracked: Mutex<BTreeSet<PageId>>,
}

impl Engine {
    pub fn new(adapter: Box<dyn PageOps>, config: EngineConfig) -> Self {
        let permutation = Permutation::new(config.permutation_seed);
        let zero_checksum = permutation.zero_checksum();
        Engine {
            stable: Mutex::new(Tree::new(TreeKind::Stable, config.key_mode)),
            unstable: Mutex::new(Tree::new(TreeKind::Unstable, config.key_mode)),
            queues: Queues::new_set(),
            admin: AdminSurface::default(),
            permutation,
            zero_checksum,
            adapter,
            hotplug_lock: Mutex::new(()),
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Frees a descriptor's engine-owned state: tree membership, anchors,
    /// and the live-descriptor count. Used at every retirement point —
    /// scanner drop, zero-merge, stable join, and promotion's consumed
    /// candidate — so none of them can forget a step.
    pub(crate) fn retire(&self, descriptor: &DescriptorHandle) {
        if descriptor.is_deleted() {
            return;
        }
        self.stable.lock().remove(descriptor);
        self.unstable.lock().remove(descriptor);
        crate::registry::drop_anchors(descriptor);
        self.tracked.lock().remove(&descriptor.page());
        descriptor.mark_deleted();
        self.admin.counters.dec_rmap_items();
    }

    /// §6 notification: a new anonymous page has been selected for tracking
    /// by the host's memory-management collaborator. Rejects a page that's
    /// already tracked by a live descriptor, per §4.7's birth precondition.
    pub fn on_birth(&self, page: PageId, anchor: AnchorId) -> Result<DescriptorHandle, BirthError> {
        if page == crate::page_ops::ZERO_PAGE {
            return Err(BirthError::AlreadyShared);
        }
        if !self.tracked.lock().insert(page) {
            return Err(BirthError::AlreadyTracked);
        }
        let descriptor = Descriptor::new(page, anchor, StateFlags::NEW | StateFlags::INIT_CHECKSUM);
        self.admin.counters.inc_rmap_items();
        self.queues.new.push(descriptor.clone());
        debug!("birth: page {:?} anchor {:?}", page, anchor);
        Ok(descriptor)
    }

    /// §6 notification: the mapping `descriptor` was originally born under
    /// has torn down. Mirrors `on_unmap_walk` exactly, using the
    /// descriptor's own `origin_anchor`: if the descriptor heads a
    /// multi-anchor stable entry, only that one anchor is dropped and the
    /// entry survives for the mappings still live under its other anchors;
    /// the descriptor itself is only freed once its anchor count (and, for
    /// descriptors that were never promoted, that count starts at zero)
    /// reaches zero. This is the only path by which a shared entry's head
    /// can signal its own death, since a joiner's descriptor is always
    /// retired immediately at merge time (`merge.rs`).
    pub fn on_death(&self, descriptor: &DescriptorHandle) {
        if descriptor.is_deleted() {
            return;
        }
        self.on_unmap_walk(descriptor, descriptor.origin_anchor);
        if descriptor.is_deleted() {
            self.queues.deletion.push(descriptor.clone());
        }
        debug!("death: page {:?}", descriptor.page());
    }

    /// §6 notification: walks every mapping anchor of the shared page
    /// backing `descriptor`, invoking `visitor` for each, returning the
    /// number of anchors visited.
    pub fn on_reference_walk<F>(&self, descriptor: &DescriptorHandle, visitor: F) -> usize
    where
        F: FnMut(AnchorId) -> bool,
    {
        let mut count = 0;
        let mut visitor = visitor;
        crate::registry::walk_anchors(descriptor, |anchor| {
            count += 1;
            visitor(anchor)
        });
        count
    }

    /// §6 notification: one anchor is unmapping the shared page. Drops that
    /// anchor; if it was the last one, the descriptor is retired entirely.
    pub fn on_unmap_walk(&self, descriptor: &DescriptorHandle, anchor: AnchorId) {
        {
            let mut state = descriptor.state.lock();
            state.anchors.retain(|a| a.anchor != anchor);
        }
        descriptor.sub_share(1);
        if crate::registry::anchor_count(descriptor) == 0 {
            self.retire(descriptor);
        }
    }

    /// §6 notification: the adapter has relocated a tracked page's backing
    /// frame without changing its content (e.g. compaction). Tree entries
    /// are keyed by checksum or content, never by `PageId`, so a migration
    /// never needs to move a descriptor between tree buckets — only its
    /// stored page identity needs updating so subsequent `content`/
    /// `write_protect`/`redirect`/`mapping_count` calls address the frame
    /// the adapter actually moved it to.
    pub fn on_migrate(&self, descriptor: &DescriptorHandle, new_page: PageId) {
        if descriptor.is_deleted() {
            return;
        }
        let old_page = descriptor.page();
        debug!("migrate: page {:?} -> {:?}", old_page, new_page);
        descriptor.set_page(new_page);
        let mut tracked = self.tracked.lock();
        tracked.remove(&old_page);
        tracked.insert(new_page);
    }

    /// One batch of scanner work. See `scanner.rs`.
    pub fn scan_batch(&self) {
        crate::scanner::scan_batch(self);
    }

    /// Runtime snapshot of a read-only control-surface key.
    pub fn read_counter(&self, key: &str) -> Result<u64, DedupError> {
        Ok(match key {
            "pages_shared" | "stable_nodes" => self.stable.lock().len() as u64,
            "pages_unshared" => self.unstable.lock().len() as u64,
            "pages_sharing" => self
                .stable
                .lock()
                .all_members()
                .iter()
                .map(|d| crate::registry::anchor_count(d).saturating_sub(1) as u64)
                .sum(),
            "pages_zero_sharing" => self.admin.counters.pages_zero_sharing(),
            "rmap_items" => self.admin.counters.rmap_items(),
            "full_scans" => self.admin.counters.full_scans(),
            _ => return Err(DedupError::InvalidAdminKey),
        })
    }

    /// Writes the `run` control key, triggering the unmerge sweep
    /// synchronously when transitioning to `RunMode::Unmerge`.
    pub fn write_run(&self, value: u8) -> Result<(), DedupError> {
        let mode = match value {
            0 => RunMode::Stopped,
            1 => RunMode::Merging,
            2 => RunMode::Unmerge,
            _ => return Err(DedupError::InvalidAdminKey),
        };
        self.admin.set_run_mode(mode);
        if mode == RunMode::Unmerge {
            self.unmerge_all();
        }
        Ok(())
    }

    /// `run = 2`: walks every stable-tree entry, breaks COW on each mapping
    /// anchor via the adapter, and retires the descriptor (which drops it
    /// out of the tree `pages_sharing` is derived from). Synchronous with
    /// respect to the caller rather than queued scanner work, since it is a
    /// rare whole-tree administrative operation.
    fn unmerge_all(&self) {
        let members: Vec<DescriptorHandle> = {
            let stable = self.stable.lock();
            stable.all_members()
        };
        debug!("unmerge: {} stable entries", members.len());
        for descriptor in members {
            let anchors: Vec<AnchorId> = {
                let mut found = Vec::new();
                crate::registry::walk_anchors(&descriptor, |anchor| {
                    found.push(anchor);
                    true
                });
                found
            };
            for anchor in anchors {
                if let Err(e) = self.adapter.redirect(anchor, descriptor.page(), descriptor.page()) {
                    warn!("unmerge: break-cow failed for anchor {:?}: {:?}", anchor, e);
                }
            }
            self.retire(&descriptor);
        }
    }

    /// Begins a memory-hotplug offline transition: takes the engine-wide
    /// hotplug lock for the duration of the OFFLINE/CANCEL_OFFLINE window.
    /// Rejects a second, overlapping `GOING_OFFLINE` with
    /// `PreconditionViolated` rather than deadlocking the caller against its
    /// own unfinished transition.
    pub fn on_going_offline(&self) -> Result<OfflineGuard<'_>, DedupError> {
        match self.hotplug_lock.try_lock() {
            Some(guard) => {
                core::mem::forget(guard);
                Ok(OfflineGuard { engine: self })
            }
            None => Err(DedupError::PreconditionViolated),
        }
    }

    /// Completes an offline transition: drops every descriptor whose page
    /// satisfies `in_range`, then releases the hotplug lock.
    pub fn on_offline(&self, guard: OfflineGuard<'_>, in_range: impl Fn(PageId) -> bool) {
        let doomed: Vec<DescriptorHandle> = {
            let stable = self.stable.lock();
            let unstable = self.unstable.lock();
            stable
                .all_members()
                .into_iter()
                .chain(unstable.all_members())
                .filter(|d| in_range(d.page()))
                .collect()
        };
        for descriptor in &doomed {
            self.retire(descriptor);
        }
        debug!("hotplug offline: retired {} descriptors", doomed.len());
        self.on_cancel_offline(guard);
    }

    /// Aborts an offline transition without touching any descriptor.
    pub fn on_cancel_offline(&self, guard: OfflineGuard<'_>) {
        let OfflineGuard { engine } = guard;
        unsafe { engine.hotplug_lock.force_unlock() };
    }

    pub(crate) fn dispatch_merge(&self, descriptor: &DescriptorHandle) -> MergeOutcome {
        cmp_and_merge(self, descriptor)
    }
}

/// Allocation-failure surfaced to `on_birth` callers who pre-check capacity;
/// kept here rather than in `error.rs` since it is purely a documentation
/// hook for the environmental-failure path named in §7 — this engine's
/// `Descriptor::new` uses an infallible `Arc::new`, so callers embedding
/// this crate where allocation can fail should check their allocator
/// before calling `on_birth` and map a failure to this variant themselves.
pub fn allocation_failure() -> BirthError {
    error!("allocation failure registering descriptor");
    BirthError::AllocationFailure
}
