//! The per-tracked-page descriptor.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::flags::StateFlags;
use crate::page_ops::{AnchorId, PageId};
use crate::tree::{TreeKey, TreeKind};

/// A pin on a virtual-address-space anchor that currently maps this
/// descriptor's shared page. One anchor per distinct address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingAnchor {
    pub anchor: AnchorId,
}

/// Mutable state guarded by the descriptor's own lock. Everything here is
/// touched only by the scanner, except `flags` (death notifications flip
/// `DELETED` from any thread).
pub(crate) struct DescriptorState {
    pub flags: StateFlags,
    pub tree: Option<TreeKind>,
    pub tree_key: Option<TreeKey>,
    pub anchors: Vec<MappingAnchor>,
}

/// One tracked anonymous page.
///
/// Held behind [`DescriptorHandle`] (an `Arc`) everywhere; the scanner is
/// the only writer of `state`, but `checksum`, `share_count` and `page` are
/// plain atomics so that registry readers (walking anchors under the anchor
/// lock, not the descriptor lock) can observe them without contending with
/// the scanner. `page` is mutable — not just readable — because
/// `Engine::on_migrate` re-points a descriptor at a relocated physical frame
/// without otherwise disturbing it (the frame's content, and therefore its
/// tree key, is unchanged by a migration; only the backing location moves).
pub struct Descriptor {
    page: AtomicU64,
    pub origin_anchor: AnchorId,
    checksum: AtomicU32,
    share_count: AtomicUsize,
    pub(crate) state: Mutex<DescriptorState>,
}

pub type DescriptorHandle = Arc<Descriptor>;

impl Descriptor {
    pub fn new(page: PageId, origin_anchor: AnchorId, flags: StateFlags) -> DescriptorHandle {
        Arc::new(Descriptor {
            page: AtomicU64::new(page.0),
            origin_anchor,
            checksum: AtomicU32::new(0),
            share_count: AtomicUsize::new(0),
            state: Mutex::new(DescriptorState {
                flags,
                tree: None,
                tree_key: None,
                anchors: Vec::new(),
            }),
        })
    }

    pub fn page(&self) -> PageId {
        PageId(self.page.load(Ordering::Acquire))
    }

    pub fn set_page(&self, page: PageId) {
        self.page.store(page.0, Ordering::Release);
    }

    pub fn checksum(&self) -> u32 {
        self.checksum.load(Ordering::Acquire)
    }

    pub fn set_checksum(&self, value: u32) {
        self.checksum.store(value, Ordering::Release);
    }

    pub fn share_count(&self) -> usize {
        self.share_count.load(Ordering::Acquire)
    }

    pub fn add_share(&self, n: usize) -> usize {
        self.share_count.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Subtracts up to `n` from the share count, saturating at zero
    /// (Invariant 3: `share_count >= 0`).
    pub fn sub_share(&self, n: usize) {
        let _ = self
            .share_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(cur.saturating_sub(n)));
    }

    pub fn flags(&self) -> StateFlags {
        self.state.lock().flags
    }

    pub fn insert_flags(&self, flags: StateFlags) {
        self.state.lock().flags.insert(flags);
    }

    pub fn remove_flags(&self, flags: StateFlags) {
        self.state.lock().flags.remove(flags);
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().flags.contains(StateFlags::DELETED)
    }

    pub fn mark_deleted(&self) {
        self.insert_flags(StateFlags::DELETED);
    }

    pub fn tree(&self) -> Option<TreeKind> {
        self.state.lock().tree
    }
}
