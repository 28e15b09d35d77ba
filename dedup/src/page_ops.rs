//! The page-table adapter contract.
//!
//! Everything in this file is the capability boundary the spec calls "out of
//! scope": page locking, write-protect, PTE replacement, TLB flushing and
//! rmap walks are real operations on a real page table, owned by whatever
//! host embeds this crate. The engine only ever talks to them through
//! [`PageOps`]; `dedup` supplies no implementation of its own (the
//! `tests` module supplies an in-memory mock so the rest of the crate is
//! exercised on a normal host toolchain).

use alloc::boxed::Box;
use core::mem::size_of;

use crate::error::PteError;

/// Number of bytes in a tracked page. Matches the common 4 KiB base page
/// size; architectures with a different base page size are not modeled here
/// (the real comparison/zero-detection primitives for those are explicitly
/// out of scope, per spec).
pub const PAGE_SIZE: usize = 4096;

/// Number of u32 words per page; the unit the hash and comparator operate on.
pub const PAGE_U32S: usize = PAGE_SIZE / size_of::<u32>();

/// Opaque handle to a physical page, as understood by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

/// Opaque handle to a virtual-address-space root (the reverse-mapping
/// anchor the spec calls "address-space anchor").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnchorId(pub u64);

/// Sentinel page id standing in for the single, process-wide canonical
/// zero page. It never appears as a birth argument and is never tracked by
/// a descriptor (Invariant 6).
pub const ZERO_PAGE: PageId = PageId(u64::MAX);

/// A full snapshot of one page's content, as `u32` words.
///
/// Cloning copies the whole page; callers that only need to compare or hash
/// should prefer [`PageContent::as_words`] over repeated clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent(Box<[u32]>);

impl PageContent {
    /// Builds a page content snapshot from exactly [`PAGE_U32S`] words.
    ///
    /// # Panics
    /// Panics if `words.len() != PAGE_U32S`; the adapter is expected to
    /// always hand back a full page.
    pub fn from_words(words: &[u32]) -> Self {
        assert_eq!(words.len(), PAGE_U32S, "adapter returned a partial page");
        PageContent(words.into())
    }

    /// An all-zero page snapshot, used to seed the canonical zero checksum.
    pub fn zero() -> Self {
        PageContent(alloc::vec![0u32; PAGE_U32S].into_boxed_slice())
    }

    pub fn as_words(&self) -> &[u32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&word| word == 0)
    }
}

/// Transient-vs-permanent outcome of a lock attempt, mirroring the
/// distinction `cmp_and_merge` needs between "try later" and "reject".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Someone else holds the page lock, or direct I/O is in flight.
    Busy,
    /// The page is mid-fork and cannot be safely inspected yet.
    ForkInProgress,
}

impl From<LockError> for PteError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Busy => PteError::Locked,
            LockError::ForkInProgress => PteError::ForkInProgress,
        }
    }
}

/// The capability contract the core needs from the host's page-fault and
/// page-table machinery.
///
/// Implementations must be `Send + Sync`: the scanner is single-threaded,
/// but birth/death notifications arrive from arbitrary host threads and the
/// same adapter instance is shared with them.
pub trait PageOps: Send + Sync {
    /// Reads the full content of `page` for hashing/comparison.
    fn content(&self, page: PageId) -> PageContent;

    /// Attempts to take the page lock for the duration of a merge attempt.
    /// Short-lived: held only across a single `cmp_and_merge` call.
    fn try_lock(&self, page: PageId) -> Result<(), LockError>;

    /// Releases a lock taken by `try_lock`.
    fn unlock(&self, page: PageId);

    /// Write-protects `page` so its content becomes immutable from the
    /// host's point of view, a precondition for stable-tree membership.
    fn write_protect(&self, page: PageId) -> Result<(), PteError>;

    /// Redirects every PTE in `anchor` currently mapping `old` to point at
    /// `new` instead (breaking CoW, flushing the TLB as needed), and records
    /// one additional mapping on `new`.
    fn redirect(&self, anchor: AnchorId, old: PageId, new: PageId) -> Result<(), PteError>;

    /// Number of PTEs in `anchor` that currently map `page`.
    fn mapping_count(&self, anchor: AnchorId, page: PageId) -> usize;
}
