//! The stable and unstable indices.
//!
//! Both trees need the same thing: an ordered, keyed index with O(log n)
//! search/insert/remove and graceful handling of keys that tie (hash mode)
//! or candidates that have gone stale mid-walk. `alloc::collections::BTreeMap`
//! already gives us the balanced-tree complexity the spec asks for, and the
//! hosting kernel's own VFS inode table is keyed the same way — so rather
//! than hand-roll an intrusive red-black tree (the usual kernel move, but
//! not one we can safely write and never compile-check), the index here is
//! a `BTreeMap` from key to a small bucket of candidates sharing that key.
//! A bucket has more than one live entry only in hash mode, where two
//! different contents can share a checksum; content-mode keys embed the
//! full page, so a key match there is already a content match.
//!
//! Content verification itself (comparing a fetched page against a
//! candidate's) is deliberately left to the merge protocol in `merge.rs`,
//! which is the only place that has an adapter handle to re-read a
//! candidate's live page — `Tree` only ever sees keys and descriptors.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::descriptor::DescriptorHandle;
use crate::flags::StateFlags;
use crate::page_ops::PageContent;

/// Which of the two trees a descriptor currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Stable,
    Unstable,
}

/// Whether trees are keyed by checksum (with a content-equality
/// confirmation on every tie) or by raw content directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Hash,
    Content,
}

/// The ordered key a descriptor occupies a tree slot under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeKey {
    Hash(u32),
    Content(Vec<u32>),
}

impl PartialOrd for TreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TreeKey::Hash(a), TreeKey::Hash(b)) => a.cmp(b),
            (TreeKey::Content(a), TreeKey::Content(b)) => a.cmp(b),
            // Trees never mix key kinds at runtime (mode is fixed per tree);
            // this arm only exists so the type is totally ordered.
            (TreeKey::Hash(_), TreeKey::Content(_)) => Ordering::Less,
            (TreeKey::Content(_), TreeKey::Hash(_)) => Ordering::Greater,
        }
    }
}

impl TreeKey {
    pub fn for_mode(mode: KeyMode, checksum: u32, content: &PageContent) -> Self {
        match mode {
            KeyMode::Hash => TreeKey::Hash(checksum),
            KeyMode::Content => TreeKey::Content(content.as_words().to_vec()),
        }
    }
}

/// An ordered index over descriptors, keyed per `mode`.
pub struct Tree {
    kind: TreeKind,
    mode: KeyMode,
    nodes: BTreeMap<TreeKey, Vec<DescriptorHandle>>,
    len: usize,
}

impl Tree {
    pub fn new(kind: TreeKind, mode: KeyMode) -> Self {
        Tree { kind, mode, nodes: BTreeMap::new(), len: 0 }
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_stale(handle: &DescriptorHandle, kind: TreeKind) -> bool {
        handle.is_deleted() || handle.tree() != Some(kind)
    }

    /// Returns the live candidates currently filed under `key`, pruning any
    /// stale (deleted, or no longer claiming membership in this tree)
    /// entries encountered along the way. In content mode this is at most
    /// one entry, since the key already embeds the full page.
    pub fn candidates(&mut self, key: &TreeKey) -> Vec<DescriptorHandle> {
        let kind = self.kind;
        let Some(bucket) = self.nodes.get_mut(key) else { return Vec::new() };
        let before = bucket.len();
        bucket.retain(|candidate| !Tree::is_stale(candidate, kind));
        self.len = self.len.saturating_sub(before - bucket.len());
        let live = bucket.clone();
        if bucket.is_empty() {
            self.nodes.remove(key);
        }
        live
    }

    /// Inserts `handle` under `key`, stamping its tree membership.
    pub fn insert(&mut self, key: TreeKey, handle: DescriptorHandle) {
        {
            let mut state = handle.state.lock();
            state.tree = Some(self.kind);
            state.tree_key = Some(key.clone());
            match self.kind {
                TreeKind::Stable => state.flags.insert(StateFlags::STABLE),
                TreeKind::Unstable => state.flags.insert(StateFlags::UNSTABLE),
            }
        }
        self.nodes.entry(key).or_default().push(handle);
        self.len += 1;
    }

    /// Every live descriptor currently filed in this tree, across all keys.
    /// Used by whole-tree administrative sweeps (unmerge, hotplug) that have
    /// no single key to look up.
    pub fn all_members(&self) -> Vec<DescriptorHandle> {
        self.nodes
            .values()
            .flatten()
            .filter(|d| !Tree::is_stale(d, self.kind))
            .cloned()
            .collect()
    }

    /// Removes `handle` from this tree, if it is currently a member.
    pub fn remove(&mut self, handle: &DescriptorHandle) {
        let key = {
            let mut state = handle.state.lock();
            if state.tree != Some(self.kind) {
                return;
            }
            let key = state.tree_key.take();
            state.tree = None;
            match self.kind {
                TreeKind::Stable => state.flags.remove(StateFlags::STABLE),
                TreeKind::Unstable => state.flags.remove(StateFlags::UNSTABLE),
            }
            key
        };
        let Some(key) = key else { return };
        if let Some(bucket) = self.nodes.get_mut(&key) {
            let before = bucket.len();
            bucket.retain(|d| !alloc::sync::Arc::ptr_eq(d, handle));
            self.len = self.len.saturating_sub(before - bucket.len());
            if bucket.is_empty() {
                self.nodes.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::flags::StateFlags;
    use crate::page_ops::{AnchorId, PageId};

    fn descriptor(page: u64) -> DescriptorHandle {
        Descriptor::new(PageId(page), AnchorId(0), StateFlags::NEW)
    }

    #[test]
    fn content_mode_round_trip() {
        let mut tree = Tree::new(TreeKind::Unstable, KeyMode::Content);
        let d = descriptor(1);
        let content = PageContent::from_words(&[1u32; crate::page_ops::PAGE_U32S]);
        let key = TreeKey::for_mode(KeyMode::Content, 0, &content);
        tree.insert(key.clone(), d.clone());
        assert_eq!(tree.len(), 1);
        let found = tree.candidates(&key);
        assert_eq!(found.len(), 1);
        tree.remove(&d);
        assert!(tree.is_empty());
    }

    #[test]
    fn stale_entries_are_pruned_on_search() {
        let mut tree = Tree::new(TreeKind::Stable, KeyMode::Hash);
        let d = descriptor(2);
        let key = TreeKey::Hash(7);
        tree.insert(key.clone(), d.clone());
        d.mark_deleted();
        let found = tree.candidates(&key);
        assert!(found.is_empty());
        assert!(tree.is_empty());
    }

    #[test]
    fn hash_mode_bucket_can_hold_multiple_candidates() {
        let mut tree = Tree::new(TreeKind::Unstable, KeyMode::Hash);
        let a = descriptor(3);
        let b = descriptor(4);
        let key = TreeKey::Hash(42);
        tree.insert(key.clone(), a.clone());
        tree.insert(key.clone(), b.clone());
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.candidates(&key).len(), 2);
    }
}
