//! The reverse-mapping registry.
//!
//! Every stable-tree descriptor carries a list of mapping anchors — one per
//! distinct address space currently mapping its shared page. This module is
//! the fan-out point: OS-level queries against a shared page (reference
//! counting, unmap, migration) walk this list rather than re-deriving it.

use crate::descriptor::{DescriptorHandle, MappingAnchor};
use crate::page_ops::AnchorId;

/// Appends a new mapping anchor to `descriptor`, as performed by the merge
/// protocol at promotion or join time. No-op if the anchor is already
/// present (a second birth from the same address space onto an
/// already-shared page should not double the anchor list).
pub fn append_anchor(descriptor: &DescriptorHandle, anchor: AnchorId) {
    let mut state = descriptor.state.lock();
    if !state.anchors.iter().any(|a| a.anchor == anchor) {
        state.anchors.push(MappingAnchor { anchor });
    }
}

/// Releases every anchor pinned by `descriptor`. Called when the descriptor
/// is freed.
pub fn drop_anchors(descriptor: &DescriptorHandle) {
    descriptor.state.lock().anchors.clear();
}

/// Number of distinct address spaces currently anchoring `descriptor`.
pub fn anchor_count(descriptor: &DescriptorHandle) -> usize {
    descriptor.state.lock().anchors.len()
}

/// Walks every mapping anchor of `descriptor`, invoking `visitor` for each.
/// The stop policy (reference-walk, unmap, migration-walk) is the caller's:
/// `visitor` returning `false` ends the walk early.
pub fn walk_anchors<F>(descriptor: &DescriptorHandle, mut visitor: F)
where
    F: FnMut(AnchorId) -> bool,
{
    let anchors: alloc::vec::Vec<AnchorId> =
        descriptor.state.lock().anchors.iter().map(|a| a.anchor).collect();
    for anchor in anchors {
        if !visitor(anchor) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::flags::StateFlags;
    use crate::page_ops::PageId;

    #[test]
    fn append_is_idempotent_per_anchor() {
        let d = Descriptor::new(PageId(1), AnchorId(0), StateFlags::NEW);
        append_anchor(&d, AnchorId(10));
        append_anchor(&d, AnchorId(10));
        append_anchor(&d, AnchorId(11));
        assert_eq!(anchor_count(&d), 2);
    }

    #[test]
    fn walk_visits_every_anchor_unless_stopped_early() {
        let d = Descriptor::new(PageId(1), AnchorId(0), StateFlags::NEW);
        append_anchor(&d, AnchorId(1));
        append_anchor(&d, AnchorId(2));
        append_anchor(&d, AnchorId(3));

        let mut seen = 0;
        walk_anchors(&d, |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 3);

        let mut seen_partial = 0;
        walk_anchors(&d, |_| {
            seen_partial += 1;
            seen_partial < 2
        });
        assert_eq!(seen_partial, 2);
    }

    #[test]
    fn drop_clears_all_anchors() {
        let d = Descriptor::new(PageId(1), AnchorId(0), StateFlags::NEW);
        append_anchor(&d, AnchorId(1));
        drop_anchors(&d);
        assert_eq!(anchor_count(&d), 0);
    }
}
