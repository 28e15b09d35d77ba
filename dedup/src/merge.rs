//! `cmp_and_merge`: the heart of the scanner's per-descriptor work.
//!
//! Callers are expected to already hold the page lock for `descriptor.page()`
//! (the scanner takes it in step 3.2 of a batch, before dispatching here,
//! and releases it once this returns) — this function never locks or
//! unlocks a page itself, only write-protects and redirects.

use log::trace;

use crate::engine::Engine;
use crate::error::MergeOutcome;
use crate::flags::StateFlags;
use crate::page_ops::ZERO_PAGE;
use crate::registry;
use crate::tree::TreeKey;
use crate::{descriptor::DescriptorHandle, error::PteError};

pub(crate) fn cmp_and_merge(engine: &Engine, descriptor: &DescriptorHandle) -> MergeOutcome {
    if descriptor.page() == ZERO_PAGE || descriptor.flags().contains(StateFlags::STABLE) {
        return MergeOutcome::Drop;
    }

    // Step 2: a descriptor re-entering cmp_and_merge (e.g. off the rescan
    // queue) must not still be filed under its old key.
    engine.stable.lock().remove(descriptor);
    engine.unstable.lock().remove(descriptor);

    let content = engine.adapter.content(descriptor.page());

    let checksum = if descriptor.flags().contains(StateFlags::INIT_CHECKSUM) {
        let c = engine.permutation.checksum(&content);
        descriptor.set_checksum(c);
        descriptor.remove_flags(StateFlags::INIT_CHECKSUM);
        c
    } else {
        descriptor.checksum()
    };

    // Zero fast path.
    if checksum == engine.zero_checksum && content.is_zero() {
        let mapped = engine.adapter.mapping_count(descriptor.origin_anchor, descriptor.page());
        match engine.adapter.redirect(descriptor.origin_anchor, descriptor.page(), ZERO_PAGE) {
            Ok(()) => {
                engine.admin.counters.add_zero_sharing(mapped.max(1) as u64);
                engine.retire(descriptor);
                trace!("zero-merged page {:?}", descriptor.page());
                return MergeOutcome::Success;
            }
            Err(e) => return e.outcome(),
        }
    }

    // Stable lookup.
    {
        let mode = engine.stable.lock().mode();
        let key = TreeKey::for_mode(mode, checksum, &content);
        let candidates = engine.stable.lock().candidates(&key);
        for candidate in candidates {
            let candidate_content = engine.adapter.content(candidate.page());
            if candidate_content != content {
                // Divergent: the stable invariant (immutable, write-protected
                // content) was violated by a racy CoW break. Evict before
                // comparing against anything else.
                engine.stable.lock().remove(&candidate);
                continue;
            }
            if let Err(e) = engine.adapter.write_protect(descriptor.page()) {
                return e.outcome();
            }
            match engine.adapter.redirect(descriptor.origin_anchor, descriptor.page(), candidate.page()) {
                Ok(()) => {
                    let mapped = engine.adapter.mapping_count(descriptor.origin_anchor, candidate.page()).max(1);
                    registry::append_anchor(&candidate, descriptor.origin_anchor);
                    candidate.add_share(mapped);
                    engine.retire(descriptor);
                    trace!("joined stable page {:?}", candidate.page());
                    return MergeOutcome::Success;
                }
                Err(e) => return e.outcome(),
            }
        }
    }

    // Unstable lookup / insert.
    let mode = engine.unstable.lock().mode();
    let key = TreeKey::for_mode(mode, checksum, &content);
    let candidates = engine.unstable.lock().candidates(&key);
    for candidate in candidates {
        let candidate_content = engine.adapter.content(candidate.page());
        if candidate_content != content {
            // Unlike the stable tree, a checksum tie here is not an
            // invariant violation — just an ordinary hash collision (or an
            // as-yet-unrefreshed unstable key). The candidate is still a
            // perfectly good unstable-tree member; leave it in place and
            // keep looking at the rest of the bucket.
            continue;
        }
        if let Err(e) = write_protect_both(engine, descriptor, &candidate) {
            return e.outcome();
        }
        // Re-verify after protecting: a concurrent writer could have raced
        // the comparison above before protection took effect.
        if engine.adapter.content(descriptor.page()) != engine.adapter.content(candidate.page()) {
            return MergeOutcome::Try;
        }
        if let Err(e) = engine.adapter.redirect(candidate.origin_anchor, candidate.page(), descriptor.page()) {
            return e.outcome();
        }
        engine.unstable.lock().remove(&candidate);

        let own_mapped = engine.adapter.mapping_count(descriptor.origin_anchor, descriptor.page()).max(1);
        let their_mapped = engine.adapter.mapping_count(candidate.origin_anchor, descriptor.page()).max(1);
        registry::append_anchor(descriptor, descriptor.origin_anchor);
        registry::append_anchor(descriptor, candidate.origin_anchor);
        descriptor.add_share(own_mapped + their_mapped);

        let stable_mode = engine.stable.lock().mode();
        let promote_key = TreeKey::for_mode(stable_mode, checksum, &content);
        engine.stable.lock().insert(promote_key, descriptor.clone());
        engine.retire(&candidate);
        trace!("promoted page {:?} to stable", descriptor.page());
        return MergeOutcome::Success;
    }

    // No match anywhere: file as a fresh unstable candidate.
    engine.unstable.lock().insert(key, descriptor.clone());
    engine.queues.refresh.push(descriptor.clone());
    descriptor.insert_flags(StateFlags::CHECKSUM_QUEUED);
    trace!("inserted page {:?} into unstable tree", descriptor.page());
    MergeOutcome::Success
}

fn write_protect_both(
    engine: &Engine,
    a: &DescriptorHandle,
    b: &DescriptorHandle,
) -> Result<(), PteError> {
    engine.adapter.write_protect(a.page())?;
    engine.adapter.write_protect(b.page())?;
    Ok(())
}
