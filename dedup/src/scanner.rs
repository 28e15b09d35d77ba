//! The cooperative scanner batch loop.
//!
//! One call to [`scan_batch`] performs exactly one batch: drain the new and
//! rescan queues into a work list, run each descriptor through
//! `cmp_and_merge`, free anything marked `DELETED`, and refresh a slice of
//! the unstable population. There is no internal looping or sleeping here —
//! the host is expected to call this repeatedly from its own scheduler,
//! honoring `sleep_ms`/`deferred_timer` between calls.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::descriptor::DescriptorHandle;
use crate::engine::Engine;
use crate::error::MergeOutcome;
use crate::flags::StateFlags;
use crate::page_ops::LockError;
use crate::queue::Queues;

pub(crate) fn scan_batch(engine: &Engine) {
    let batch = engine.admin.pages_to_scan() as usize;

    // Step 1: drain new queue, hand off NEW -> IN_ENGINE.
    let mut work: Vec<DescriptorHandle> = Queues::drain(&engine.queues.new, batch);
    for d in &work {
        d.remove_flags(StateFlags::NEW);
        d.insert_flags(StateFlags::IN_ENGINE);
    }

    // Step 2: drain rescan queue, skipping anything already deleted.
    let rescanned = Queues::drain(&engine.queues.rescan, batch);
    for d in rescanned {
        d.remove_flags(StateFlags::RESCAN_QUEUED);
        if !d.is_deleted() {
            work.push(d);
        }
    }

    // Step 3: process the work list.
    let mut merged = 0usize;
    let mut deferred = 0usize;
    let mut dropped = 0usize;
    for descriptor in &work {
        if descriptor.is_deleted() {
            continue;
        }
        match engine.adapter.try_lock(descriptor.page()) {
            Err(LockError::Busy) | Err(LockError::ForkInProgress) => {
                requeue_for_rescan(engine, descriptor);
                deferred += 1;
                continue;
            }
            Ok(()) => {}
        }

        let outcome = engine.dispatch_merge(descriptor);
        engine.adapter.unlock(descriptor.page());

        match outcome {
            MergeOutcome::Success => merged += 1,
            MergeOutcome::Drop => {
                engine.retire(descriptor);
                dropped += 1;
            }
            MergeOutcome::Try => {
                warn!("try: page {:?} deferred to rescan", descriptor.page());
                requeue_for_rescan(engine, descriptor);
                deferred += 1;
            }
        }
    }

    // Step 4: free the deletion queue. Every entry here was already fully
    // retired by `Engine::on_death` (tree membership cleared, anchors
    // dropped, rmap_items decremented) at the moment death was observed;
    // this drain only bounds the queue's size.
    let freed = Queues::drain(&engine.queues.deletion, usize::MAX);

    // Step 5: refresh a slice of the unstable population.
    let refreshed = refresh_unstable(engine, batch);

    engine.admin.counters.inc_full_scans();
    debug!(
        "batch: {} processed ({} merged, {} deferred, {} dropped), {} freed, {} refreshed",
        work.len(),
        merged,
        deferred,
        dropped,
        freed.len(),
        refreshed
    );
}

fn requeue_for_rescan(engine: &Engine, descriptor: &DescriptorHandle) {
    descriptor.insert_flags(StateFlags::INIT_CHECKSUM | StateFlags::RESCAN_QUEUED);
    engine.queues.rescan.push(descriptor.clone());
}

/// §4.5: `need = min(pages_per_batch, unstable_count if unstable_count <
/// pages_per_batch else unstable_count * sleep_ms / (refresh_period_s *
/// 1000))`.
fn refresh_unstable(engine: &Engine, pages_per_batch: usize) -> usize {
    let unstable_count = engine.unstable.lock().len();
    let sleep_ms = engine.admin.sleep_ms() as u64;
    let refresh_period_s = engine.admin.refresh_period_s().max(1) as u64;

    let need = if unstable_count == 0 {
        0
    } else if unstable_count < pages_per_batch {
        unstable_count
    } else {
        let scaled = (unstable_count as u64 * sleep_ms) / (refresh_period_s * 1000);
        (scaled as usize).min(pages_per_batch)
    };

    if need == 0 {
        return 0;
    }

    let candidates: Vec<DescriptorHandle> = engine.unstable.lock().all_members().into_iter().take(need).collect();
    let mut refreshed = 0;
    for descriptor in candidates {
        if engine.adapter.try_lock(descriptor.page()).is_err() {
            continue;
        }
        let content = engine.adapter.content(descriptor.page());
        let fresh = engine.permutation.checksum(&content);
        engine.adapter.unlock(descriptor.page());

        if fresh != descriptor.checksum() {
            engine.unstable.lock().remove(&descriptor);
            descriptor.set_checksum(fresh);
            requeue_for_rescan(engine, &descriptor);
        }
        refreshed += 1;
    }
    refreshed
}
