//! The four scanner FIFOs.
//!
//! `crossbeam_queue::SegQueue` is already a dependency the hosting kernel
//! pulls in for its keyboard scancode buffer; it gives us a lock-free,
//! unbounded MPSC-friendly FIFO, which is the right shape for the new and
//! deletion queues (publishers append from arbitrary host threads; only the
//! scanner ever pops). We trade the spec's literal "unlink a specific
//! descriptor out of the middle of a queue" for a flag check on pop — see
//! `Engine::on_death` for why that is observationally equivalent here.

use crossbeam_queue::SegQueue;

use crate::descriptor::DescriptorHandle;

/// The new-pages, deletion, rescan and checksum-refresh FIFOs.
#[derive(Default)]
pub struct Queues {
    pub new: SegQueue<DescriptorHandle>,
    pub deletion: SegQueue<DescriptorHandle>,
    pub rescan: SegQueue<DescriptorHandle>,
    pub refresh: SegQueue<DescriptorHandle>,
}

impl Queues {
    pub fn new_set() -> Self {
        Queues::default()
    }

    /// Pops up to `max` items from `queue`, in FIFO order.
    pub fn drain(queue: &SegQueue<DescriptorHandle>, max: usize) -> alloc::vec::Vec<DescriptorHandle> {
        let mut items = alloc::vec::Vec::with_capacity(max.min(queue.len()));
        for _ in 0..max {
            match queue.pop() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }
}
