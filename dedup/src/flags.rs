//! Descriptor state flags.
//!
//! The spec keeps these packed into the low bits of a descriptor's virtual
//! address field; we keep them as a plain `bitflags` set on the descriptor's
//! guarded state instead; the saved bits aren't precious here, and
//! `bitflags` is already a dependency the hosting kernel pulls in for its
//! own page-table and syscall flag sets.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        /// Freshly born, sitting on the new-pages FIFO.
        const NEW              = 1 << 0;
        /// Past the new-queue hand-off; the scanner owns it now.
        const IN_ENGINE         = 1 << 1;
        /// Currently indexed in the unstable tree.
        const UNSTABLE          = 1 << 2;
        /// Currently indexed in the stable tree (merged, write-protected).
        const STABLE            = 1 << 3;
        /// Enqueued on the checksum-refresh FIFO.
        const CHECKSUM_QUEUED   = 1 << 4;
        /// Checksum must be recomputed before this descriptor is used as a key.
        const INIT_CHECKSUM     = 1 << 5;
        /// Enqueued on the rescan FIFO.
        const RESCAN_QUEUED     = 1 << 6;
        /// Death notification observed; free on next drain.
        const DELETED           = 1 << 7;
    }
}
