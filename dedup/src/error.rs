//! Error and outcome types for the engine's public entry points.
//!
//! Kept as plain hand-written enums (no error-derive crate), matching the
//! style of the host kernel's own `FilesystemError`/`LoadingError` enums.

use core::fmt;

/// Outcome of a single PTE-level operation attempted by the merge protocol.
///
/// `Try`/`Drop` are never surfaced past the scanner: a `Try` goes back on the
/// rescan queue, a `Drop` frees the descriptor. Only `Success` is otherwise
/// observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The page was merged (or kept as-is); proceed.
    Success,
    /// Permanent reject for this descriptor: free it.
    Drop,
    /// Transient: page locked, I/O in flight, fork mid-walk. Requeue.
    Try,
}

/// Rejections raised at the `on_birth` API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BirthError {
    /// The page is already tracked by a live descriptor.
    AlreadyTracked,
    /// The page is already a shared (stable or zero) page.
    AlreadyShared,
    /// Ancillary allocation failed while registering the descriptor.
    AllocationFailure,
}

impl fmt::Display for BirthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BirthError::AlreadyTracked => write!(f, "page already tracked"),
            BirthError::AlreadyShared => write!(f, "page already shared"),
            BirthError::AllocationFailure => write!(f, "allocation failure registering descriptor"),
        }
    }
}

/// Failures from the page-table adapter surfaced to a caller (never to the
/// scanner, which treats all of these as `Try` or `Drop` internally).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteError {
    /// The page is locked by someone else, or has in-flight direct I/O.
    Locked,
    /// The VMA backing the page forbids merging (wrong flags, non-anonymous).
    Disallowed,
    /// A compound-page split was required but failed.
    SplitFailed,
    /// The page fork is mid-walk; retry later.
    ForkInProgress,
}

impl PteError {
    /// Classifies an adapter failure into the scanner's two recovery modes.
    pub fn outcome(self) -> MergeOutcome {
        match self {
            PteError::Locked | PteError::ForkInProgress => MergeOutcome::Try,
            PteError::Disallowed | PteError::SplitFailed => MergeOutcome::Drop,
        }
    }
}

/// Top-level error type for engine-wide operations (admin surface, hotplug).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupError {
    /// A precondition was violated at the API boundary (e.g. double-init).
    PreconditionViolated,
    /// The requested admin key does not exist or is not writable.
    InvalidAdminKey,
    /// The engine is not currently running.
    NotRunning,
}

impl fmt::Display for DedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupError::PreconditionViolated => write!(f, "precondition violated"),
            DedupError::InvalidAdminKey => write!(f, "invalid admin key"),
            DedupError::NotRunning => write!(f, "engine not running"),
        }
    }
}
