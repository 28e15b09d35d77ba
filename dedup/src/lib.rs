//! Kernel-side anonymous-page deduplication engine.
//!
//! Scans anonymous memory pages, merges identical-content pages into a
//! single shared, write-protected, copy-on-write physical page, and
//! specializes all-zero pages onto a canonical zero page. See `engine.rs`
//! for the public notification API and `admin.rs` for the runtime control
//! surface.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod admin;
mod descriptor;
mod engine;
mod error;
mod flags;
mod hash;
mod merge;
mod page_ops;
mod queue;
mod registry;
mod scanner;
mod tree;

pub use admin::{AdminSurface, Counters, RunMode};
pub use descriptor::{Descriptor, DescriptorHandle, MappingAnchor};
pub use engine::{Engine, EngineConfig, OfflineGuard};
pub use error::{BirthError, DedupError, MergeOutcome, PteError};
pub use flags::StateFlags;
pub use page_ops::{AnchorId, LockError, PageContent, PageId, PageOps, PAGE_SIZE, PAGE_U32S, ZERO_PAGE};
pub use tree::KeyMode;
