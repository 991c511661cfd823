//! Process-wide call identifiers.
//!
//! This counter is the only state shared between Communicators. It starts at
//! zero when the process starts and is never reset, so uids stay unique across
//! every connection the process ever holds.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

/// Allocate the next call identifier. The first value handed out is 1.
pub fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed) + 1
}
