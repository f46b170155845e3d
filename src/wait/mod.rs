//! The kernel-assisted blocking facility the tree primitives rely on.
//!
//! Semantics are "sleep while `*word == expected`" plus "wake up to `n`
//! sleepers on `word`" plus "requeue sleepers from one word to another
//! without waking them". On Linux this maps directly onto private futexes.
//! Everywhere else (and under loom) the same contract is emulated with a
//! process-private table of parked threads keyed by word address.
//!
//! All queues are process-private. Returning from [`wait`] carries no
//! guarantee that the word changed; callers re-check and re-enter.

use core::sync::atomic::AtomicU32;

use crate::error::Result;

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        mod generic;
        use generic as imp;
    } else if #[cfg(target_os = "linux")] {
        mod futex;
        use futex as imp;
    } else {
        mod generic;
        use generic as imp;
    }
}

/// Wake every sleeper on the word.
pub(crate) const WAKE_ALL: u32 = i32::MAX as u32;

/// Sleeps until woken or spuriously released, but only if `*addr` still
/// reads `expected` at queue-insert time.
#[inline]
pub(crate) fn wait(addr: &AtomicU32, expected: u32) {
    imp::wait(addr, expected);
}

/// Wakes at most `count` sleepers blocked on `addr`, returning the number
/// actually woken.
#[inline]
pub(crate) fn wake(addr: &AtomicU32, count: u32) -> Result<usize> {
    imp::wake(addr, count)
}

/// Wakes up to `wake` sleepers on `src`, then moves up to `limit` of the
/// remaining sleepers to the queue of `dst` without waking them. Returns
/// the number woken.
#[inline]
pub(crate) fn requeue(src: &AtomicU32, wake: u32, dst: &AtomicU32, limit: u32) -> Result<usize> {
    imp::requeue(src, wake, dst, limit)
}
