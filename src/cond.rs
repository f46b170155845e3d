//! The tree-structured condition variable.
//!
//! Waiters sleep on distributed sequence counters. In tree mode the first
//! waiter reaching a node carries the wait up to its parent; when it is
//! released from above it bumps the local sequence and requeues the node's
//! own waiters onto the associated mutex, so a broadcast never stampedes
//! the mutex with every waiter at once. The delegation flips happen under
//! the held mutex and need no extra synchronization.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mutex::{Chain, MutexCore, MutexGuard};
use crate::runtime::Runtime;
use crate::topology::{ParentLink, TreeShape};
use crate::wait;

/// How a condition variable spreads its sequence counters over the
/// machine. Chosen per handle at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// One global sequence counter.
    Single,
    /// Counters arranged in the topology tree, one leaf per core.
    /// `two_level` collapses the interior levels into the root alone.
    Tree {
        /// Keep only the per-core leaves and the global root.
        two_level: bool,
    },
    /// A fixed number of counters; callers map to one by core id modulo
    /// the count.
    Sharded(u32),
}

struct CondNode {
    seq: AtomicU32,
    /// A waiter of this node is currently forwarding the wait upstairs.
    delegated: AtomicBool,
    parent: Option<u32>,
}

impl CondNode {
    fn new(parent: Option<u32>) -> Self {
        Self {
            seq: AtomicU32::new(0),
            delegated: AtomicBool::new(false),
            parent,
        }
    }
}

struct Binding {
    id: usize,
    mutex: Weak<MutexCore>,
}

pub(crate) struct CondCore {
    nodes: Box<[CondNode]>,
    mode: Distribution,
    shape: &'static TreeShape,
    bound: OnceLock<Binding>,
}

impl CondCore {
    pub(crate) fn new(mode: Distribution, shape: &'static TreeShape) -> Result<Self> {
        let nodes: Box<[CondNode]> = match mode {
            Distribution::Single => Box::new([CondNode::new(None)]),
            Distribution::Sharded(0) => return Err(Error::InvalidState),
            Distribution::Sharded(k) => (0..k).map(|_| CondNode::new(None)).collect(),
            Distribution::Tree { two_level: false } => (0..shape.len())
                .map(|slot| {
                    CondNode::new(match shape.parent(slot) {
                        ParentLink::Root => None,
                        ParentLink::Slot(p) => Some(p),
                    })
                })
                .collect(),
            Distribution::Tree { two_level: true } => {
                let leaves = shape.len() - shape.interior_len();
                core::iter::once(CondNode::new(None))
                    .chain((0..leaves).map(|_| CondNode::new(Some(0))))
                    .collect()
            }
        };
        Ok(Self {
            nodes,
            mode,
            shape,
            bound: OnceLock::new(),
        })
    }

    /// The node a caller pinned to `core` waits at.
    fn start_node(&self, core: u32) -> Result<usize> {
        match self.mode {
            Distribution::Single => Ok(0),
            Distribution::Sharded(k) => Ok((core % k) as usize),
            Distribution::Tree { two_level: false } => {
                self.shape.leaf_of_core(core).ok_or(Error::InvalidState)
            }
            Distribution::Tree { two_level: true } => {
                let leaf = self.shape.leaf_of_core(core).ok_or(Error::InvalidState)?;
                Ok(1 + (leaf - self.shape.interior_len()))
            }
        }
    }

    /// Binds this condvar to `mutex` on first use; a different mutex later
    /// is a [`Error::MutexMismatch`] and the caller keeps its ownership.
    pub(crate) fn bind(&self, mutex: &Arc<MutexCore>) -> Result<()> {
        let id = Arc::as_ptr(mutex) as usize;
        let bound = self.bound.get_or_init(|| Binding {
            id,
            mutex: Arc::downgrade(mutex),
        });
        if bound.id != id {
            return Err(Error::MutexMismatch);
        }
        Ok(())
    }

    /// Releases `mutex` (held as `chain` by thread `tidx` on `core`),
    /// sleeps until signalled, and re-acquires through the mutex's own
    /// blocking protocol on its root word.
    pub(crate) fn wait_from(
        &self,
        mutex: &MutexCore,
        chain: Chain,
        tidx: u32,
        core: u32,
    ) -> Result<()> {
        let start = self.start_node(core)?;
        self.wait_at(start, mutex, chain, tidx, core)
    }

    fn wait_at(
        &self,
        idx: usize,
        mutex: &MutexCore,
        chain: Chain,
        tidx: u32,
        core: u32,
    ) -> Result<()> {
        let node = &self.nodes[idx];
        if let Some(parent) = node.parent {
            if !node.delegated.load(Relaxed) {
                // first waiter of the episode: forward the wait upstairs,
                // then hand this node's waiters to the mutex on the way
                // back; all flips run under the held mutex
                node.delegated.store(true, Relaxed);
                let upstream = self.wait_at(parent as usize, mutex, chain, tidx, core);
                node.seq.fetch_add(1, SeqCst);
                // the kernel may delay pure requeues past the mutex
                // release, so at least one waiter is woken outright
                let handed_over = wait::requeue(&node.seq, 1, mutex.root_state(), wait::WAKE_ALL);
                node.delegated.store(false, Relaxed);
                upstream?;
                handed_over?;
                return Ok(());
            }
        }

        // the sequence is read under the held mutex: a signal after the
        // release bumps it first and the wait falls through immediately
        let seq = node.seq.load(Acquire);
        let released = mutex.unlock_from(chain, tidx, core);
        if released.is_ok() {
            wait::wait(&node.seq, seq);
        }
        // the caller owns the mutex again even on a failed episode
        mutex.lock_root_direct(core);
        released
    }

    /// Bumps the sequence and wakes one sleeper; every shard in sharded
    /// mode. Safe with no waiters.
    pub(crate) fn signal(&self) -> Result<()> {
        let targets: &[CondNode] = match self.mode {
            Distribution::Sharded(_) => &self.nodes,
            _ => &self.nodes[..1],
        };
        for node in targets {
            node.seq.fetch_add(1, AcqRel);
            wait::wake(&node.seq, 1)?;
        }
        Ok(())
    }

    /// Bumps the sequence, wakes one sleeper, and moves the rest onto the
    /// bound mutex's wait word so they re-acquire one at a time.
    pub(crate) fn broadcast(&self) -> Result<()> {
        let mutex = self.bound.get().and_then(|b| b.mutex.upgrade());
        let targets: &[CondNode] = match self.mode {
            Distribution::Sharded(_) => &self.nodes,
            _ => &self.nodes[..1],
        };
        for node in targets {
            node.seq.fetch_add(1, AcqRel);
            match &mutex {
                // without a binding no thread has ever waited
                None => {}
                Some(mutex) => {
                    wait::requeue(&node.seq, 1, mutex.root_state(), wait::WAKE_ALL)?;
                }
            }
        }
        Ok(())
    }
}

const UNINIT: u32 = 0;
const INITIALIZING: u32 = 1;
const INITIALIZED: u32 = 2;

/// A NUMA-aware condition variable.
///
/// Construction is `const` and allocation-free; the distribution shape is
/// chosen per handle and materialized on first use with the same tag
/// protocol as [`Mutex`](crate::Mutex).
pub struct Condvar {
    tag: AtomicU32,
    mode: Distribution,
    core: UnsafeCell<Option<Box<CondCore>>>,
}

// SAFETY: `core` is written once under the tag protocol and only read
// after the initialized tag is published with release ordering.
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    /// A fully-distributed tree condvar, the default shape.
    pub const fn new() -> Self {
        Self::with_distribution(Distribution::Tree { two_level: false })
    }

    /// A condvar with an explicitly chosen counter distribution.
    pub const fn with_distribution(mode: Distribution) -> Self {
        Self {
            tag: AtomicU32::new(UNINIT),
            mode,
            core: UnsafeCell::new(None),
        }
    }

    fn ensure_core(&self) -> Result<&CondCore> {
        loop {
            match self.tag.load(Acquire) {
                INITIALIZED => {
                    //SAFETY: published once, never replaced while shared
                    let core = unsafe { (*self.core.get()).as_deref() };
                    return core.ok_or(Error::InvalidHandle);
                }
                INITIALIZING => spin_loop(),
                UNINIT => {
                    if self
                        .tag
                        .compare_exchange(UNINIT, INITIALIZING, AcqRel, Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    let built = Runtime::get()
                        .and_then(|rt| CondCore::new(self.mode, rt.shape()));
                    match built {
                        Ok(core) => {
                            //SAFETY: the initializing tag makes this the
                            // only writer; readers spin until the store.
                            unsafe { *self.core.get() = Some(Box::new(core)) };
                            self.tag.store(INITIALIZED, Release);
                        }
                        Err(err) => {
                            self.tag.store(UNINIT, Release);
                            return Err(err);
                        }
                    }
                }
                _ => return Err(Error::InvalidHandle),
            }
        }
    }

    /// Atomically releases the guard's mutex and sleeps until signalled,
    /// then re-acquires the mutex before returning.
    ///
    /// The condvar binds itself to the first mutex it is used with; waiting
    /// with a different one fails with [`Error::MutexMismatch`] and the
    /// caller keeps the mutex locked.
    pub fn wait(&self, guard: &mut MutexGuard<'_>) -> Result<()> {
        let core = self.ensure_core()?;
        let mutex = guard.owner().core_handle()?;
        core.bind(&mutex)?;
        let (tidx, core_id) = guard.ids();
        core.start_node(core_id)?;
        let Some(chain) = guard.take_chain() else {
            return Err(Error::InvalidState);
        };
        let outcome = core.wait_from(&mutex, chain, tidx, core_id);
        // `wait_from` re-acquires the root word on success and failure
        // alike, so the guard's ownership claim stays truthful
        guard.set_chain(Chain::RootOnly);
        outcome
    }

    /// Declared for interface parity; timed waits are not provided.
    pub fn wait_timeout(&self, _guard: &mut MutexGuard<'_>, _timeout: Duration) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Wakes at least one waiter if any are sleeping.
    pub fn signal(&self) -> Result<()> {
        self.ensure_core()?.signal()
    }

    /// Releases every waiter: one is woken, the rest are handed to the
    /// bound mutex's wait queue.
    pub fn broadcast(&self) -> Result<()> {
        self.ensure_core()?.broadcast()
    }

    /// Resets the sequence state and the mutex binding. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        self.tag.store(UNINIT, Release);
        //SAFETY: `&mut self` excludes every concurrent reader
        unsafe { *self.core.get() = None };
        Ok(())
    }
}
