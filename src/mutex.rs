//! The tree-structured mutex.
//!
//! One node per core (leaf) plus the topology's interior nodes. A thread
//! locks the leaf of its pinned core first and promotes the acquisition
//! level by level to the root; ownership of the critical section is
//! holding the root through a chain of locked ancestors. Unlock hands the
//! lock to co-located threads first: the leaf level prefers threads on the
//! same core, interior levels prefer the same node or socket. Release is
//! therefore leaf-to-root, the same order as acquisition, which requires
//! owner tags on every node and a one-bit transfer lock per child to make
//! the hand-off race-free against a concurrent release.
//!
//! Locality beats fairness throughout: an unlocking thread yields to
//! co-located waiters, and remote nodes can starve under sustained local
//! contention.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::topology::{ParentLink, TreeShape};
use crate::wait;

const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const NO_OWNER: u32 = u32::MAX;

/// Bounded spinning before blocking, and before waking on release.
const SPIN_LOCK_LOOPS: usize = 20;
/// Yields after an uncontended leaf acquire so that co-located threads
/// can queue behind the lock while this core still holds it.
const CPU_YIELDS: usize = 10;

// See the cache-line notes in `wait/generic.rs` for the alignment choice.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
struct MutexNode {
    /// Bit 0: locked. Bit 1: some thread blocked waiting.
    state: AtomicU32,
    /// Bumped when a release finds no sleeper; parks throttled unlockers.
    wakeup_seq: AtomicU32,
    /// Thread index at leaves, core id at interior nodes.
    cur_owner: AtomicU32,
    /// Which thread the parent chain currently belongs to.
    next_thr_owner: AtomicU32,
    /// One-bit lock serializing ownership hand-off on this child.
    transfer_lock: AtomicU32,
    parent: ParentLink,
}

impl MutexNode {
    fn new(parent: ParentLink) -> Self {
        Self {
            state: AtomicU32::new(0),
            wakeup_seq: AtomicU32::new(0),
            cur_owner: AtomicU32::new(NO_OWNER),
            next_thr_owner: AtomicU32::new(NO_OWNER),
            transfer_lock: AtomicU32::new(0),
            parent,
        }
    }

    /// Spin a bounded number of times for the locked bit; true on acquire.
    fn spin_acquire(&self) -> bool {
        for _ in 0..SPIN_LOCK_LOOPS {
            if self.state.fetch_or(LOCKED, SeqCst) & LOCKED == 0 {
                return true;
            }
            spin_loop();
        }
        false
    }

    /// Mark contended and block until the locked bit is observed clear.
    fn block_acquire(&self) {
        while self.state.swap(LOCKED | CONTENDED, SeqCst) & LOCKED != 0 {
            wait::wait(&self.state, LOCKED | CONTENDED);
        }
    }
}

/// Which part of the tree a guard holds.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Chain {
    /// The ordinary leaf-to-root acquisition.
    Full,
    /// Only the root word, as re-acquired after a condvar wait.
    RootOnly,
}

pub(crate) struct MutexCore {
    nodes: Box<[MutexNode]>,
    shape: &'static TreeShape,
}

impl MutexCore {
    pub(crate) fn new(shape: &'static TreeShape) -> Arc<Self> {
        let nodes = (0..shape.len())
            .map(|slot| MutexNode::new(shape.parent(slot)))
            .collect();
        Arc::new(Self { nodes, shape })
    }

    fn leaf_of(&self, core: u32) -> Result<usize> {
        self.shape.leaf_of_core(core).ok_or(Error::InvalidState)
    }

    /// The word condvar broadcasts requeue onto and condvar waiters
    /// re-acquire through.
    pub(crate) fn root_state(&self) -> &AtomicU32 {
        &self.nodes[0].state
    }

    pub(crate) fn lock_from(&self, tidx: u32, core: u32) -> Result<()> {
        let leaf_idx = self.leaf_of(core)?;
        let leaf = &self.nodes[leaf_idx];
        if leaf.cur_owner.load(Acquire) != tidx {
            if leaf.state.fetch_or(LOCKED, SeqCst) & LOCKED == 0 {
                leaf.cur_owner.store(tidx, Release);
                // intentional unfairness in favor of locality
                for _ in 0..CPU_YIELDS {
                    thread::yield_now();
                }
            } else {
                if !leaf.spin_acquire() {
                    leaf.block_acquire();
                }
                leaf.cur_owner.store(tidx, Release);
            }
        }
        if let ParentLink::Slot(parent) = leaf.parent {
            self.lock_interior(parent as usize, leaf_idx, tidx, core);
        }
        Ok(())
    }

    /// A single leaf attempt followed by a spin-only climb; the caller
    /// never parks. `false` means the leaf, or an interior above it, is
    /// held by a foreign chain; anything taken on the way up is released
    /// again before returning.
    pub(crate) fn try_lock_from(&self, tidx: u32, core: u32) -> Result<bool> {
        let leaf_idx = self.leaf_of(core)?;
        let leaf = &self.nodes[leaf_idx];
        let took_leaf = leaf.cur_owner.load(Acquire) != tidx;
        if took_leaf {
            if leaf.state.fetch_or(LOCKED, SeqCst) & LOCKED != 0 {
                return Ok(false);
            }
            leaf.cur_owner.store(tidx, Release);
        }

        let mut child_idx = leaf_idx;
        let mut up = leaf.parent;
        while let ParentLink::Slot(parent) = up {
            let idx = parent as usize;
            let node = &self.nodes[idx];
            if !node.spin_acquire() {
                // busy interior: undo the attempt instead of blocking
                if took_leaf {
                    self.try_unwind(leaf_idx, tidx)?;
                } else if child_idx != leaf_idx {
                    if let ParentLink::Slot(first) = leaf.parent {
                        self.unlock_interior(first as usize, leaf_idx, tidx)?;
                    }
                }
                return Ok(false);
            }
            node.cur_owner.store(core, Release);
            self.nodes[child_idx].next_thr_owner.store(tidx, Release);
            child_idx = idx;
            up = node.parent;
        }
        Ok(true)
    }

    /// Releases a partial chain a failed trylock took, leaf first. The
    /// interior recursion stops by itself at the busy boundary because the
    /// attempt never recorded a `next_thr_owner` there; if a co-located
    /// thread takes the leaf the moment it opens, it inherits the taken
    /// interiors through the owner-transfer path and nothing above the
    /// leaf may be touched here.
    fn try_unwind(&self, leaf_idx: usize, tidx: u32) -> Result<()> {
        let leaf = &self.nodes[leaf_idx];
        leaf.cur_owner.store(NO_OWNER, Release);

        if leaf.state.load(Acquire) != LOCKED
            || leaf
                .state
                .compare_exchange(LOCKED, 0, SeqCst, Relaxed)
                .is_err()
        {
            // contended while briefly held
            leaf.state.store(0, SeqCst);
            if wait::wake(&leaf.state, 1)? >= 1 {
                return Ok(());
            }
            leaf.wakeup_seq.fetch_add(1, AcqRel);
            wait::wake(&leaf.wakeup_seq, wait::WAKE_ALL)?;
        }
        if let ParentLink::Slot(parent) = leaf.parent {
            self.unlock_interior(parent as usize, leaf_idx, tidx)?;
        }
        Ok(())
    }

    fn lock_interior(&self, idx: usize, child_idx: usize, tidx: u32, core: u32) {
        let node = &self.nodes[idx];
        let child = &self.nodes[child_idx];

        let mut transferred = false;
        if node.cur_owner.load(Acquire) == core {
            // a thread from this scope held the node recently; take over
            // without releasing it, racing the unlock side for the child's
            // transfer lock
            if child.transfer_lock.swap(1, AcqRel) == 0 {
                if node.cur_owner.load(SeqCst) == core {
                    child.next_thr_owner.store(tidx, Release);
                    transferred = true;
                }
                child.transfer_lock.store(0, Release);
            }
        }

        if !transferred {
            if !node.spin_acquire() {
                node.block_acquire();
            }
            node.cur_owner.store(core, Release);
            child.next_thr_owner.store(tidx, Release);
        }

        // the new owner must record itself on every level above as well
        if let ParentLink::Slot(parent) = node.parent {
            self.lock_interior(parent as usize, idx, tidx, core);
        }
    }

    pub(crate) fn unlock_from(&self, chain: Chain, tidx: u32, core: u32) -> Result<()> {
        match chain {
            Chain::Full => self.unlock_leaf(tidx, core),
            Chain::RootOnly => self.unlock_root_only(),
        }
    }

    fn unlock_leaf(&self, tidx: u32, core: u32) -> Result<()> {
        let leaf_idx = self.leaf_of(core)?;
        let leaf = &self.nodes[leaf_idx];

        leaf.cur_owner.store(NO_OWNER, Release);

        // locked but not contended
        if leaf.state.load(Acquire) == LOCKED
            && leaf
                .state
                .compare_exchange(LOCKED, 0, SeqCst, Relaxed)
                .is_ok()
        {
            if let ParentLink::Slot(parent) = leaf.parent {
                self.unlock_interior(parent as usize, leaf_idx, tidx)?;
            }
            return Ok(());
        }

        // locked and contended; the wakee re-marks contention itself
        let wake_seq = leaf.wakeup_seq.load(Acquire);
        leaf.state.store(0, SeqCst);
        let woken = wait::wake(&leaf.state, 1)?;
        match woken {
            1 => {
                // the lock moved to a co-located thread; park until this
                // core's line of waiters drains so the wakee actually runs
                wait::wait(&leaf.wakeup_seq, wake_seq);
                Ok(())
            }
            0 => {
                // stale contended bit: nobody was waiting after all
                leaf.wakeup_seq.fetch_add(1, AcqRel);
                wait::wake(&leaf.wakeup_seq, wait::WAKE_ALL)?;
                if let ParentLink::Slot(parent) = leaf.parent {
                    self.unlock_interior(parent as usize, leaf_idx, tidx)?;
                }
                Ok(())
            }
            n => {
                log::error!("leaf unlock woke {n} sleepers where at most 1 was requested");
                Err(Error::KernelFault(n as i64))
            }
        }
    }

    fn unlock_interior(&self, idx: usize, child_idx: usize, tidx: u32) -> Result<()> {
        let node = &self.nodes[idx];
        let child = &self.nodes[child_idx];

        if child.transfer_lock.swap(1, AcqRel) != 0 {
            // ownership is being passed to a co-scope sibling; releasing
            // the node now would hand its scope to a foreign chain
            return Ok(());
        }
        if child.next_thr_owner.load(Acquire) != tidx {
            // hand-off already happened
            child.transfer_lock.store(0, Release);
            return Ok(());
        }
        node.cur_owner.store(NO_OWNER, Release);
        child.next_thr_owner.store(NO_OWNER, Release);
        child.transfer_lock.store(0, Release);

        if node.state.load(Acquire) == LOCKED
            && node
                .state
                .compare_exchange(LOCKED, 0, SeqCst, Relaxed)
                .is_ok()
        {
            if let ParentLink::Slot(parent) = node.parent {
                self.unlock_interior(parent as usize, idx, tidx)?;
            }
            return Ok(());
        }

        // contended: clear the locked bit, then give a just-released lock
        // a chance to be re-acquired by a co-located thread before waking
        node.state.fetch_and(!LOCKED, SeqCst);
        for _ in 0..SPIN_LOCK_LOOPS {
            if node.state.load(Acquire) & LOCKED != 0 {
                return Ok(());
            }
            spin_loop();
        }

        node.state.fetch_and(!CONTENDED, SeqCst);
        let woken = wait::wake(&node.state, 1)?;
        match woken {
            1 => Ok(()),
            0 => {
                if let ParentLink::Slot(parent) = node.parent {
                    self.unlock_interior(parent as usize, idx, tidx)?;
                }
                Ok(())
            }
            n => {
                log::error!("interior unlock woke {n} sleepers where at most 1 was requested");
                Err(Error::KernelFault(n as i64))
            }
        }
    }

    /// Condvar re-acquisition: contend for the root word alone with the
    /// blocking protocol. Every full chain ends at the root, so holding it
    /// excludes ordinary lockers.
    pub(crate) fn lock_root_direct(&self, core: u32) {
        let root = &self.nodes[0];
        root.block_acquire();
        root.cur_owner.store(core, Release);
    }

    fn unlock_root_only(&self) -> Result<()> {
        let root = &self.nodes[0];
        root.cur_owner.store(NO_OWNER, Release);

        if root.state.load(Acquire) == LOCKED
            && root
                .state
                .compare_exchange(LOCKED, 0, SeqCst, Relaxed)
                .is_ok()
        {
            return Ok(());
        }

        root.state.fetch_and(!LOCKED, SeqCst);
        for _ in 0..SPIN_LOCK_LOOPS {
            if root.state.load(Acquire) & LOCKED != 0 {
                return Ok(());
            }
            spin_loop();
        }
        root.state.fetch_and(!CONTENDED, SeqCst);
        let woken = wait::wake(&root.state, 1)?;
        match woken {
            0 | 1 => Ok(()),
            n => {
                log::error!("root unlock woke {n} sleepers where at most 1 was requested");
                Err(Error::KernelFault(n as i64))
            }
        }
    }

    #[cfg(test)]
    fn assert_at_rest(&self) {
        for (slot, node) in self.nodes.iter().enumerate() {
            assert_eq!(node.state.load(SeqCst) & LOCKED, 0, "slot {slot} still locked");
            assert_eq!(node.cur_owner.load(SeqCst), NO_OWNER, "slot {slot} still owned");
        }
    }
}

const UNINIT: u32 = 0;
const INITIALIZING: u32 = 1;
const INITIALIZED: u32 = 2;

/// A NUMA-aware mutex.
///
/// Construction is `const` and allocation-free; the node tree is built on
/// first use. The first locker flips the handle's tag from uninitialized
/// to initializing, builds the tree, and publishes the initialized tag,
/// while racing lockers spin-read until they observe it, so a
/// statically-initialized mutex needs no explicit setup call.
pub struct Mutex {
    tag: AtomicU32,
    core: UnsafeCell<Option<Arc<MutexCore>>>,
}

// SAFETY: `core` is written once under the tag protocol and only read
// after the initialized tag is published with release ordering.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Creates an uninitialized mutex. Usable from statics.
    pub const fn new() -> Self {
        Self {
            tag: AtomicU32::new(UNINIT),
            core: UnsafeCell::new(None),
        }
    }

    pub(crate) fn ensure_core(&self) -> Result<&MutexCore> {
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
                    let rt = match Runtime::get() {
                        Ok(rt) => rt,
                        Err(err) => {
                            self.tag.store(UNINIT, Release);
                            return Err(err);
                        }
                    };
                    //SAFETY: the initializing tag makes this thread the
                    // only writer; readers spin until the store below.
                    unsafe { *self.core.get() = Some(MutexCore::new(rt.shape())) };
                    self.tag.store(INITIALIZED, Release);
                }
                _ => return Err(Error::InvalidHandle),
            }
        }
    }

    /// Acquires the mutex, blocking on contention.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        let core = self.ensure_core()?;
        let trec = Runtime::get()?.current_thread()?;
        let (tidx, core_id) = (trec.tidx, trec.core.load(Acquire));
        core.lock_from(tidx, core_id)?;
        Ok(MutexGuard {
            mutex: self,
            chain: Some(Chain::Full),
            tidx,
            core: core_id,
            _not_send: PhantomData,
        })
    }

    /// Attempts the leaf with a single atomic OR and the levels above it
    /// with bounded spins; returns `Ok(None)` when the leaf or an interior
    /// node is held by a foreign chain. Never parks the caller.
    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_>>> {
        let core = self.ensure_core()?;
        let trec = Runtime::get()?.current_thread()?;
        let (tidx, core_id) = (trec.tidx, trec.core.load(Acquire));
        if !core.try_lock_from(tidx, core_id)? {
            return Ok(None);
        }
        Ok(Some(MutexGuard {
            mutex: self,
            chain: Some(Chain::Full),
            tidx,
            core: core_id,
            _not_send: PhantomData,
        }))
    }

    /// Declared for interface parity; timed acquisition is not provided.
    pub fn lock_timeout(&self, _timeout: Duration) -> Result<MutexGuard<'_>> {
        Err(Error::NotImplemented)
    }

    /// Declared for interface parity; explicit destruction is not
    /// provided; dropping the mutex releases its tree.
    pub fn destroy(&self) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// A shared handle on the node tree, used by condvars for binding and
    /// requeueing.
    pub(crate) fn core_handle(&self) -> Result<Arc<MutexCore>> {
        self.ensure_core()?;
        //SAFETY: `ensure_core` observed the initialized tag
        let core = unsafe { (*self.core.get()).as_ref() };
        core.cloned().ok_or(Error::InvalidHandle)
    }
}

/// RAII ownership of a [`Mutex`]; unlocks on drop.
///
/// Guards stay on the locking thread: the release protocol consults the
/// leaf of the core that acquired.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    chain: Option<Chain>,
    tidx: u32,
    core: u32,
    _not_send: PhantomData<*const ()>,
}

impl MutexGuard<'_> {
    /// Releases the mutex, reporting protocol failures that a silent drop
    /// would only log.
    pub fn unlock(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(chain) = self.chain.take() else {
            return Ok(());
        };
        self.mutex
            .ensure_core()?
            .unlock_from(chain, self.tidx, self.core)
    }

    pub(crate) fn ids(&self) -> (u32, u32) {
        (self.tidx, self.core)
    }

    pub(crate) fn owner(&self) -> &Mutex {
        self.mutex
    }

    /// Condvar support: the condvar drives the release itself.
    pub(crate) fn take_chain(&mut self) -> Option<Chain> {
        self.chain.take()
    }

    /// Condvar support: record what the condvar re-acquired.
    pub(crate) fn set_chain(&mut self, chain: Chain) {
        self.chain = Some(chain);
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("mutex unlock failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn tree(sockets: usize, nodes: usize, cores: usize) -> Arc<MutexCore> {
        let total = sockets * nodes * cores;
        let topo = Topology::from_parts(
            sockets,
            nodes,
            cores,
            (0..(sockets * nodes) as u32).collect(),
            (0..total as u32).collect(),
        )
        .unwrap();
        let shape = Box::leak(Box::new(TreeShape::new(&topo)));
        MutexCore::new(shape)
    }

    #[test]
    fn lock_unlock_single_thread() {
        let m = tree(1, 1, 2);
        for _ in 0..3 {
            m.lock_from(0, 0).unwrap();
            m.unlock_from(Chain::Full, 0, 0).unwrap();
        }
        m.assert_at_rest();
    }

    #[test]
    fn try_lock_refuses_foreign_holder() {
        let m = tree(1, 1, 2);
        m.lock_from(0, 0).unwrap();
        // another thread on the same core sees the leaf taken
        assert!(!m.try_lock_from(1, 0).unwrap());
        m.unlock_from(Chain::Full, 0, 0).unwrap();
        assert!(m.try_lock_from(1, 0).unwrap());
        m.unlock_from(Chain::Full, 1, 0).unwrap();
        m.assert_at_rest();
    }

    #[test]
    fn try_lock_backs_off_busy_root() {
        let m = tree(1, 1, 2);
        m.lock_from(0, 0).unwrap();
        // core 1's leaf is free but the root belongs to core 0's chain;
        // the attempt must come straight back instead of parking
        assert!(!m.try_lock_from(1, 1).unwrap());
        // the failed attempt left core 1's leaf free for a real lock
        m.unlock_from(Chain::Full, 0, 0).unwrap();
        assert!(m.try_lock_from(1, 1).unwrap());
        m.unlock_from(Chain::Full, 1, 1).unwrap();
        m.assert_at_rest();
    }

    #[test]
    fn try_lock_unwinds_taken_interiors() {
        // three levels: leaf, node, root; core 0's chain holds the root,
        // so a core 1 attempt takes its leaf and node and must give both
        // back
        let m = tree(1, 2, 1);
        m.lock_from(0, 0).unwrap();
        assert!(!m.try_lock_from(1, 1).unwrap());
        m.unlock_from(Chain::Full, 0, 0).unwrap();

        // nothing stayed latched on the abandoned branch
        assert!(m.try_lock_from(1, 1).unwrap());
        m.unlock_from(Chain::Full, 1, 1).unwrap();
        m.assert_at_rest();

        // a blocking locker on the abandoned branch still gets through
        let woken = AtomicUsize::new(0);
        thread::scope(|s| {
            m.lock_from(0, 0).unwrap();
            assert!(!m.try_lock_from(1, 1).unwrap());
            let (m2, woken2) = (&m, &woken);
            s.spawn(move || {
                m2.lock_from(2, 1).unwrap();
                woken2.fetch_add(1, SeqCst);
                m2.unlock_from(Chain::Full, 2, 1).unwrap();
            });
            thread::sleep(Duration::from_millis(20));
            m.unlock_from(Chain::Full, 0, 0).unwrap();
        });
        assert_eq!(woken.load(SeqCst), 1);
        m.assert_at_rest();
    }

    #[test]
    fn mutual_exclusion_across_cores() {
        let m = tree(2, 2, 2);
        let in_cs = AtomicUsize::new(0);
        let entered = AtomicUsize::new(0);
        const ROUNDS: usize = 200;

        thread::scope(|s| {
            for tidx in 0..8u32 {
                let core = tidx % 8;
                let (m, in_cs, entered) = (&m, &in_cs, &entered);
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        m.lock_from(tidx, core).unwrap();
                        assert_eq!(in_cs.fetch_add(1, SeqCst), 0);
                        entered.fetch_add(1, SeqCst);
                        assert_eq!(in_cs.fetch_sub(1, SeqCst), 1);
                        m.unlock_from(Chain::Full, tidx, core).unwrap();
                    }
                });
            }
        });
        assert_eq!(entered.load(SeqCst), 8 * ROUNDS);
        m.assert_at_rest();
    }

    #[test]
    fn lock_stays_local_before_migrating() {
        // two threads per core on two cores; the yield window must produce
        // at least one same-core hand-off somewhere in the schedule
        let m = tree(1, 1, 2);
        let order = StdMutex::new(Vec::new());
        const ROUNDS: usize = 50;

        thread::scope(|s| {
            for (tidx, core) in [(0u32, 0u32), (1, 0), (2, 1), (3, 1)] {
                let (m, order) = (&m, &order);
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        m.lock_from(tidx, core).unwrap();
                        order.lock().unwrap().push(core);
                        m.unlock_from(Chain::Full, tidx, core).unwrap();
                    }
                });
            }
        });

        let order = order.into_inner().unwrap();
        assert_eq!(order.len(), 4 * ROUNDS);
        assert!(
            order.windows(2).any(|w| w[0] == w[1]),
            "no adjacent same-core holders in {order:?}"
        );
        m.assert_at_rest();
    }

    #[test]
    fn co_located_handoff_keeps_interior_chain() {
        // T0 and T1 share core 0's leaf, T2 sits on core 1; hammering the
        // pair against T2 exercises the owner-transfer path continuously
        let m = tree(1, 2, 1);
        let in_cs = AtomicUsize::new(0);
        const ROUNDS: usize = 300;

        thread::scope(|s| {
            for (tidx, core) in [(0u32, 0u32), (1, 0), (2, 1)] {
                let (m, in_cs) = (&m, &in_cs);
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        m.lock_from(tidx, core).unwrap();
                        assert_eq!(in_cs.fetch_add(1, SeqCst), 0);
                        assert_eq!(in_cs.fetch_sub(1, SeqCst), 1);
                        m.unlock_from(Chain::Full, tidx, core).unwrap();
                    }
                });
            }
        });
        m.assert_at_rest();
    }

    #[test]
    fn root_only_hold_excludes_full_chains() {
        let m = tree(1, 1, 2);
        m.lock_root_direct(0);
        let locked = Arc::new(AtomicUsize::new(0));
        let m2 = Arc::clone(&m);
        let locked2 = Arc::clone(&locked);
        let h = thread::spawn(move || {
            m2.lock_from(1, 1).unwrap();
            locked2.store(1, SeqCst);
            m2.unlock_from(Chain::Full, 1, 1).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(locked.load(SeqCst), 0, "full chain ran inside a root hold");
        m.unlock_from(Chain::RootOnly, 0, 0).unwrap();
        h.join().unwrap();
        assert_eq!(locked.load(SeqCst), 1);
    }
}
