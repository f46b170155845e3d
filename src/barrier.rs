//! The tree-structured barrier.
//!
//! A barrier is one global root node shared by every worker function plus
//! one sub-tree per function whose shape mirrors the machine topology.
//! Threads of a function meet at the leaf of their pinned core, the last
//! arriver promotes the leaf's count to the parent, and so on until the
//! global root releases everyone. Leaves block on their sequence word;
//! interior nodes spin, because interior waits are cross-node and expected
//! to be brief while the last laggards arrive.
//!
//! Episodes are sense-reversed: every node packs its (arrived, sequence)
//! pair into one 64-bit word so the last arriver can publish
//! `{sequence + 1, arrived = 0}` with a single store, and stale waiters
//! either observe the fresh sequence immediately or block on the stale one
//! and get woken.

use core::hint::spin_loop;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::registry::{FuncRecord, Registry, MAX_FUNCS};
use crate::runtime::Runtime;
use crate::topology::{ParentLink, TreeShape};
use crate::wait;

const NOT_READY: u32 = 0;
const READY: u32 = 1;
const INVALID: u32 = 2;

/// Where a barrier node's completion is promoted to.
#[derive(Debug, Clone, Copy)]
enum Up {
    /// The global root itself.
    Detached,
    /// Directly to the global root, skipping the sub-tree's own root.
    GlobalRoot,
    /// To another slot of the same sub-tree.
    Slot(u32),
}

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
struct BarrierNode {
    /// Arrived count in the high half, sequence in the low half.
    state: AtomicU64,
    total: AtomicU32,
    up: Up,
}

impl BarrierNode {
    fn new(up: Up) -> Self {
        Self {
            state: AtomicU64::new(0),
            total: AtomicU32::new(0),
            up,
        }
    }

    fn seq(&self) -> u32 {
        self.state.load(Acquire) as u32
    }

    /// The sequence half of the packed word, addressable for the wait
    /// facility. Only the half that starts at the word's own address keeps
    /// mixed-size operations coherent, so the sequence lives in the low
    /// half and big-endian targets take the second 32-bit word.
    fn seq_word(&self) -> &AtomicU32 {
        let ptr = &self.state as *const AtomicU64 as *const AtomicU32;
        #[cfg(target_endian = "little")]
        unsafe {
            &*ptr
        }
        #[cfg(target_endian = "big")]
        unsafe {
            &*ptr.add(1)
        }
    }

    /// Adds `inc` arrivals; returns the episode's sequence and the arrived
    /// count including this increment.
    fn arrive(&self, inc: u32) -> (u32, u32) {
        let old = self.state.fetch_add(u64::from(inc) << 32, AcqRel);
        (old as u32, (old >> 32) as u32 + inc)
    }

    /// Starts the next episode: zeroes `arrived` and bumps the sequence in
    /// one store.
    fn reset(&self, seq: u32) {
        self.state.store(u64::from(seq.wrapping_add(1)), Release);
    }
}

/// One worker function's private tree. Slot 0 (the shape's root position)
/// is bypassed: its children report straight to the global root.
struct SubTree {
    nodes: Box<[BarrierNode]>,
}

impl SubTree {
    fn build(shape: &TreeShape, frec: &FuncRecord) -> Self {
        let nodes: Box<[BarrierNode]> = (0..shape.len())
            .map(|slot| {
                BarrierNode::new(match shape.parent(slot) {
                    ParentLink::Root => Up::Detached,
                    ParentLink::Slot(0) => Up::GlobalRoot,
                    ParentLink::Slot(p) => Up::Slot(p),
                })
            })
            .collect();
        let tree = Self { nodes };
        for slot in shape.interior_len()..shape.len() {
            let threads = frec.threads_on_core(shape.core_of_leaf(slot));
            if threads > 0 {
                tree.add_threads(slot, threads);
            }
        }
        tree
    }

    /// Adds `count` threads to a leaf and every ancestor below the global
    /// root. The root's own total is the user-declared count and is never
    /// touched here.
    fn add_threads(&self, leaf: usize, count: u32) {
        let mut slot = leaf;
        loop {
            let node = &self.nodes[slot];
            node.total.fetch_add(count, AcqRel);
            match node.up {
                Up::Slot(p) => slot = p as usize,
                Up::GlobalRoot | Up::Detached => break,
            }
        }
    }
}

pub(crate) struct BarrierCore {
    state: AtomicU32,
    declared: u32,
    root: BarrierNode,
    subtrees: Box<[OnceLock<SubTree>]>,
    /// Serializes sub-tree construction against count propagation.
    grow: Mutex<()>,
    shape: &'static TreeShape,
    registry: &'static Registry,
}

impl BarrierCore {
    pub(crate) fn new(
        count: u32,
        shape: &'static TreeShape,
        registry: &'static Registry,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            state: AtomicU32::new(NOT_READY),
            declared: count,
            root: BarrierNode::new(Up::Detached),
            subtrees: (0..MAX_FUNCS).map(|_| OnceLock::new()).collect(),
            grow: Mutex::new(()),
            shape,
            registry,
        });
        core.root.total.store(count, Release);
        for frec in registry.functions() {
            core.add_function(&frec);
        }
        core
    }

    /// Installs the sub-tree for a newly seen worker function.
    pub(crate) fn add_function(&self, frec: &FuncRecord) {
        let _grow = self.grow.lock().expect("barrier growth panicked mid-way");
        if let Some(slot) = self.subtrees.get(frec.fidx as usize) {
            slot.get_or_init(|| SubTree::build(self.shape, frec));
        }
    }

    /// Propagates one new thread of `fidx` pinned to `core` into the
    /// sub-tree totals.
    pub(crate) fn note_thread(&self, fidx: u32, core: u32) {
        let _grow = self.grow.lock().expect("barrier growth panicked mid-way");
        let tree = self.subtrees.get(fidx as usize).and_then(OnceLock::get);
        if let (Some(tree), Some(leaf)) = (tree, self.shape.leaf_of_core(core)) {
            tree.add_threads(leaf, 1);
        }
    }

    fn subtree(&self, fidx: u32) -> Result<&SubTree> {
        let slot = self
            .subtrees
            .get(fidx as usize)
            .ok_or(Error::ResourceExhausted("worker function table is full"))?;
        if let Some(tree) = slot.get() {
            return Ok(tree);
        }
        // built on demand when the function raced past barrier creation
        let _grow = self.grow.lock().expect("barrier growth panicked mid-way");
        let frec = self
            .registry
            .functions()
            .into_iter()
            .find(|f| f.fidx == fidx)
            .ok_or(Error::InvalidState)?;
        Ok(slot.get_or_init(|| SubTree::build(self.shape, &frec)))
    }

    pub(crate) fn wait_from(&self, fidx: u32, core: u32) -> Result<bool> {
        match self.state.load(Acquire) {
            NOT_READY => self.first_episode(),
            READY => self.tree_episode(fidx, core),
            _ => Err(Error::InvalidState),
        }
    }

    /// The collection episode: everyone meets at the global root with the
    /// classical sense-reversing protocol, and the finisher flips the
    /// handle to Ready.
    fn first_episode(&self) -> Result<bool> {
        let (seq, arrived) = self.root.arrive(1);
        if arrived == self.declared {
            // Ready must be published before the release store so that a
            // waiter observing the fresh sequence re-enters in tree mode.
            self.state.store(READY, Release);
            self.root.reset(seq);
            wait::wake(self.root.seq_word(), wait::WAKE_ALL)?;
            return Ok(true);
        }
        if arrived > self.declared {
            return Err(Error::InvalidState);
        }
        while self.root.seq() == seq {
            wait::wait(self.root.seq_word(), seq);
        }
        Ok(false)
    }

    fn tree_episode(&self, fidx: u32, core: u32) -> Result<bool> {
        let tree = self.subtree(fidx)?;
        let leaf = self
            .shape
            .leaf_of_core(core)
            .ok_or(Error::InvalidState)?;
        self.leaf_wait(tree, leaf)
    }

    fn leaf_wait(&self, tree: &SubTree, slot: usize) -> Result<bool> {
        let node = &tree.nodes[slot];
        let total = node.total.load(Acquire);
        let (seq, arrived) = node.arrive(1);
        if arrived < total {
            while node.seq() == seq {
                wait::wait(node.seq_word(), seq);
            }
            return Ok(false);
        }
        if arrived > total {
            return Err(Error::InvalidState);
        }
        let serial = self.promote(tree, node.up, total)?;
        node.reset(seq);
        wait::wake(node.seq_word(), wait::WAKE_ALL)?;
        Ok(serial)
    }

    /// Carries a completed node's count into its parent. Interior waiters
    /// spin instead of blocking.
    fn promote(&self, tree: &SubTree, up: Up, inc: u32) -> Result<bool> {
        let node = match up {
            Up::Detached | Up::GlobalRoot => &self.root,
            Up::Slot(p) => &tree.nodes[p as usize],
        };
        let total = node.total.load(Acquire);
        let (seq, arrived) = node.arrive(inc);
        if arrived < total {
            while node.seq() == seq {
                spin_loop();
            }
            return Ok(false);
        }
        if arrived > total {
            return Err(Error::InvalidState);
        }
        let serial = if matches!(up, Up::Slot(_)) {
            self.promote(tree, node.up, total)?
        } else {
            // the global root completed: this caller is the serial thread
            true
        };
        node.reset(seq);
        Ok(serial)
    }

    pub(crate) fn invalidate(&self) {
        self.state.store(INVALID, Release);
    }

    #[cfg(test)]
    fn leaf_total(&self, fidx: u32, core: u32) -> u32 {
        let tree = self.subtrees[fidx as usize].get().unwrap();
        let leaf = self.shape.leaf_of_core(core).unwrap();
        tree.nodes[leaf].total.load(Acquire)
    }

    #[cfg(test)]
    fn is_ready(&self) -> bool {
        self.state.load(Acquire) == READY
    }
}

/// A NUMA-aware barrier for a fixed number of threads.
///
/// The first wait episode collects the population at the global root; from
/// the second episode on, threads contend only on the leaf of their own
/// core before promoting completion towards the root. Exactly one thread
/// per episode observes the serial result (`Ok(true)`).
///
/// Clones share the same barrier.
#[derive(Clone)]
pub struct Barrier {
    core: Arc<BarrierCore>,
}

impl Barrier {
    /// Creates a barrier releasing once `count` threads wait on it.
    pub fn new(count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidState);
        }
        let rt = Runtime::get()?;
        let core = BarrierCore::new(count, rt.shape(), rt.registry());
        rt.register_barrier(Arc::downgrade(&core));
        Ok(Self { core })
    }

    /// Blocks until `count` threads have called `wait`, then releases them
    /// all. Returns `Ok(true)` for exactly one thread per episode.
    ///
    /// Fails with [`Error::InvalidState`] after [`destroy`](Self::destroy).
    pub fn wait(&self) -> Result<bool> {
        let trec = Runtime::get()?.current_thread()?;
        self.core.wait_from(
            trec.fidx.load(Acquire),
            trec.core.load(Acquire),
        )
    }

    /// Marks the barrier invalid. Late waiters observe
    /// [`Error::InvalidState`]; the node memory stays alive until the last
    /// clone drops, so a wait racing with destroy never touches freed
    /// memory. Destroying twice is a no-op.
    pub fn destroy(&self) -> Result<()> {
        self.core.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use std::thread;

    fn shape_1x1x4() -> (&'static TreeShape, &'static Registry) {
        let topo = Topology::from_parts(1, 1, 4, vec![0], vec![0, 1, 2, 3]).unwrap();
        let shape = Box::leak(Box::new(TreeShape::new(&topo)));
        let registry = Box::leak(Box::new(Registry::new(topo.core_id_bound())));
        (shape, registry)
    }

    const WORKER: usize = 0x1234;

    #[test]
    fn single_thread_is_always_serial() {
        let (shape, registry) = shape_1x1x4();
        registry.register_thread(2, WORKER).unwrap();
        let bar = BarrierCore::new(1, shape, registry);
        // collection episode, then the tree path, twice
        assert!(bar.wait_from(0, 2).unwrap());
        assert!(bar.wait_from(0, 2).unwrap());
        assert!(bar.wait_from(0, 2).unwrap());
    }

    #[test]
    fn first_episode_collects_and_flips_ready() {
        let (shape, registry) = shape_1x1x4();
        for core in 0..4 {
            registry.register_thread(core, WORKER).unwrap();
        }
        let bar = BarrierCore::new(4, shape, registry);

        let serials: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|core| {
                    let bar = &bar;
                    s.spawn(move || bar.wait_from(0, core).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(serials.iter().filter(|&&serial| serial).count(), 1);
        assert!(bar.is_ready());
        for core in 0..4 {
            assert_eq!(bar.leaf_total(0, core), 1);
        }
    }

    #[test]
    fn second_episode_runs_through_leaves() {
        let (shape, registry) = shape_1x1x4();
        for core in 0..4 {
            registry.register_thread(core, WORKER).unwrap();
        }
        let bar = BarrierCore::new(4, shape, registry);

        for _episode in 0..3 {
            let serials: Vec<bool> = thread::scope(|s| {
                let handles: Vec<_> = (0..4)
                    .map(|core| {
                        let bar = &bar;
                        s.spawn(move || bar.wait_from(0, core).unwrap())
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert_eq!(serials.iter().filter(|&&serial| serial).count(), 1);
        }
        // every episode fully drained the root
        assert_eq!(bar.root.state.load(Acquire) >> 32, 0);
    }

    #[test]
    fn threads_sharing_a_core_share_a_leaf() {
        let (shape, registry) = shape_1x1x4();
        registry.register_thread(1, WORKER).unwrap();
        registry.register_thread(1, WORKER).unwrap();
        registry.register_thread(3, WORKER).unwrap();
        let bar = BarrierCore::new(3, shape, registry);
        assert_eq!(bar.leaf_total(0, 1), 2);
        assert_eq!(bar.leaf_total(0, 3), 1);

        let cores = [1u32, 1, 3];
        for _episode in 0..2 {
            let serials: Vec<bool> = thread::scope(|s| {
                let handles: Vec<_> = cores
                    .iter()
                    .map(|&core| {
                        let bar = &bar;
                        s.spawn(move || bar.wait_from(0, core).unwrap())
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert_eq!(serials.iter().filter(|&&serial| serial).count(), 1);
        }
    }

    #[test]
    fn functions_get_private_subtrees() {
        let (shape, registry) = shape_1x1x4();
        registry.register_thread(0, WORKER).unwrap();
        let bar = BarrierCore::new(3, shape, registry);

        // a function registered after barrier creation grows a sub-tree
        let (_, frec, is_new) = registry.register_thread(2, 0x5678).unwrap();
        assert!(is_new);
        bar.add_function(&frec);
        bar.note_thread(frec.fidx, 2);
        assert_eq!(bar.leaf_total(frec.fidx, 2), 1);

        registry.register_thread(2, 0x5678).unwrap();
        bar.note_thread(frec.fidx, 2);
        assert_eq!(bar.leaf_total(frec.fidx, 2), 2);

        let cores = [(0u32, 0u32), (1, 2), (1, 2)];
        for _episode in 0..2 {
            let serials: Vec<bool> = thread::scope(|s| {
                let handles: Vec<_> = cores
                    .iter()
                    .map(|&(fidx, core)| {
                        let bar = &bar;
                        s.spawn(move || bar.wait_from(fidx, core).unwrap())
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert_eq!(serials.iter().filter(|&&serial| serial).count(), 1);
        }
    }

    #[test]
    fn destroyed_barrier_rejects_waiters() {
        let (shape, registry) = shape_1x1x4();
        registry.register_thread(0, WORKER).unwrap();
        let bar = BarrierCore::new(1, shape, registry);
        bar.invalidate();
        bar.invalidate(); // idempotent
        assert_eq!(bar.wait_from(0, 0), Err(Error::InvalidState));
    }
}
