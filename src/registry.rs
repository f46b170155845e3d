//! Bookkeeping for live worker threads and their entry-point functions.
//!
//! Two tables: threads keyed by their stable index, functions keyed by the
//! entry point's identity. Table membership changes only on thread
//! creation and exit and is serialized by the table locks; the hot fields
//! (per-core and total thread counts) are atomics so the barrier subsystem
//! can read them without taking a lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Identity of a worker entry point: the address of its function.
pub(crate) type FuncKey = usize;

/// Capacity of the function table. Tree barriers keep one sub-tree slot
/// per function, so the bound is shared with them.
pub(crate) const MAX_FUNCS: usize = 32;

/// One live (or exited) worker thread.
pub(crate) struct ThreadRecord {
    /// Stable index, assigned once and never reused.
    pub(crate) tidx: u32,
    /// Kernel thread id, filled in from inside the thread.
    pub(crate) kernel_tid: AtomicI32,
    /// The core this thread is pinned to.
    pub(crate) core: AtomicU32,
    /// Entry-point identity; patched once for a lazily-decided main thread.
    pub(crate) func: AtomicUsize,
    /// Index of the entry point's [`FuncRecord`].
    pub(crate) fidx: AtomicU32,
}

/// Aggregated state of one entry-point function.
pub(crate) struct FuncRecord {
    pub(crate) key: FuncKey,
    pub(crate) fidx: u32,
    /// Thread count per core id.
    per_core: Box<[AtomicU32]>,
    pub(crate) total: AtomicU32,
}

impl FuncRecord {
    pub(crate) fn threads_on_core(&self, core: u32) -> u32 {
        self.per_core
            .get(core as usize)
            .map_or(0, |c| c.load(Acquire))
    }

    fn adjust(&self, core: u32, delta: i32) -> Result<()> {
        let slot = self
            .per_core
            .get(core as usize)
            .ok_or(Error::InvalidState)?;
        if delta >= 0 {
            slot.fetch_add(delta as u32, AcqRel);
            self.total.fetch_add(delta as u32, AcqRel);
        } else {
            slot.fetch_sub(delta.unsigned_abs(), AcqRel);
            self.total.fetch_sub(delta.unsigned_abs(), AcqRel);
        }
        Ok(())
    }
}

pub(crate) struct Registry {
    threads: Mutex<HashMap<u32, Arc<ThreadRecord>>>,
    funcs: Mutex<HashMap<FuncKey, Arc<FuncRecord>>>,
    next_tidx: AtomicU32,
    next_fidx: AtomicU32,
    core_bound: usize,
}

impl Registry {
    pub(crate) fn new(core_bound: usize) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            funcs: Mutex::new(HashMap::with_capacity(MAX_FUNCS)),
            next_tidx: AtomicU32::new(0),
            next_fidx: AtomicU32::new(0),
            core_bound,
        }
    }

    /// Finds or creates the record for `func`. The boolean is true when
    /// the function was first seen just now.
    fn func_record(&self, func: FuncKey) -> Result<(Arc<FuncRecord>, bool)> {
        let mut funcs = self
            .funcs
            .lock()
            .expect("a registry update panicked mid-way");
        match funcs.entry(func) {
            Entry::Occupied(e) => Ok((Arc::clone(e.get()), false)),
            Entry::Vacant(v) => {
                let fidx = self.next_fidx.load(Relaxed);
                if fidx as usize >= MAX_FUNCS {
                    return Err(Error::ResourceExhausted("worker function table is full"));
                }
                self.next_fidx.store(fidx + 1, Relaxed);
                let record = Arc::new(FuncRecord {
                    key: func,
                    fidx,
                    per_core: (0..self.core_bound).map(|_| AtomicU32::new(0)).collect(),
                    total: AtomicU32::new(0),
                });
                v.insert(Arc::clone(&record));
                Ok((record, true))
            }
        }
    }

    /// Registers a new thread pinned to `core` running `func`.
    ///
    /// Returns the thread record, its function record, and whether the
    /// function is new; the caller forwards both facts to the barrier
    /// subsystem so sub-trees appear and counts propagate.
    pub(crate) fn register_thread(
        &self,
        core: u32,
        func: FuncKey,
    ) -> Result<(Arc<ThreadRecord>, Arc<FuncRecord>, bool)> {
        let (frec, is_new) = self.func_record(func)?;
        frec.adjust(core, 1)?;

        let tidx = self.next_tidx.fetch_add(1, Relaxed);
        log::debug!(
            "thread {tidx} registered on core {core} for function {:#x} (fidx {})",
            frec.key,
            frec.fidx,
        );
        let trec = Arc::new(ThreadRecord {
            tidx,
            kernel_tid: AtomicI32::new(0),
            core: AtomicU32::new(core),
            func: AtomicUsize::new(func),
            fidx: AtomicU32::new(frec.fidx),
        });
        self.threads
            .lock()
            .expect("a registry update panicked mid-way")
            .insert(tidx, Arc::clone(&trec));
        Ok((trec, frec, is_new))
    }

    /// One-shot entry-point patch for a thread registered before its entry
    /// point was known (the process's main thread).
    pub(crate) fn update_thread_func(
        &self,
        tidx: u32,
        func: FuncKey,
    ) -> Result<(Arc<FuncRecord>, bool)> {
        let trec = self.thread(tidx).ok_or(Error::InvalidState)?;
        let core = trec.core.load(Acquire);
        let old_key = trec.func.load(Acquire);
        if old_key == func {
            let (frec, _) = self.func_record(func)?;
            return Ok((frec, false));
        }
        let (old, _) = self.func_record(old_key)?;
        let (new, is_new) = self.func_record(func)?;
        old.adjust(core, -1)?;
        new.adjust(core, 1)?;
        trec.func.store(func, Relaxed);
        trec.fidx.store(new.fidx, Relaxed);
        Ok((new, is_new))
    }

    /// Drops a thread from the aggregate counts.
    ///
    /// The record itself stays in the table; reclamation is deferred to
    /// process exit, which the tree primitives never depend on.
    pub(crate) fn unregister_thread(&self, tidx: u32) -> Result<()> {
        let trec = self.thread(tidx).ok_or(Error::InvalidState)?;
        let (frec, _) = self.func_record(trec.func.load(Acquire))?;
        frec.adjust(trec.core.load(Acquire), -1)
    }

    /// Moves a thread's bookkeeping to another core.
    pub(crate) fn migrate(&self, tidx: u32, new_core: u32) -> Result<()> {
        let trec = self.thread(tidx).ok_or(Error::InvalidState)?;
        let (frec, _) = self.func_record(trec.func.load(Acquire))?;
        let old_core = trec.core.swap(new_core, AcqRel);
        if old_core != new_core {
            frec.adjust(old_core, -1)?;
            frec.adjust(new_core, 1)?;
        }
        Ok(())
    }

    pub(crate) fn thread(&self, tidx: u32) -> Option<Arc<ThreadRecord>> {
        self.threads
            .lock()
            .expect("a registry update panicked mid-way")
            .get(&tidx)
            .cloned()
    }

    /// Snapshot of every known entry-point function, in function-index
    /// order.
    pub(crate) fn functions(&self) -> Vec<Arc<FuncRecord>> {
        let funcs = self
            .funcs
            .lock()
            .expect("a registry update panicked mid-way");
        let mut all: Vec<_> = funcs.values().cloned().collect();
        all.sort_by_key(|f| f.fidx);
        all
    }
}
