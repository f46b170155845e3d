//! The process-wide runtime the primitives hang off: topology tables, the
//! thread registry, the schedulable-core list, and the worker lifecycle.

use std::cell::RefCell;
use std::env;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use crate::barrier::BarrierCore;
use crate::error::{Error, Result};
use crate::registry::{FuncKey, FuncRecord, Registry, ThreadRecord};
use crate::topology::{parse_id_list, Topology, TreeShape};

/// Environment variable holding the comma/range list of core ids workers
/// are scheduled on. Defaults to every core the topology reports.
pub const CORES_ENV: &str = "TREESYNC_CORES";

/// Environment variable controlling main-thread handling: `0` leaves the
/// main thread alone, `1` or `2` treats it as a worker of the first worker
/// function, and any other value is taken as a literal entry-point
/// identity for it.
pub const MAIN_THREAD_ENV: &str = "TREESYNC_MAIN_THREAD";

/// Entry-point signature for managed workers. The function's address is
/// its identity in the registry.
pub type WorkerFn = fn(usize);

/// Function identity used for threads adopted without a known entry point.
const ANON_FUNC: FuncKey = 0;

enum MainMode {
    Untouched,
    FirstWorker,
    Literal(FuncKey),
}

fn main_mode() -> MainMode {
    let Ok(raw) = env::var(MAIN_THREAD_ENV) else {
        return MainMode::Untouched;
    };
    match raw.trim().parse::<u64>().unwrap_or(0) {
        0 => MainMode::Untouched,
        1 | 2 => MainMode::FirstWorker,
        v => MainMode::Literal(v as usize),
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

/// The singleton every primitive reads its machine view from.
///
/// Built on first use from the topology sources of
/// [`Topology::discover`]; if none of them work, every primitive creation
/// fails with the same [`Error::Topology`].
pub struct Runtime {
    topology: Topology,
    shape: TreeShape,
    registry: Registry,
    cores: Vec<u32>,
    next_core: AtomicUsize,
    /// Main-thread record awaiting its lazily-decided entry point.
    main_patch: Mutex<Option<u32>>,
    barriers: Mutex<Vec<Weak<BarrierCore>>>,
}

static RUNTIME: OnceLock<Result<Runtime>> = OnceLock::new();

impl Runtime {
    /// Returns the process-wide runtime, initializing it on first call.
    ///
    /// The calling thread of the first invocation is treated as the
    /// process's main thread for [`MAIN_THREAD_ENV`] purposes.
    pub fn get() -> Result<&'static Runtime> {
        RUNTIME
            .get_or_init(Runtime::build)
            .as_ref()
            .map_err(Clone::clone)
    }

    fn build() -> Result<Runtime> {
        let topology = Topology::discover()?;
        let shape = TreeShape::new(&topology);
        let registry = Registry::new(topology.core_id_bound());

        let mut cores: Vec<u32> = match env::var(CORES_ENV) {
            Ok(list) => {
                let parsed = parse_id_list(list.trim()).unwrap_or_else(|err| {
                    log::warn!("ignoring unparsable {CORES_ENV}: {err}");
                    Vec::new()
                });
                parsed
                    .into_iter()
                    .filter(|&c| {
                        let known = shape.leaf_of_core(c).is_some();
                        if !known {
                            log::warn!("dropping core {c} from {CORES_ENV}: not in topology");
                        }
                        known
                    })
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        if cores.is_empty() {
            cores = topology.core_ids().collect();
        }
        log::debug!(
            "treesync runtime: {}x{}x{} topology, scheduling on {:?}",
            topology.socket_cnt(),
            topology.node_cnt(),
            topology.core_cnt(),
            cores,
        );

        let runtime = Runtime {
            topology,
            shape,
            registry,
            cores,
            next_core: AtomicUsize::new(0),
            main_patch: Mutex::new(None),
            barriers: Mutex::new(Vec::new()),
        };
        runtime.adopt_main_thread()?;
        Ok(runtime)
    }

    /// Registers the initializing thread per [`MAIN_THREAD_ENV`].
    fn adopt_main_thread(&self) -> Result<()> {
        let mode = main_mode();
        let key = match mode {
            MainMode::Untouched => return Ok(()),
            MainMode::FirstWorker => ANON_FUNC,
            MainMode::Literal(key) => key,
        };
        let core = self.assign_core();
        let (trec, _, _) = self.registry.register_thread(core, key)?;
        if matches!(mode, MainMode::FirstWorker) {
            *self
                .main_patch
                .lock()
                .expect("runtime bookkeeping panicked mid-way") = Some(trec.tidx);
        }
        pin_and_batch(core, &trec);
        CURRENT.with(|c| *c.borrow_mut() = Some(trec));
        Ok(())
    }

    /// The machine topology the runtime settled on.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub(crate) fn shape(&self) -> &TreeShape {
        &self.shape
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    fn assign_core(&self) -> u32 {
        let at = self.next_core.fetch_add(1, Relaxed);
        self.cores[at % self.cores.len()]
    }

    /// Spawns a managed worker: assigns it a core round-robin, registers
    /// it, pins it, switches it to batch scheduling, and publishes its
    /// identity in thread-local storage for leaf lookup.
    pub fn spawn(&'static self, entry: WorkerFn, arg: usize) -> Result<WorkerHandle> {
        let core = self.assign_core();
        let key = entry as usize;
        let (trec, frec, is_new) = self.registry.register_thread(core, key)?;
        if is_new {
            self.notify_new_func(&frec);
        }
        self.notify_new_thread(frec.fidx, core);
        self.patch_main(key)?;

        let tidx = trec.tidx;
        let handle = thread::Builder::new()
            .name(format!("treesync-worker-{tidx}"))
            .spawn(move || {
                pin_and_batch(core, &trec);
                CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&trec)));
                entry(arg);
                if let Err(err) = self.registry.unregister_thread(trec.tidx) {
                    log::warn!("unregistering worker {} failed: {err}", trec.tidx);
                }
            })
            .map_err(|_| Error::ResourceExhausted("worker thread spawn failed"))?;
        Ok(WorkerHandle { handle, tidx })
    }

    /// Applies the deferred main-thread entry identity on the first spawn.
    fn patch_main(&self, key: FuncKey) -> Result<()> {
        let pending = self
            .main_patch
            .lock()
            .expect("runtime bookkeeping panicked mid-way")
            .take();
        let Some(tidx) = pending else { return Ok(()) };
        let (frec, is_new) = self.registry.update_thread_func(tidx, key)?;
        if is_new {
            self.notify_new_func(&frec);
        }
        if let Some(trec) = self.registry.thread(tidx) {
            self.notify_new_thread(frec.fidx, trec.core.load(Relaxed));
        }
        Ok(())
    }

    /// Moves a worker's bookkeeping to another core.
    ///
    /// Pinning is for the thread's lifetime; migration only re-homes the
    /// per-core counts and the leaf the thread will contend on, it is not
    /// a kernel action.
    pub fn migrate(&self, thread_index: u32, new_core: u32) -> Result<()> {
        self.shape
            .leaf_of_core(new_core)
            .ok_or(Error::InvalidState)?;
        self.registry.migrate(thread_index, new_core)
    }

    /// The calling thread's registry record, adopting unmanaged callers on
    /// the spot (without pinning them) so every thread has a leaf.
    pub(crate) fn current_thread(&self) -> Result<Arc<ThreadRecord>> {
        CURRENT.with(|slot| {
            if let Some(trec) = slot.borrow().as_ref() {
                return Ok(Arc::clone(trec));
            }
            let core = self.guess_core();
            let (trec, frec, is_new) = self.registry.register_thread(core, ANON_FUNC)?;
            if is_new {
                self.notify_new_func(&frec);
            }
            self.notify_new_thread(frec.fidx, core);
            *slot.borrow_mut() = Some(Arc::clone(&trec));
            Ok(trec)
        })
    }

    /// Best-effort core for a thread the runtime did not place itself.
    fn guess_core(&self) -> u32 {
        #[cfg(target_os = "linux")]
        {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 && self.shape.leaf_of_core(cpu as u32).is_some() {
                return cpu as u32;
            }
        }
        self.assign_core()
    }

    pub(crate) fn register_barrier(&self, barrier: Weak<BarrierCore>) {
        let mut barriers = self
            .barriers
            .lock()
            .expect("runtime bookkeeping panicked mid-way");
        barriers.retain(|b| b.strong_count() > 0);
        barriers.push(barrier);
    }

    fn notify_new_func(&self, frec: &Arc<FuncRecord>) {
        let barriers = self
            .barriers
            .lock()
            .expect("runtime bookkeeping panicked mid-way");
        for barrier in barriers.iter().filter_map(Weak::upgrade) {
            barrier.add_function(frec);
        }
    }

    fn notify_new_thread(&self, fidx: u32, core: u32) {
        let barriers = self
            .barriers
            .lock()
            .expect("runtime bookkeeping panicked mid-way");
        for barrier in barriers.iter().filter_map(Weak::upgrade) {
            barrier.note_thread(fidx, core);
        }
    }
}

/// Join handle for a managed worker.
pub struct WorkerHandle {
    handle: thread::JoinHandle<()>,
    tidx: u32,
}

impl WorkerHandle {
    /// The worker's stable thread index.
    pub fn thread_index(&self) -> u32 {
        self.tidx
    }

    /// Waits for the worker's entry point to return.
    pub fn join(self) -> Result<()> {
        self.handle.join().map_err(|_| Error::InvalidState)
    }
}

fn pin_and_batch(core: u32, trec: &ThreadRecord) {
    #[cfg(target_os = "linux")]
    trec.kernel_tid.store(unsafe { libc::gettid() }, Relaxed);
    log::debug!(
        "thread {} (tid {}) taking core {core}",
        trec.tidx,
        trec.kernel_tid.load(Relaxed),
    );

    if !core_affinity::set_for_current(core_affinity::CoreId { id: core as usize }) {
        log::warn!("could not pin thread to core {core}; proceeding unpinned");
    }

    #[cfg(target_os = "linux")]
    {
        // batch scheduling trims involuntary preemption of pinned workers
        let param = libc::sched_param { sched_priority: 0 };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_BATCH, &param) };
        if rc != 0 {
            log::debug!("SCHED_BATCH rejected for core {core}");
        }
    }
}
