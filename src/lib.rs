#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod barrier;
mod cond;
mod error;
// the facade only backs the emulated wait queue; the futex build has no
// use for it
#[cfg(any(loom, not(target_os = "linux")))]
mod loom;
mod mutex;
mod registry;
mod runtime;
mod topology;
mod wait;

pub use barrier::Barrier;
pub use cond::{Condvar, Distribution};
pub use error::{Error, Result};
pub use mutex::{Mutex, MutexGuard};
pub use runtime::{Runtime, WorkerFn, WorkerHandle, CORES_ENV, MAIN_THREAD_ENV};
pub use topology::{Topology, TOPOLOGY_FILE_ENV};

/// Spawns a managed worker thread on the process-wide runtime.
///
/// The worker is assigned a core round-robin from the schedulable list,
/// registered under `entry`'s identity, pinned, and switched to batch
/// scheduling; `entry` then runs with `arg`. See [`Runtime::spawn`].
pub fn spawn(entry: WorkerFn, arg: usize) -> Result<WorkerHandle> {
    Runtime::get()?.spawn(entry, arg)
}
