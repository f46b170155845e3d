//! A condvar belongs to the first mutex it waits with; a second mutex is
//! refused without giving up the caller's ownership.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;
use std::time::Duration;

use treesync::{Condvar, Distribution, Error, Mutex, TOPOLOGY_FILE_ENV};

fn setup_topology() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let path = std::env::temp_dir().join("treesync-bind-1x1x2.cfg");
        std::fs::write(&path, "s 1,1,2\nn 0\nc 0-1\n").unwrap();
        std::env::set_var(TOPOLOGY_FILE_ENV, &path);
    });
}

static LOCK_A: Mutex = Mutex::new();
static LOCK_B: Mutex = Mutex::new();
static COND: Condvar = Condvar::with_distribution(Distribution::Single);
static FLAG: AtomicUsize = AtomicUsize::new(0);

fn first_waiter(_arg: usize) {
    let mut guard = LOCK_A.lock().unwrap();
    while FLAG.load(SeqCst) == 0 {
        COND.wait(&mut guard).unwrap();
    }
    guard.unlock().unwrap();
}

#[test]
fn second_mutex_is_refused() {
    setup_topology();
    let worker = treesync::spawn(first_waiter, 0).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // the condvar is bound to A now; waiting with B must fail and leave
    // B locked by this thread
    let mut guard_b = LOCK_B.lock().unwrap();
    assert_eq!(COND.wait(&mut guard_b), Err(Error::MutexMismatch));
    guard_b.unlock().unwrap();

    let guard_a = LOCK_A.lock().unwrap();
    FLAG.store(1, SeqCst);
    COND.signal().unwrap();
    guard_a.unlock().unwrap();
    worker.join().unwrap();
}

#[test]
fn timed_wait_is_declared_only() {
    setup_topology();
    let mut guard = LOCK_A.lock().unwrap();
    assert_eq!(
        COND.wait_timeout(&mut guard, Duration::from_millis(5)),
        Err(Error::NotImplemented)
    );
    guard.unlock().unwrap();
}
