//! Condvar broadcast with a fully-distributed tree: eight waiters on four
//! cores all return holding the mutex, without stampeding it.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;
use std::time::Duration;

use treesync::{Condvar, Distribution, Mutex, TOPOLOGY_FILE_ENV};

fn setup_topology() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let path = std::env::temp_dir().join("treesync-cond-1x1x4.cfg");
        std::fs::write(&path, "s 1,1,4\nn 0\nc 0-3\n").unwrap();
        std::env::set_var(TOPOLOGY_FILE_ENV, &path);
    });
}

static LOCK: Mutex = Mutex::new();
static COND: Condvar = Condvar::with_distribution(Distribution::Tree { two_level: false });
static FLAG: AtomicUsize = AtomicUsize::new(0);
static RELEASED: AtomicUsize = AtomicUsize::new(0);

fn waiter(_arg: usize) {
    let mut guard = LOCK.lock().unwrap();
    while FLAG.load(SeqCst) == 0 {
        COND.wait(&mut guard).unwrap();
    }
    // the guard is held again on every return from wait
    RELEASED.fetch_add(1, SeqCst);
    guard.unlock().unwrap();
}

#[test]
fn broadcast_releases_every_waiter() {
    setup_topology();
    let workers: Vec<_> = (0..8)
        .map(|i| treesync::spawn(waiter, i).unwrap())
        .collect();

    // give the waiters time to distribute over their leaves
    std::thread::sleep(Duration::from_millis(100));

    let guard = LOCK.lock().unwrap();
    FLAG.store(1, SeqCst);
    COND.broadcast().unwrap();
    guard.unlock().unwrap();

    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(RELEASED.load(SeqCst), 8);
}
